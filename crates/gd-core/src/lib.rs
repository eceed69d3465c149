//! Shared types for the grading dispatch engine: job model, provider
//! identifiers, and the normalized error taxonomy.

pub mod error;
pub mod types;

pub use error::{AttemptError, DispatchError, ProviderError, ProviderErrorKind};
pub use types::{
    GradingJob, GradingOutcome, GradingPayload, JobResult, JobState, ModelPreference, ProviderChain,
    ProviderId,
};
