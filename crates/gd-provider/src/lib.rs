//! Provider client adapters.
//!
//! Each provider endpoint speaks its own dialect; everything past this
//! crate sees only `GradingOutcome` or the normalized `ProviderError`
//! taxonomy. The health tracker is fed from exactly one place here
//! ([`TrackedProvider`]), so an outcome is never double-counted.

mod classify;
mod gemini;
mod http;
mod rotator;
mod tracked;

use std::time::Duration;

use async_trait::async_trait;
use gd_core::{GradingOutcome, GradingPayload, ProviderError, ProviderId};

pub use gemini::GeminiProvider;
pub use http::{Credential, HttpProvider};
pub use rotator::CredentialRotator;
pub use tracked::TrackedProvider;

/// One provider endpoint with its registered credentials.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider_id(&self) -> ProviderId;

    /// Credential ids registered with this provider, in configuration order.
    fn credential_ids(&self) -> Vec<String>;

    /// Issue one grading call with the given credential.
    async fn invoke(
        &self,
        credential_id: &str,
        payload: &GradingPayload,
    ) -> Result<GradingOutcome, ProviderError>;

    /// Lightweight capability check used by the session selector. Cloud
    /// providers are assumed reachable; only the local model overrides this.
    async fn probe(&self, _timeout: Duration) -> bool {
        true
    }
}
