use crate::types::ProviderId;
use serde::{Deserialize, Serialize};

/// Normalized failure taxonomy for provider calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderErrorKind {
    /// Quota or rate exceeded. Retryable after backoff, with the same or a
    /// different credential.
    Throttled,
    /// Network error, timeout, or 5xx. Retryable.
    Transient,
    /// Malformed input or unsupported content. Not retryable anywhere.
    Permanent,
    /// Bad credential. Not retryable with that credential, retryable with
    /// another via rotation.
    AuthFailure,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Throttled => "throttled",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::AuthFailure => "auth-failure",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A provider call failure, normalized from provider-specific responses.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind} error from provider '{provider}': {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub provider: ProviderId,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, provider: ProviderId, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider,
            message: message.into(),
        }
    }

    pub fn throttled(provider: ProviderId, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Throttled, provider, message)
    }

    pub fn transient(provider: ProviderId, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, provider, message)
    }

    pub fn permanent(provider: ProviderId, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Permanent, provider, message)
    }

    pub fn auth_failure(provider: ProviderId, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::AuthFailure, provider, message)
    }

    /// Whether the fallback chain should advance to the next provider.
    /// `Permanent` is terminal for the job regardless of remaining providers.
    pub fn allows_fallback(&self) -> bool {
        self.kind != ProviderErrorKind::Permanent
    }
}

/// One failed attempt within a fallback chain, kept for diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttemptError {
    pub provider: ProviderId,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl From<&ProviderError> for AttemptError {
    fn from(err: &ProviderError) -> Self {
        Self {
            provider: err.provider,
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

/// Job-terminal dispatch failures. Provider-level errors are handled inside
/// the worker's fallback loop and never bubble past the job boundary; these
/// are the shapes that reach the result sink.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("forced provider '{provider}' is unavailable")]
    ForcedProviderUnavailable { provider: ProviderId },

    /// Every provider in the chain failed. `reason` is the last (most
    /// specific) error; `attempts` keeps the per-provider detail.
    #[error("all providers in the chain failed: {reason}")]
    ChainExhausted {
        reason: String,
        attempts: Vec<AttemptError>,
    },

    #[error("job timed out after {elapsed_ms} ms")]
    JobTimeout { elapsed_ms: u64 },

    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),
}

impl DispatchError {
    /// Taxonomy tag recorded alongside the terminal state.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Self::ForcedProviderUnavailable { .. } => "forced-provider-unavailable",
            Self::ChainExhausted { .. } => "exhausted-chain",
            Self::JobTimeout { .. } => "timeout",
            Self::Provider(err) => err.kind.as_str(),
        }
    }
}
