//! Credential rotation for multi-credential providers.

use gd_core::{GradingOutcome, GradingPayload, ProviderError};
use tracing::debug;

use crate::{ProviderClient, TrackedProvider};

/// Picks the healthiest credential before each call. When every credential
/// is cooling down this fails fast with `Throttled` instead of burning a
/// call that is certain to be rejected.
///
/// Single-credential providers bypass this and call the adapter directly.
pub struct CredentialRotator {
    provider: TrackedProvider,
}

impl CredentialRotator {
    pub fn new(provider: TrackedProvider) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &TrackedProvider {
        &self.provider
    }

    /// Resolve the healthiest credential without invoking the provider,
    /// so callers can record which credential an attempt went to.
    pub async fn pick(&self) -> Result<String, ProviderError> {
        let candidates = self.provider.credential_ids();
        let Some(credential_id) = self.provider.tracker().select_best(&candidates).await else {
            return Err(ProviderError::throttled(
                self.provider.provider_id(),
                format!("all {} credentials are cooling down", candidates.len()),
            ));
        };
        debug!(provider = %self.provider.provider_id(), credential = %credential_id, "rotator picked credential");
        Ok(credential_id)
    }

    pub async fn with_credential(
        &self,
        payload: &GradingPayload,
    ) -> Result<GradingOutcome, ProviderError> {
        let credential_id = self.pick().await?;
        self.provider.invoke(&credential_id, payload).await
    }
}
