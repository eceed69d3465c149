//! Health-reporting wrapper around a provider client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gd_core::{GradingOutcome, GradingPayload, ProviderError, ProviderErrorKind, ProviderId};
use gd_health::{CredentialHealthTracker, OutcomeSample};
use tokio::time::Instant;

use crate::ProviderClient;
use crate::classify::is_quota_exhausted;

/// Wraps a [`ProviderClient`] so every call, success or failure, is
/// reported to the health tracker exactly once with its latency.
pub struct TrackedProvider {
    inner: Arc<dyn ProviderClient>,
    tracker: Arc<CredentialHealthTracker>,
}

impl TrackedProvider {
    pub fn new(inner: Arc<dyn ProviderClient>, tracker: Arc<CredentialHealthTracker>) -> Self {
        Self { inner, tracker }
    }

    pub fn tracker(&self) -> &Arc<CredentialHealthTracker> {
        &self.tracker
    }
}

#[async_trait]
impl ProviderClient for TrackedProvider {
    fn provider_id(&self) -> ProviderId {
        self.inner.provider_id()
    }

    fn credential_ids(&self) -> Vec<String> {
        self.inner.credential_ids()
    }

    async fn invoke(
        &self,
        credential_id: &str,
        payload: &GradingPayload,
    ) -> Result<GradingOutcome, ProviderError> {
        let started = Instant::now();
        let result = self.inner.invoke(credential_id, payload).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let sample = match &result {
            Ok(outcome) => OutcomeSample::success(outcome.latency_ms.max(latency_ms)),
            Err(err) => {
                let throttled = err.kind == ProviderErrorKind::Throttled;
                OutcomeSample {
                    success: false,
                    latency_ms,
                    throttled,
                    quota_exhausted: throttled && is_quota_exhausted(&err.message),
                }
            }
        };
        self.tracker.record_outcome(credential_id, sample).await;
        result
    }

    async fn probe(&self, timeout: Duration) -> bool {
        self.inner.probe(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotator::tests::ScriptedProvider;
    use gd_store::MemoryStore;
    use serde_json::json;

    fn payload() -> GradingPayload {
        GradingPayload {
            file_text: "essay".into(),
            rubric: json!({}),
        }
    }

    fn tracker() -> Arc<CredentialHealthTracker> {
        Arc::new(CredentialHealthTracker::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn test_success_recorded_to_tracker() {
        let inner = Arc::new(ScriptedProvider::succeeding(ProviderId::Local, "key-1"));
        let tracker = tracker();
        let tracked = TrackedProvider::new(inner, tracker.clone());

        tracked.invoke("key-1", &payload()).await.unwrap();

        let snapshot = tracker.snapshot(&["key-1".to_string()]).await;
        assert_eq!(snapshot[0].success_count, 1);
        assert_eq!(snapshot[0].failure_count, 0);
    }

    #[tokio::test]
    async fn test_throttled_failure_starts_cooldown() {
        let inner = Arc::new(ScriptedProvider::failing(
            ProviderId::PrimaryCloud,
            "key-1",
            ProviderError::throttled(ProviderId::PrimaryCloud, "status 429: slow down"),
        ));
        let tracker = tracker();
        let tracked = TrackedProvider::new(inner, tracker.clone());

        let err = tracked.invoke("key-1", &payload()).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Throttled);
        assert!(tracker.select_best(&["key-1".to_string()]).await.is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_counts_without_cooldown() {
        let inner = Arc::new(ScriptedProvider::failing(
            ProviderId::SecondaryCloud,
            "key-1",
            ProviderError::transient(ProviderId::SecondaryCloud, "status 503"),
        ));
        let tracker = tracker();
        let tracked = TrackedProvider::new(inner, tracker.clone());

        tracked.invoke("key-1", &payload()).await.unwrap_err();

        let snapshot = tracker.snapshot(&["key-1".to_string()]).await;
        assert_eq!(snapshot[0].failure_count, 1);
        // No throttle, so the credential stays selectable.
        assert_eq!(
            tracker.select_best(&["key-1".to_string()]).await.as_deref(),
            Some("key-1")
        );
    }
}
