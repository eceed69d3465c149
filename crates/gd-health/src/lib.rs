//! Per-credential health tracking with cross-instance coordination.
//!
//! One hash per credential lives in the coordination store, so every
//! worker in every process instance sees the same success/failure counts
//! and throttle cooldowns. Selection takes a short NX lock to keep two
//! workers from picking the same strained credential at the same moment;
//! if the lock cannot be won the tracker degrades to a deterministic
//! lock-free pick rather than failing.
//!
//! Store key schema:
//! - `grading:cred:{id}:health`  → hash with raw counters
//! - `grading:cred:select:lock`  → NX lock around selection

mod score;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gd_store::CoordinationStore;
use tracing::{debug, warn};

pub use score::{CredentialHealth, HealthSummary};

const SELECTION_LOCK_KEY: &str = "grading:cred:select:lock";
const SELECTION_LOCK_TTL: Duration = Duration::from_secs(1);
const RECORD_TTL: Duration = Duration::from_secs(86_400);

const BASE_COOLDOWN_MS: u64 = 10_000;
const MAX_COOLDOWN_MS: u64 = 3_600_000;
/// Hard quota exhaustion (daily limits) gets a floor of 4 hours.
const QUOTA_COOLDOWN_MS: u64 = 14_400_000;

fn health_key(credential_id: &str) -> String {
    format!("grading:cred:{credential_id}:health")
}

/// One observed provider call, as reported by the adapter.
#[derive(Debug, Clone, Copy)]
pub struct OutcomeSample {
    pub success: bool,
    pub latency_ms: u64,
    /// The call failed with a rate/quota/overload signal.
    pub throttled: bool,
    /// Hard daily-quota exhaustion, distinct from per-minute throttling.
    pub quota_exhausted: bool,
}

impl OutcomeSample {
    pub fn success(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
            throttled: false,
            quota_exhausted: false,
        }
    }

    pub fn failure(latency_ms: u64, throttled: bool) -> Self {
        Self {
            success: false,
            latency_ms,
            throttled,
            quota_exhausted: false,
        }
    }
}

/// Tracks health records for provider credentials.
///
/// All operations are best-effort: a store outage degrades selection to
/// neutral behavior with a warning instead of propagating the error, so
/// the dispatch path never fails because the health store hiccuped.
pub struct CredentialHealthTracker {
    store: Arc<dyn CoordinationStore>,
}

impl CredentialHealthTracker {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Record one call outcome atomically. Success resets the failure
    /// streak and any throttle; a throttling failure starts (or extends)
    /// an exponential cooldown.
    pub async fn record_outcome(&self, credential_id: &str, sample: OutcomeSample) {
        let key = health_key(credential_id);
        let now_ms = Utc::now().timestamp_millis();

        let result = if sample.success {
            self.record_success(&key, now_ms, sample.latency_ms).await
        } else {
            self.record_failure(&key, credential_id, now_ms, sample).await
        };

        if let Err(err) = result {
            warn!(credential = credential_id, error = %err, "failed to record credential outcome");
            return;
        }
        if let Err(err) = self.store.expire(&key, RECORD_TTL).await {
            warn!(credential = credential_id, error = %err, "failed to refresh health record ttl");
        }
    }

    async fn record_success(&self, key: &str, now_ms: i64, latency_ms: u64) -> Result<(), gd_store::StoreError> {
        self.store.hash_incr(key, "success_count", 1).await?;
        self.store.hash_incr(key, "request_count", 1).await?;
        self.store
            .hash_incr(key, "total_response_ms", latency_ms as i64)
            .await?;
        self.store
            .hash_set(
                key,
                &[
                    ("failure_count", "0".to_string()),
                    ("throttled_until", "0".to_string()),
                    ("last_used_at", now_ms.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        key: &str,
        credential_id: &str,
        now_ms: i64,
        sample: OutcomeSample,
    ) -> Result<(), gd_store::StoreError> {
        let failures = self.store.hash_incr(key, "failure_count", 1).await?;

        if sample.throttled || sample.quota_exhausted {
            // Exponential backoff: 10s, 20s, 40s... capped at 1h.
            let exponent = failures.saturating_sub(1).min(31) as u32;
            let mut cooldown_ms = BASE_COOLDOWN_MS
                .saturating_mul(1u64 << exponent)
                .min(MAX_COOLDOWN_MS);
            if sample.quota_exhausted {
                cooldown_ms = cooldown_ms.max(QUOTA_COOLDOWN_MS);
            }
            let throttled_until = now_ms + cooldown_ms as i64;
            self.store
                .hash_set(
                    key,
                    &[
                        ("throttled_until", throttled_until.to_string()),
                        ("last_used_at", now_ms.to_string()),
                    ],
                )
                .await?;
            warn!(
                credential = credential_id,
                consecutive_failures = failures,
                cooldown_ms,
                "credential throttled"
            );
        } else {
            self.store
                .hash_set(key, &[("last_used_at", now_ms.to_string())])
                .await?;
            debug!(credential = credential_id, failures, "recorded credential failure");
        }
        Ok(())
    }

    /// Pick the highest-scoring non-throttled candidate; ties go to the
    /// least-recently-used credential to spread load. `None` means every
    /// candidate is inside its cooldown and the caller must delay rather
    /// than burn a call.
    pub async fn select_best(&self, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let locked = self.acquire_selection_lock().await;
        let picked = self.pick_available(candidates).await;
        if locked {
            if let Err(err) = self.store.unlock(SELECTION_LOCK_KEY).await {
                warn!(error = %err, "failed to release credential selection lock");
            }
        }

        match &picked {
            Some(id) => debug!(credential = %id, "selected credential"),
            None => warn!(candidates = candidates.len(), "all credentials throttled"),
        }
        picked
    }

    async fn acquire_selection_lock(&self) -> bool {
        for attempt in 0..3u32 {
            match self.store.try_lock(SELECTION_LOCK_KEY, SELECTION_LOCK_TTL).await {
                Ok(true) => return true,
                Ok(false) => {
                    tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                }
                Err(err) => {
                    warn!(error = %err, "selection lock unavailable, continuing without it");
                    return false;
                }
            }
        }
        // Contention fallback: proceed lock-free with the same deterministic
        // ordering (LRU among non-throttled) so the load still spreads.
        false
    }

    async fn pick_available(&self, candidates: &[String]) -> Option<String> {
        let now_ms = Utc::now().timestamp_millis();
        let mut available: Vec<CredentialHealth> = Vec::with_capacity(candidates.len());
        for metrics in self.snapshot(candidates).await {
            if !metrics.is_throttled(now_ms) {
                available.push(metrics);
            }
        }
        // Bucket the score so near-identical credentials fall through to
        // the LRU tie-break instead of competing on float noise.
        available.sort_by(|a, b| {
            let a_bucket = (a.health_score * 1_000.0).round() as i64;
            let b_bucket = (b.health_score * 1_000.0).round() as i64;
            b_bucket
                .cmp(&a_bucket)
                .then(a.last_used_at.cmp(&b.last_used_at))
        });
        available.first().map(|m| m.credential_id.clone())
    }

    /// Derived metrics for every candidate, lazily initializing unknown
    /// credentials with neutral priors.
    pub async fn snapshot(&self, candidates: &[String]) -> Vec<CredentialHealth> {
        let mut out = Vec::with_capacity(candidates.len());
        for credential_id in candidates {
            let fields = match self.store.hash_get_all(&health_key(credential_id)).await {
                Ok(fields) => fields,
                Err(err) => {
                    warn!(credential = %credential_id, error = %err, "health record unavailable, using neutral priors");
                    Default::default()
                }
            };
            out.push(CredentialHealth::from_fields(credential_id.clone(), &fields));
        }
        out
    }

    /// Aggregate counters for operational dashboards.
    pub async fn summary_stats(&self, candidates: &[String]) -> HealthSummary {
        HealthSummary::from_metrics(&self.snapshot(candidates).await)
    }

    /// Administrative: force a cooldown on a credential.
    pub async fn mark_throttled(&self, credential_id: &str, cooldown: Duration) {
        let until = Utc::now().timestamp_millis() + cooldown.as_millis() as i64;
        if let Err(err) = self
            .store
            .hash_set(&health_key(credential_id), &[("throttled_until", until.to_string())])
            .await
        {
            warn!(credential = credential_id, error = %err, "failed to mark credential throttled");
        }
    }

    /// Administrative: clear a cooldown early.
    pub async fn clear_throttle(&self, credential_id: &str) {
        if let Err(err) = self
            .store
            .hash_set(&health_key(credential_id), &[("throttled_until", "0".to_string())])
            .await
        {
            warn!(credential = credential_id, error = %err, "failed to clear credential throttle");
        }
    }

    /// Administrative: wipe a credential's history back to neutral priors.
    pub async fn reset(&self, credential_id: &str) {
        if let Err(err) = self.store.delete(&health_key(credential_id)).await {
            warn!(credential = credential_id, error = %err, "failed to reset credential health");
        }
    }
}
