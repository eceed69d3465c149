//! The per-job dispatch state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gd_core::{
    AttemptError, DispatchError, GradingJob, GradingOutcome, GradingPayload, JobResult,
    ProviderError, ProviderErrorKind, ProviderId,
};
use gd_provider::{CredentialRotator, ProviderClient, TrackedProvider};
use gd_queue::AdmissionQueue;
use tokio::time::Instant;
use tracing::warn;

use crate::selector::SessionModelSelector;
use crate::sink::ResultSink;

/// How a worker reaches one provider. Multi-credential providers go
/// through the rotator; single-credential providers call the adapter
/// directly with their one credential.
pub enum ProviderRoute {
    Single(TrackedProvider),
    Rotated(CredentialRotator),
}

impl ProviderRoute {
    /// Resolve the credential for the next attempt without invoking, so
    /// the job record can carry it even when the call fails.
    async fn pick_credential(&self) -> Result<String, ProviderError> {
        match self {
            Self::Single(provider) => {
                provider.credential_ids().into_iter().next().ok_or_else(|| {
                    ProviderError::auth_failure(provider.provider_id(), "no credential configured")
                })
            }
            Self::Rotated(rotator) => rotator.pick().await,
        }
    }

    async fn dispatch(
        &self,
        credential_id: &str,
        payload: &GradingPayload,
    ) -> Result<GradingOutcome, ProviderError> {
        match self {
            Self::Single(provider) => provider.invoke(credential_id, payload).await,
            Self::Rotated(rotator) => rotator.provider().invoke(credential_id, payload).await,
        }
    }
}

/// Everything a worker needs, shared across the pool.
pub struct DispatchContext {
    pub queue: Arc<AdmissionQueue>,
    pub selector: Arc<SessionModelSelector>,
    pub routes: HashMap<ProviderId, ProviderRoute>,
    pub sink: Arc<dyn ResultSink>,
    pub provider_timeout: Duration,
    pub job_timeout: Duration,
}

pub struct DispatchWorker {
    ctx: Arc<DispatchContext>,
}

impl DispatchWorker {
    pub fn new(ctx: Arc<DispatchContext>) -> Self {
        Self { ctx }
    }

    /// Run one job to a terminal state. Never returns an error: every
    /// failure mode ends as a `failed` job record plus a sink write.
    pub async fn process(&self, job: GradingJob) {
        let started = Instant::now();

        let chain = match self
            .ctx
            .selector
            .select_chain(&job.session_id, job.model_preference)
            .await
        {
            Ok(chain) => chain,
            Err(err) => {
                self.finish_failed(&job, &err).await;
                return;
            }
        };

        let mut attempts: Vec<AttemptError> = Vec::new();
        for provider in chain {
            let elapsed = started.elapsed();
            if elapsed >= self.ctx.job_timeout {
                let err = DispatchError::JobTimeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                };
                self.finish_failed(&job, &err).await;
                return;
            }

            let Some(route) = self.ctx.routes.get(&provider) else {
                attempts.push(AttemptError {
                    provider,
                    kind: ProviderErrorKind::Transient,
                    message: "provider not configured".to_string(),
                });
                continue;
            };

            let credential = match route.pick_credential().await {
                Ok(credential) => credential,
                Err(err) => {
                    self.ctx.queue.note_attempt(job.id, provider, None);
                    if !err.allows_fallback() {
                        let err = DispatchError::Provider(err);
                        self.finish_failed(&job, &err).await;
                        return;
                    }
                    warn!(job_id = %job.id, provider = %provider, error = %err, "credential selection failed, advancing chain");
                    attempts.push(AttemptError::from(&err));
                    continue;
                }
            };
            self.ctx.queue.note_attempt(job.id, provider, Some(&credential));
            let budget = self.ctx.provider_timeout.min(self.ctx.job_timeout - elapsed);

            match tokio::time::timeout(budget, route.dispatch(&credential, &job.payload)).await {
                Ok(Ok(outcome)) => {
                    self.finish_completed(&job, outcome).await;
                    return;
                }
                Ok(Err(err)) => {
                    if !err.allows_fallback() {
                        let err = DispatchError::Provider(err);
                        self.finish_failed(&job, &err).await;
                        return;
                    }
                    warn!(job_id = %job.id, provider = %provider, error = %err, "provider attempt failed, advancing chain");
                    attempts.push(AttemptError::from(&err));
                }
                Err(_) => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.ctx.job_timeout {
                        let err = DispatchError::JobTimeout {
                            elapsed_ms: elapsed.as_millis() as u64,
                        };
                        self.finish_failed(&job, &err).await;
                        return;
                    }
                    warn!(job_id = %job.id, provider = %provider, "provider call timed out, advancing chain");
                    attempts.push(AttemptError {
                        provider,
                        kind: ProviderErrorKind::Transient,
                        message: format!("provider call timed out after {} ms", budget.as_millis()),
                    });
                }
            }
        }

        // The most specific error is the last one attempted.
        let reason = attempts
            .last()
            .map(|attempt| attempt.message.clone())
            .unwrap_or_else(|| "no provider available".to_string());
        let err = DispatchError::ChainExhausted { reason, attempts };
        self.finish_failed(&job, &err).await;
    }

    async fn finish_completed(&self, job: &GradingJob, outcome: GradingOutcome) {
        // Terminal transitions are write-once; a second arrival is a no-op
        // and must not reach the sink twice.
        if self.ctx.queue.complete(job.id, &outcome) {
            let result = JobResult::Completed { outcome };
            self.ctx.sink.persist_result(job.id, &result).await;
        }
    }

    async fn finish_failed(&self, job: &GradingJob, err: &DispatchError) {
        if self.ctx.queue.fail(job.id, err.kind_tag(), &err.to_string()) {
            let result = JobResult::Failed {
                kind: err.kind_tag().to_string(),
                message: err.to_string(),
            };
            self.ctx.sink.persist_result(job.id, &result).await;
        }
    }
}
