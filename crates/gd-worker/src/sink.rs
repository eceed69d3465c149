//! Terminal-result sinks. The sink owns durability; the dispatcher owns
//! only in-flight state.

use std::sync::Mutex;

use async_trait::async_trait;
use gd_core::JobResult;
use tracing::info;
use ulid::Ulid;

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Called once per job on its terminal transition.
    async fn persist_result(&self, job_id: Ulid, result: &JobResult);
}

/// Writes terminal results to the log stream. Default for the daemon when
/// no external sink is wired in.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn persist_result(&self, job_id: Ulid, result: &JobResult) {
        match result {
            JobResult::Completed { outcome } => {
                info!(
                    job_id = %job_id,
                    provider = %outcome.provider,
                    latency_ms = outcome.latency_ms,
                    "job completed"
                );
            }
            JobResult::Failed { kind, message } => {
                info!(job_id = %job_id, kind, message, "job failed");
            }
        }
    }
}

/// Collects terminal results in memory, for tests and embedders that poll.
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<Vec<(Ulid, JobResult)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<(Ulid, JobResult)> {
        self.results
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn result_for(&self, job_id: Ulid) -> Option<JobResult> {
        self.results()
            .into_iter()
            .find(|(id, _)| *id == job_id)
            .map(|(_, result)| result)
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn persist_result(&self, job_id: Ulid, result: &JobResult) {
        if let Ok(mut guard) = self.results.lock() {
            guard.push((job_id, result.clone()));
        }
    }
}
