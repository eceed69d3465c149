//! Dispatch workers and the engine facade.
//!
//! The worker is the one place that encodes the fallback order: resolve
//! the session's provider chain once, walk it in order, and write exactly
//! one terminal state back to the queue. Provider-level errors never
//! bubble past the job boundary.

mod engine;
mod pool;
mod selector;
mod sink;
mod worker;

pub use engine::{DispatchEngine, configured_credential_ids, connect_store};
pub use pool::WorkerPool;
pub use selector::SessionModelSelector;
pub use sink::{LogSink, MemorySink, ResultSink};
pub use worker::{DispatchContext, DispatchWorker, ProviderRoute};

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use gd_core::{GradingOutcome, GradingPayload, ProviderError, ProviderId};
    use gd_provider::ProviderClient;
    use serde_json::json;

    /// Provider double with a fixed per-call behavior and call counters.
    pub struct StubProvider {
        id: ProviderId,
        credentials: Vec<String>,
        behavior: Mutex<Behavior>,
        probe_ok: bool,
        delay: Option<Duration>,
        pub probe_calls: AtomicUsize,
        pub invoke_calls: AtomicUsize,
    }

    enum Behavior {
        Succeed,
        Fail(ProviderError),
    }

    impl StubProvider {
        pub fn succeeding(id: ProviderId) -> Self {
            Self {
                id,
                credentials: vec![format!("{id}-key-1")],
                behavior: Mutex::new(Behavior::Succeed),
                probe_ok: true,
                delay: None,
                probe_calls: AtomicUsize::new(0),
                invoke_calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(id: ProviderId, err: ProviderError) -> Self {
            let mut stub = Self::succeeding(id);
            stub.behavior = Mutex::new(Behavior::Fail(err));
            stub
        }

        pub fn unreachable(id: ProviderId) -> Self {
            let mut stub = Self::failing(id, ProviderError::transient(id, "connection failed"));
            stub.probe_ok = false;
            stub
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn invoke_count(&self) -> usize {
            self.invoke_calls.load(Ordering::SeqCst)
        }

        pub fn probe_count(&self) -> usize {
            self.probe_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for StubProvider {
        fn provider_id(&self) -> ProviderId {
            self.id
        }

        fn credential_ids(&self) -> Vec<String> {
            self.credentials.clone()
        }

        async fn invoke(
            &self,
            credential_id: &str,
            _payload: &GradingPayload,
        ) -> Result<GradingOutcome, ProviderError> {
            self.invoke_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &*self.behavior.lock().unwrap() {
                Behavior::Succeed => Ok(GradingOutcome {
                    result: json!({"score": 88}),
                    provider: self.id,
                    credential_id: Some(credential_id.to_string()),
                    latency_ms: 120,
                }),
                Behavior::Fail(err) => Err(err.clone()),
            }
        }

        async fn probe(&self, _timeout: Duration) -> bool {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            self.probe_ok
        }
    }
}
