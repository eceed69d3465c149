//! Engine facade: wires config, store, providers, queue, and the pool.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use gd_config::DispatchConfig;
use gd_core::{GradingJob, GradingPayload, ModelPreference, ProviderChain, ProviderId};
use gd_health::{CredentialHealth, CredentialHealthTracker, HealthSummary};
use gd_provider::{
    Credential, CredentialRotator, GeminiProvider, HttpProvider, ProviderClient, TrackedProvider,
};
use gd_queue::{AdmissionQueue, QueueStatus};
use gd_store::{CoordinationStore, MemoryStore, RedisStore};
use serde_json::Value;
use tracing::info;
use ulid::Ulid;

use crate::pool::WorkerPool;
use crate::selector::SessionModelSelector;
use crate::sink::ResultSink;
use crate::worker::{DispatchContext, ProviderRoute};

/// Redis when a URL is configured, otherwise the in-process store
/// (single-instance mode).
pub async fn connect_store(config: &DispatchConfig) -> Result<Arc<dyn CoordinationStore>> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .context("failed to connect to the coordination store")?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Credential ids as the engine registers them, in configuration order.
/// Key material itself never leaves the config.
pub fn configured_credential_ids(config: &DispatchConfig) -> Vec<String> {
    let mut ids = Vec::new();
    if config.providers.local.is_some() {
        ids.push("local-key-1".to_string());
    }
    if let Some(primary) = &config.providers.primary {
        for index in 1..=primary.api_keys.len().max(1) {
            ids.push(format!("primary-key-{index}"));
        }
    }
    if config.providers.secondary.is_some() {
        ids.push("secondary-key-1".to_string());
    }
    ids
}

/// The whole dispatch engine behind one handle: job intake, status and
/// health snapshots for the dashboard, session lifecycle, shutdown.
pub struct DispatchEngine {
    ctx: Arc<DispatchContext>,
    tracker: Arc<CredentialHealthTracker>,
    credential_ids: Vec<String>,
    pool: WorkerPool,
}

impl DispatchEngine {
    pub async fn start(
        config: &DispatchConfig,
        store: Arc<dyn CoordinationStore>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        config.validate()?;
        let tracker = Arc::new(CredentialHealthTracker::new(store.clone()));

        let mut routes: HashMap<ProviderId, ProviderRoute> = HashMap::new();
        let credential_ids = configured_credential_ids(config);
        let mut cloud_chain: ProviderChain = Vec::new();
        let mut local_probe: Option<Arc<dyn ProviderClient>> = None;

        if let Some(local) = &config.providers.local {
            let credential = Credential {
                id: "local-key-1".to_string(),
                api_key: local.api_key.clone().unwrap_or_default(),
            };
            let provider = Arc::new(HttpProvider::new(
                ProviderId::Local,
                &local.base_url,
                &local.model,
                vec![credential],
                config.provider_timeout(),
            )?);
            local_probe = Some(provider.clone() as Arc<dyn ProviderClient>);
            routes.insert(
                ProviderId::Local,
                ProviderRoute::Single(TrackedProvider::new(provider, tracker.clone())),
            );
        }

        if let Some(primary) = &config.providers.primary {
            let credentials: Vec<Credential> = primary
                .api_keys
                .iter()
                .enumerate()
                .map(|(index, api_key)| Credential {
                    id: format!("primary-key-{}", index + 1),
                    api_key: api_key.clone(),
                })
                .collect();
            let provider = Arc::new(GeminiProvider::new(
                &primary.base_url,
                &primary.model,
                credentials,
                config.provider_timeout(),
            )?);
            cloud_chain.push(ProviderId::PrimaryCloud);
            routes.insert(
                ProviderId::PrimaryCloud,
                ProviderRoute::Rotated(CredentialRotator::new(TrackedProvider::new(
                    provider,
                    tracker.clone(),
                ))),
            );
        }

        if let Some(secondary) = &config.providers.secondary {
            let credential = Credential {
                id: "secondary-key-1".to_string(),
                api_key: secondary.api_key.clone().unwrap_or_default(),
            };
            let provider = Arc::new(HttpProvider::new(
                ProviderId::SecondaryCloud,
                &secondary.base_url,
                &secondary.model,
                vec![credential],
                config.provider_timeout(),
            )?);
            cloud_chain.push(ProviderId::SecondaryCloud);
            routes.insert(
                ProviderId::SecondaryCloud,
                ProviderRoute::Single(TrackedProvider::new(provider, tracker.clone())),
            );
        }

        let selector = Arc::new(SessionModelSelector::new(
            local_probe,
            cloud_chain,
            config.model_preference,
            config.probe_timeout(),
        ));
        let queue = Arc::new(AdmissionQueue::new(
            store,
            config.max_concurrency,
            config.rate_ceiling,
            config.rate_window(),
            config.poll_interval(),
        ));

        let ctx = Arc::new(DispatchContext {
            queue,
            selector,
            routes,
            sink,
            provider_timeout: config.provider_timeout(),
            job_timeout: config.job_timeout(),
        });
        let pool = WorkerPool::spawn(ctx.clone(), config.max_concurrency);
        info!(
            workers = config.max_concurrency,
            rate_ceiling = config.rate_ceiling,
            "dispatch engine started"
        );

        Ok(Self {
            ctx,
            tracker,
            credential_ids,
            pool,
        })
    }

    /// Job intake from the grading-session lifecycle manager. A
    /// preference override applies only if this job decides the
    /// session's chain.
    pub fn create_job(
        &self,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        file_text: String,
        rubric: Value,
        preference: Option<ModelPreference>,
    ) -> Ulid {
        let mut job = GradingJob::new(session_id, user_id, GradingPayload { file_text, rubric });
        job.model_preference = preference;
        self.ctx.queue.enqueue(job)
    }

    pub fn job(&self, id: Ulid) -> Option<GradingJob> {
        self.ctx.queue.job(id)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.ctx.queue.status()
    }

    pub async fn credential_health(&self) -> Vec<CredentialHealth> {
        self.tracker.snapshot(&self.credential_ids).await
    }

    pub async fn credential_summary(&self) -> HealthSummary {
        self.tracker.summary_stats(&self.credential_ids).await
    }

    /// Session completed; evict its cached provider chain.
    pub fn end_session(&self, session_id: &str) {
        self.ctx.selector.end_session(session_id);
    }

    pub async fn shutdown(self) {
        self.pool.shutdown().await;
        info!("dispatch engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use gd_config::{EndpointConfig, ProvidersConfig};
    use gd_core::{JobResult, JobState};
    use serde_json::json;
    use std::time::Duration;

    /// Local-only config pointing at a port nothing listens on; the
    /// refused connection exercises the whole engine path end to end.
    fn unreachable_local_config() -> DispatchConfig {
        DispatchConfig {
            max_concurrency: 2,
            rate_ceiling: 10,
            rate_window_ms: 60_000,
            provider_timeout_ms: 500,
            probe_timeout_ms: 200,
            job_timeout_ms: 5_000,
            poll_interval_ms: 10,
            providers: ProvidersConfig {
                local: Some(EndpointConfig {
                    base_url: "http://127.0.0.1:9".to_string(),
                    model: "llama3.1:8b".to_string(),
                    api_key: None,
                }),
                primary: None,
                secondary: None,
            },
            ..DispatchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_engine_runs_job_to_terminal_state() {
        let config = unreachable_local_config();
        let store = connect_store(&config).await.unwrap();
        let sink = Arc::new(MemorySink::new());
        let engine = DispatchEngine::start(&config, store, sink.clone())
            .await
            .unwrap();

        let id = engine.create_job("session-1", "user-1", "essay".to_string(), json!({}), None);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(job) = engine.job(id) {
                if job.state.is_terminal() {
                    assert_eq!(job.state, JobState::Failed);
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "job never finished");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(matches!(
            sink.result_for(id),
            Some(JobResult::Failed { .. })
        ));
        let status = engine.queue_status();
        assert_eq!(status.failed, 1);
        assert_eq!(status.active, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_health_snapshot_covers_all_credentials() {
        let mut config = unreachable_local_config();
        config.providers.primary = Some(gd_config::PrimaryCloudConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_keys: vec!["k1".into(), "k2".into(), "k3".into()],
        });
        let store = connect_store(&config).await.unwrap();
        let sink = Arc::new(MemorySink::new());
        let engine = DispatchEngine::start(&config, store, sink).await.unwrap();

        let snapshot = engine.credential_health().await;
        assert_eq!(snapshot.len(), 4);
        let summary = engine.credential_summary().await;
        assert_eq!(summary.credential_count, 4);
        assert_eq!(summary.available_count, 4);
        engine.shutdown().await;
    }
}
