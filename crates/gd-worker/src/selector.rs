//! Session-scoped provider chain selection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gd_core::{DispatchError, ModelPreference, ProviderChain, ProviderId};
use gd_provider::ProviderClient;
use tokio::time::Instant;
use tracing::{debug, info};

/// Stale sessions that never signal completion are evicted after this.
const SESSION_CHAIN_TTL: Duration = Duration::from_secs(3600);

struct CachedChain {
    chain: ProviderChain,
    decided_at: Instant,
}

/// Decides the provider chain once per session and caches it for the
/// session's lifetime. Probing before every job would dominate latency,
/// so the probe runs at most once per session; a failed probe commits
/// the whole session to cloud.
pub struct SessionModelSelector {
    local: Option<Arc<dyn ProviderClient>>,
    cloud_chain: ProviderChain,
    preference: ModelPreference,
    probe_timeout: Duration,
    cache: Mutex<HashMap<String, CachedChain>>,
}

impl SessionModelSelector {
    pub fn new(
        local: Option<Arc<dyn ProviderClient>>,
        cloud_chain: ProviderChain,
        preference: ModelPreference,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            local,
            cloud_chain,
            preference,
            probe_timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the session's chain, deciding it on first call. A per-job
    /// preference override only matters for that first call; afterwards
    /// the cached decision wins for the session's lifetime.
    pub async fn select_chain(
        &self,
        session_id: &str,
        preference: Option<ModelPreference>,
    ) -> Result<ProviderChain, DispatchError> {
        if let Some(chain) = self.cached(session_id) {
            return Ok(chain);
        }

        let chain = self.decide(preference.unwrap_or(self.preference)).await?;
        debug!(session_id, ?chain, "session provider chain decided");
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                session_id.to_string(),
                CachedChain {
                    chain: chain.clone(),
                    decided_at: Instant::now(),
                },
            );
        }
        Ok(chain)
    }

    /// External signal that the session finished; the next job for the
    /// same id (if any) re-probes.
    pub fn end_session(&self, session_id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(session_id);
        }
    }

    fn cached(&self, session_id: &str) -> Option<ProviderChain> {
        let mut cache = self.cache.lock().ok()?;
        let now = Instant::now();
        cache.retain(|_, entry| now.duration_since(entry.decided_at) < SESSION_CHAIN_TTL);
        cache.get(session_id).map(|entry| entry.chain.clone())
    }

    async fn decide(&self, preference: ModelPreference) -> Result<ProviderChain, DispatchError> {
        match preference {
            ModelPreference::ForceLocal => {
                let Some(local) = &self.local else {
                    return Err(DispatchError::ForcedProviderUnavailable {
                        provider: ProviderId::Local,
                    });
                };
                if !local.probe(self.probe_timeout).await {
                    return Err(DispatchError::ForcedProviderUnavailable {
                        provider: ProviderId::Local,
                    });
                }
                Ok(vec![ProviderId::Local])
            }
            ModelPreference::ForceCloud => {
                if self.cloud_chain.is_empty() {
                    return Err(DispatchError::ForcedProviderUnavailable {
                        provider: ProviderId::PrimaryCloud,
                    });
                }
                Ok(self.cloud_chain.clone())
            }
            ModelPreference::Auto => {
                if let Some(local) = &self.local {
                    if local.probe(self.probe_timeout).await {
                        return Ok(vec![ProviderId::Local]);
                    }
                    info!("local provider probe failed, session falls back to cloud");
                }
                if self.cloud_chain.is_empty() {
                    // Only the local endpoint exists; attempt it anyway and
                    // let the per-job error reporting carry the failure.
                    return Ok(vec![ProviderId::Local]);
                }
                Ok(self.cloud_chain.clone())
            }
        }
    }
}
