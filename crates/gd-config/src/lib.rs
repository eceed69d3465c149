//! Configuration surface for the dispatch engine.
//!
//! A TOML file carries tunables and provider endpoints; credentials come
//! from the environment so they never land in the file
//! (`PRIMARY_API_KEY`/`PRIMARY_API_KEY2`/`PRIMARY_API_KEY3`,
//! `SECONDARY_API_KEY`, `LOCAL_API_KEY`, `REDIS_URL`).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use gd_core::ModelPreference;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Worker pool size; also the queue's max-active bound.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Requests admitted per rate window, shared across instances.
    #[serde(default = "default_rate_ceiling")]
    pub rate_ceiling: u32,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    /// Per provider call; must stay below `job_timeout_ms`.
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Total budget across all fallback attempts for one job.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    /// Scheduling tick for delayed-job re-evaluation.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub model_preference: ModelPreference,
    /// Absent means single-instance mode with the in-process store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<EndpointConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<PrimaryCloudConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<EndpointConfig>,
}

/// Single-credential provider endpoint (local model, secondary cloud).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
    /// Filled from the environment, never from the file.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

/// Primary cloud provider with interchangeable credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryCloudConfig {
    pub base_url: String,
    pub model: String,
    /// Filled from `PRIMARY_API_KEY`, `PRIMARY_API_KEY2`, `PRIMARY_API_KEY3`.
    #[serde(default, skip_serializing)]
    pub api_keys: Vec<String>,
}

fn default_max_concurrency() -> usize {
    8
}
fn default_rate_ceiling() -> u32 {
    15
}
fn default_rate_window_ms() -> u64 {
    60_000
}
fn default_provider_timeout_ms() -> u64 {
    90_000
}
fn default_probe_timeout_ms() -> u64 {
    3_000
}
fn default_job_timeout_ms() -> u64 {
    300_000
}
fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            rate_ceiling: default_rate_ceiling(),
            rate_window_ms: default_rate_window_ms(),
            provider_timeout_ms: default_provider_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            job_timeout_ms: default_job_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            model_preference: ModelPreference::default(),
            redis_url: None,
            providers: ProvidersConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Pull credentials and the store URL from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(local) = &mut self.providers.local
            && let Ok(key) = std::env::var("LOCAL_API_KEY")
        {
            local.api_key = Some(key);
        }
        if let Some(secondary) = &mut self.providers.secondary
            && let Ok(key) = std::env::var("SECONDARY_API_KEY")
        {
            secondary.api_key = Some(key);
        }
        if let Some(primary) = &mut self.providers.primary {
            let keys: Vec<String> = ["PRIMARY_API_KEY", "PRIMARY_API_KEY2", "PRIMARY_API_KEY3"]
                .iter()
                .filter_map(|name| std::env::var(name).ok())
                .filter(|key| !key.is_empty())
                .collect();
            if !keys.is_empty() {
                primary.api_keys = keys;
            }
            debug!(key_count = primary.api_keys.len(), "primary cloud credentials loaded");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        if self.rate_ceiling == 0 {
            anyhow::bail!("rate_ceiling must be at least 1");
        }
        if self.rate_window_ms == 0 {
            anyhow::bail!("rate_window_ms must be positive");
        }
        if self.provider_timeout_ms >= self.job_timeout_ms {
            anyhow::bail!(
                "provider_timeout_ms ({}) must be below job_timeout_ms ({})",
                self.provider_timeout_ms,
                self.job_timeout_ms
            );
        }
        if self.model_preference == ModelPreference::ForceLocal && self.providers.local.is_none() {
            anyhow::bail!("model_preference = force-local requires a [providers.local] endpoint");
        }
        if self.providers.local.is_none()
            && self.providers.primary.is_none()
            && self.providers.secondary.is_none()
        {
            anyhow::bail!("at least one provider endpoint must be configured");
        }
        Ok(())
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
