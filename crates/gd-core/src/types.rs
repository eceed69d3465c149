use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// AI provider selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderId {
    /// Local/on-prem model endpoint (fast, free, often down).
    Local,
    /// Primary cloud model with multiple interchangeable credentials.
    PrimaryCloud,
    /// Secondary cloud model, single credential, last resort.
    SecondaryCloud,
}

impl ProviderId {
    /// Returns the wire/config-facing name for this provider
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::PrimaryCloud => "primary-cloud",
            Self::SecondaryCloud => "secondary-cloud",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "primary-cloud" => Ok(Self::PrimaryCloud),
            "secondary-cloud" => Ok(Self::SecondaryCloud),
            other => Err(format!(
                "Invalid provider '{}'. Valid values: local, primary-cloud, secondary-cloud",
                other
            )),
        }
    }
}

/// Ordered list of providers a session attempts, decided once per session.
pub type ProviderChain = Vec<ProviderId>;

/// User-level model preference parsed from config or per-session override.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelPreference {
    /// Probe the local provider once per session, fall back to cloud.
    #[default]
    Auto,
    /// Local only; fails loudly if the local provider is unreachable.
    ForceLocal,
    /// Cloud chain only, no local probe.
    ForceCloud,
}

impl std::str::FromStr for ModelPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "force-local" => Ok(Self::ForceLocal),
            "force-cloud" => Ok(Self::ForceCloud),
            other => Err(format!(
                "Invalid model preference '{}'. Valid values: auto, force-local, force-cloud",
                other
            )),
        }
    }
}

impl std::fmt::Display for ModelPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::ForceLocal => write!(f, "force-local"),
            Self::ForceCloud => write!(f, "force-cloud"),
        }
    }
}

/// Job lifecycle state. A job is in exactly one state at any time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Waiting for a worker slot.
    Queued,
    /// Waiting out a rate-limit window (or a transient admission refusal).
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Opaque grading input: one (file, rubric) pair. The dispatcher never
/// interprets either payload beyond handing them to a provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradingPayload {
    pub file_text: String,
    pub rubric: Value,
}

/// One grading request for one (file, rubric) pair within a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradingJob {
    pub id: Ulid,
    pub session_id: String,
    pub user_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub state: JobState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_provider: Option<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_credential: Option<String>,
    /// Per-job override of the configured model preference. Only consulted
    /// when the session's chain has not been decided yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_preference: Option<ModelPreference>,
    pub payload: GradingPayload,
}

impl GradingJob {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, payload: GradingPayload) -> Self {
        Self {
            id: Ulid::new(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            enqueued_at: Utc::now(),
            state: JobState::Queued,
            attempts: 0,
            last_error: None,
            assigned_provider: None,
            assigned_credential: None,
            model_preference: None,
            payload,
        }
    }

    pub fn with_preference(mut self, preference: ModelPreference) -> Self {
        self.model_preference = Some(preference);
        self
    }
}

/// Successful grading result plus dispatch metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradingOutcome {
    /// Provider-specific grading result, already parsed as JSON.
    pub result: Value,
    pub provider: ProviderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    pub latency_ms: u64,
}

/// Terminal result handed to the result sink. The sink owns durability;
/// the dispatcher owns only in-flight state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum JobResult {
    Completed { outcome: GradingOutcome },
    Failed { kind: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_provider_id_roundtrip() {
        for p in [ProviderId::Local, ProviderId::PrimaryCloud, ProviderId::SecondaryCloud] {
            assert_eq!(ProviderId::from_str(p.as_str()).unwrap(), p);
        }
    }

    #[test]
    fn test_provider_id_invalid() {
        let err = ProviderId::from_str("openai").unwrap_err();
        assert!(err.contains("Invalid provider 'openai'"));
    }

    #[test]
    fn test_model_preference_from_str() {
        assert_eq!(ModelPreference::from_str("auto").unwrap(), ModelPreference::Auto);
        assert_eq!(
            ModelPreference::from_str("force-local").unwrap(),
            ModelPreference::ForceLocal
        );
        assert_eq!(
            ModelPreference::from_str("force-cloud").unwrap(),
            ModelPreference::ForceCloud
        );
        assert!(ModelPreference::from_str("ForceLocal").is_err());
    }

    #[test]
    fn test_model_preference_default_is_auto() {
        assert_eq!(ModelPreference::default(), ModelPreference::Auto);
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Delayed.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }

    #[test]
    fn test_new_job_starts_queued() {
        let job = GradingJob::new(
            "sess-1",
            "user-1",
            GradingPayload {
                file_text: "essay".into(),
                rubric: serde_json::json!({"criteria": []}),
            },
        );
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.assigned_provider.is_none());
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_job_result_serializes_with_status_tag() {
        let result = JobResult::Failed {
            kind: "permanent".into(),
            message: "unsupported content".into(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "permanent");
    }
}
