//! Derived health metrics and the composite score.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;

const RECENCY_HORIZON_MS: f64 = 3_600_000.0;

fn parse_field<T: std::str::FromStr + Default>(fields: &HashMap<String, String>, name: &str) -> T {
    fields
        .get(name)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default()
}

/// Point-in-time view of one credential, derived from the raw counters.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialHealth {
    pub credential_id: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub request_count: u64,
    /// Epoch millis; 0 means not throttled.
    pub throttled_until: i64,
    /// Epoch millis; 0 means never used.
    pub last_used_at: i64,
    pub avg_response_ms: u64,
    /// Composite in [0, 1]; 0.5 for a credential with no history.
    pub health_score: f64,
}

impl CredentialHealth {
    pub fn from_fields(credential_id: String, fields: &HashMap<String, String>) -> Self {
        let success_count: u64 = parse_field(fields, "success_count");
        let failure_count: u64 = parse_field(fields, "failure_count");
        let request_count: u64 = parse_field(fields, "request_count");
        let total_response_ms: u64 = parse_field(fields, "total_response_ms");
        let throttled_until: i64 = parse_field(fields, "throttled_until");
        let last_used_at: i64 = parse_field(fields, "last_used_at");

        let avg_response_ms = if request_count > 0 {
            total_response_ms / request_count
        } else {
            0
        };

        let now_ms = Utc::now().timestamp_millis();
        let health_score = score(
            success_count,
            failure_count,
            request_count,
            throttled_until,
            last_used_at,
            now_ms,
        );

        Self {
            credential_id,
            success_count,
            failure_count,
            request_count,
            throttled_until,
            last_used_at,
            avg_response_ms,
            health_score,
        }
    }

    pub fn is_throttled(&self, now_ms: i64) -> bool {
        self.throttled_until > now_ms
    }
}

/// Weighted composite of success rate, throttle availability and recency.
/// An unused credential scores a neutral 0.5 so fresh credentials are
/// neither favored nor starved.
fn score(
    success_count: u64,
    failure_count: u64,
    request_count: u64,
    throttled_until: i64,
    last_used_at: i64,
    now_ms: i64,
) -> f64 {
    if request_count == 0 && failure_count == 0 {
        return 0.5;
    }

    let attempts = (success_count + failure_count).max(1);
    let success_rate = success_count as f64 / attempts as f64;

    let availability = if throttled_until > now_ms { 0.0 } else { 1.0 };

    let recency = if last_used_at == 0 {
        1.0
    } else {
        let idle_ms = (now_ms - last_used_at).max(0) as f64;
        (1.0 - idle_ms / RECENCY_HORIZON_MS).clamp(0.0, 1.0)
    };

    success_rate * 0.6 + availability * 0.3 + recency * 0.1
}

/// Aggregate counters across a credential set, for status reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    pub credential_count: usize,
    pub available_count: usize,
    pub throttled_count: usize,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl HealthSummary {
    pub fn from_metrics(metrics: &[CredentialHealth]) -> Self {
        let now_ms = Utc::now().timestamp_millis();
        let mut summary = Self {
            credential_count: metrics.len(),
            ..Self::default()
        };
        for m in metrics {
            if m.is_throttled(now_ms) {
                summary.throttled_count += 1;
            } else {
                summary.available_count += 1;
            }
            summary.total_successes += m.success_count;
            summary.total_failures += m.failure_count;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_score_without_history() {
        let s = score(0, 0, 0, 0, 0, 1_000_000);
        assert_eq!(s, 0.5);
    }

    #[test]
    fn test_perfect_recent_credential_scores_high() {
        let now = 1_000_000_000i64;
        let s = score(10, 0, 10, 0, now - 1_000, now);
        assert!(s > 0.95, "score {s}");
    }

    #[test]
    fn test_throttle_drops_availability_component() {
        let now = 1_000_000_000i64;
        let open = score(10, 0, 10, 0, now, now);
        let throttled = score(10, 0, 10, now + 60_000, now, now);
        assert!((open - throttled - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_recency_decays_over_an_hour() {
        let now = 10_000_000_000i64;
        let fresh = score(5, 5, 10, 0, now, now);
        let stale = score(5, 5, 10, 0, now - 3_600_000, now);
        assert!(fresh > stale);
        assert!((fresh - stale - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_from_fields_tolerates_missing_and_garbage() {
        let mut fields = HashMap::new();
        fields.insert("success_count".to_string(), "not-a-number".to_string());
        let m = CredentialHealth::from_fields("k1".to_string(), &fields);
        assert_eq!(m.success_count, 0);
        assert_eq!(m.health_score, 0.5);
    }

    #[test]
    fn test_avg_response_time() {
        let mut fields = HashMap::new();
        fields.insert("request_count".to_string(), "4".to_string());
        fields.insert("success_count".to_string(), "4".to_string());
        fields.insert("total_response_ms".to_string(), "2000".to_string());
        let m = CredentialHealth::from_fields("k1".to_string(), &fields);
        assert_eq!(m.avg_response_ms, 500);
    }
}
