//! Primary-cloud adapter speaking the generateContent dialect.
//!
//! Unlike the chat-completions endpoints, the key travels in the query
//! string, so request URLs must never be logged.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use gd_core::{GradingOutcome, GradingPayload, ProviderError, ProviderId};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::debug;

use crate::ProviderClient;
use crate::classify::{classify_response, classify_transport_error};
use crate::http::Credential;

pub struct GeminiProvider {
    base_url: String,
    model: String,
    credentials: Vec<Credential>,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        credentials: Vec<Credential>,
        call_timeout: Duration,
    ) -> Result<Self> {
        if credentials.is_empty() {
            bail!("primary cloud provider has no credentials configured");
        }
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            credentials,
            client,
        })
    }

    fn api_key_for(&self, credential_id: &str) -> Result<&str, ProviderError> {
        self.credentials
            .iter()
            .find(|c| c.id == credential_id)
            .map(|c| c.api_key.as_str())
            .ok_or_else(|| {
                ProviderError::auth_failure(
                    ProviderId::PrimaryCloud,
                    format!("unknown credential '{credential_id}'"),
                )
            })
    }
}

#[async_trait]
impl ProviderClient for GeminiProvider {
    fn provider_id(&self) -> ProviderId {
        ProviderId::PrimaryCloud
    }

    fn credential_ids(&self) -> Vec<String> {
        self.credentials.iter().map(|c| c.id.clone()).collect()
    }

    async fn invoke(
        &self,
        credential_id: &str,
        payload: &GradingPayload,
    ) -> Result<GradingOutcome, ProviderError> {
        let api_key = self.api_key_for(credential_id)?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .query(&[("key", api_key)])
            .json(&json!({
                "systemInstruction": {
                    "parts": [{"text": crate::http::grading_prompt(&payload.rubric)}]
                },
                "contents": [
                    {"role": "user", "parts": [{"text": payload.file_text}]}
                ],
                "generationConfig": {"temperature": 0.0}
            }))
            .send()
            .await
            .map_err(|err| classify_transport_error(ProviderId::PrimaryCloud, &err))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|err| classify_transport_error(ProviderId::PrimaryCloud, &err))?;

        if !status.is_success() {
            return Err(classify_response(
                ProviderId::PrimaryCloud,
                status,
                &headers,
                &body,
            ));
        }

        let result = parse_generate_content(&body)
            .map_err(|msg| ProviderError::transient(ProviderId::PrimaryCloud, msg))?;
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(credential = credential_id, latency_ms, "primary cloud grading call completed");

        Ok(GradingOutcome {
            result,
            provider: ProviderId::PrimaryCloud,
            credential_id: Some(credential_id.to_string()),
            latency_ms,
        })
    }

    async fn probe(&self, timeout: Duration) -> bool {
        let Some(first) = self.credentials.first() else {
            return false;
        };
        let url = format!("{}/v1beta/models", self.base_url);
        let request = self.client.get(&url).query(&[("key", &first.api_key)]);
        match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }
}

/// Pull `candidates[0].content.parts[0].text` and parse it as the
/// grading result, tolerating a markdown code fence around the JSON.
fn parse_generate_content(body: &str) -> Result<Value, String> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| format!("unparseable response body: {err}"))?;
    let text = value
        .get("candidates")
        .and_then(|candidates| candidates.get(0))
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(|parts| parts.get(0))
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str)
        .ok_or_else(|| "missing candidates[0].content.parts[0].text in response".to_string())?;

    let stripped = strip_code_fence(text.trim());
    match serde_json::from_str::<Value>(stripped) {
        Ok(parsed) if parsed.is_object() => Ok(parsed),
        _ => Ok(json!({ "feedback": stripped })),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches('\n')
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_body(text: &str) -> String {
        json!({
            "candidates": [{"content": {"parts": [{"text": text}], "role": "model"}}]
        })
        .to_string()
    }

    #[test]
    fn test_parse_json_result() {
        let body = generate_body(r#"{"score": 92, "feedback": "excellent"}"#);
        let result = parse_generate_content(&body).unwrap();
        assert_eq!(result["score"], 92);
    }

    #[test]
    fn test_parse_fenced_json_result() {
        let body = generate_body("```json\n{\"score\": 70, \"feedback\": \"ok\"}\n```");
        let result = parse_generate_content(&body).unwrap();
        assert_eq!(result["score"], 70);
    }

    #[test]
    fn test_parse_prose_falls_back_to_feedback() {
        let body = generate_body("Well argued overall.");
        let result = parse_generate_content(&body).unwrap();
        assert_eq!(result["feedback"], "Well argued overall.");
    }

    #[test]
    fn test_parse_missing_candidates_is_error() {
        assert!(parse_generate_content(r#"{"promptFeedback": {}}"#).is_err());
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("{}"), "{}");
    }

    #[test]
    fn test_new_rejects_empty_credentials() {
        let result = GeminiProvider::new(
            "https://generativelanguage.googleapis.com",
            "gemini-2.5-flash",
            Vec::new(),
            Duration::from_secs(30),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_credential_ids_in_configuration_order() {
        let provider = GeminiProvider::new(
            "https://generativelanguage.googleapis.com",
            "gemini-2.5-flash",
            vec![
                Credential {
                    id: "primary-key-1".into(),
                    api_key: "a".into(),
                },
                Credential {
                    id: "primary-key-2".into(),
                    api_key: "b".into(),
                },
            ],
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(provider.credential_ids(), ["primary-key-1", "primary-key-2"]);
    }
}
