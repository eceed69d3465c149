//! Chat-completions HTTP adapter shared by all three provider endpoints.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use gd_core::{GradingOutcome, GradingPayload, ProviderError, ProviderId};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::debug;

use crate::ProviderClient;
use crate::classify::{classify_response, classify_transport_error};

/// One interchangeable API key.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub api_key: String,
}

/// OpenAI-compatible chat-completions endpoint. The local model server,
/// the primary cloud and the secondary cloud all speak this shape; they
/// differ only in base URL, model name and credential count.
pub struct HttpProvider {
    provider_id: ProviderId,
    base_url: String,
    model: String,
    credentials: Vec<Credential>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(
        provider_id: ProviderId,
        base_url: impl Into<String>,
        model: impl Into<String>,
        credentials: Vec<Credential>,
        call_timeout: Duration,
    ) -> Result<Self> {
        if credentials.is_empty() {
            bail!("provider '{provider_id}' has no credentials configured");
        }
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            provider_id,
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
                    self.provider_id,
                    format!("unknown credential '{credential_id}'"),
                )
            })
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    fn provider_id(&self) -> ProviderId {
        self.provider_id
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
        let url = format!("{}/chat/completions", self.base_url);
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": grading_prompt(&payload.rubric)},
                    {"role": "user", "content": payload.file_text}
                ],
                "temperature": 0.0
            }))
            .send()
            .await
            .map_err(|err| classify_transport_error(self.provider_id, &err))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|err| classify_transport_error(self.provider_id, &err))?;

        if !status.is_success() {
            return Err(classify_response(self.provider_id, status, &headers, &body));
        }

        let result = parse_grading_content(&body)
            .map_err(|msg| ProviderError::transient(self.provider_id, msg))?;
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(provider = %self.provider_id, credential = credential_id, latency_ms, "grading call completed");

        Ok(GradingOutcome {
            result,
            provider: self.provider_id,
            credential_id: Some(credential_id.to_string()),
            latency_ms,
        })
    }

    async fn probe(&self, timeout: Duration) -> bool {
        let url = format!("{}/models", self.base_url);
        match tokio::time::timeout(timeout, self.client.get(&url).send()).await {
            Ok(Ok(response)) => response.status().is_success(),
            // Timeout, refusal and transport errors all read as unhealthy.
            _ => false,
        }
    }
}

pub(crate) fn grading_prompt(rubric: &Value) -> String {
    format!(
        "You are an automated grading assistant. Grade the submitted work \
         against the rubric below. Respond with strict JSON of the form \
         {{\"score\": <number>, \"feedback\": \"<string>\", \"criteria\": [...]}} \
         and nothing else.\n\nRubric:\n{rubric}"
    )
}

/// Pull `choices[0].message.content` out of the completion response and
/// parse it as the grading result. Models occasionally return prose instead
/// of JSON; that is preserved as a feedback-only result rather than failed.
fn parse_grading_content(body: &str) -> Result<Value, String> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| format!("unparseable response body: {err}"))?;
    let content = value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| "missing choices[0].message.content in response".to_string())?;

    let trimmed = content.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(parsed) if parsed.is_object() => Ok(parsed),
        _ => Ok(json!({ "feedback": trimmed })),
    }
}
