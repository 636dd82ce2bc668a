//! The LLM adapter: a single outbound call with schema-bound output, usage
//! telemetry, and tolerant parsing of whatever the model actually returns.
//!
//! Retry policy lives with the orchestrator; the adapter itself only permits
//! one retry on a transport-level failure, counted as the same call.

pub mod parse;
pub mod prompts;
pub mod schema;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use evosolve_db::models::Phase;

use crate::error::EngineError;

/// One schema-bound request to the model.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub phase: Phase,
    pub prompt: String,
    /// JSON Schema the response must satisfy.
    pub schema: serde_json::Value,
    pub schema_name: String,
}

/// The model's reply plus usage telemetry.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Raw completion text (expected to be JSON, but not trusted to be).
    pub content: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub duration_ms: i64,
    pub model: String,
}

/// Seam between phase workers and the model provider. Test code substitutes
/// scripted implementations.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, EngineError>;
}

/// Configuration for the HTTP client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat-completions API.
    pub base_url: String,
    pub api_key: Option<String>,
    pub temperature: f64,
    /// Use native structured output (`json_schema` response format). When
    /// false the adapter requests a JSON object and relies entirely on the
    /// tolerant parser.
    pub structured_output: bool,
    /// Hard deadline per call.
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_owned(),
            api_key: None,
            temperature: 0.8,
            structured_output: true,
            timeout: Duration::from_secs(300),
        }
    }
}

/// OpenAI-compatible chat-completions client.
///
/// Holds the process's single shared connection pool; clones are cheap and
/// share it.
#[derive(Clone)]
pub struct HttpLlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn request_body(&self, request: &LlmRequest) -> serde_json::Value {
        let response_format = if self.config.structured_output {
            json!({
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": true,
                },
            })
        } else {
            json!({"type": "json_object"})
        };

        json!({
            "model": request.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": self.config.temperature,
            "response_format": response_format,
            "stream": false,
        })
    }

    async fn send_once(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let mut req = self.client.post(url).json(body);
        if let Some(api_key) = &self.config.api_key {
            req = req.bearer_auth(api_key);
        }
        req.send().await
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, EngineError> {
        let body = self.request_body(request);
        let started = Instant::now();

        // One retry on transport-level failure only; HTTP status errors are
        // never retried here.
        let response = match self.send_once(&body).await {
            Ok(resp) => resp,
            Err(first) => {
                tracing::warn!(error = %first, "llm transport error, retrying once");
                self.send_once(&body)
                    .await
                    .map_err(|e| EngineError::LlmTransport(format!("request failed: {e}")))?
            }
        };

        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::LlmTransport(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            let detail = extract_provider_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {status}"));
            return Err(EngineError::LlmTransport(detail));
        }
        if let Some(detail) = extract_provider_error(&value) {
            return Err(EngineError::LlmTransport(detail));
        }

        let content = extract_completion_text(&value).ok_or_else(|| {
            EngineError::LlmParse(format!(
                "provider returned no completion content (response: {})",
                truncate_for_error(&value.to_string(), 500)
            ))
        })?;

        let usage = &value["usage"];
        Ok(LlmResponse {
            content,
            prompt_tokens: usage["prompt_tokens"].as_i64().unwrap_or(0),
            completion_tokens: usage["completion_tokens"].as_i64().unwrap_or(0),
            duration_ms: started.elapsed().as_millis() as i64,
            model: value["model"]
                .as_str()
                .unwrap_or(&request.model)
                .to_owned(),
        })
    }
}

fn extract_provider_error(value: &serde_json::Value) -> Option<String> {
    let error = value.get("error")?;
    if error.is_null() {
        return None;
    }
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown provider error");
    Some(message.to_owned())
}

fn extract_completion_text(value: &serde_json::Value) -> Option<String> {
    value["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_owned)
        .filter(|s| !s.is_empty())
}

fn truncate_for_error(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        format!("{}...", &s[..max])
    }
}

/// Build the canonical call id: `{jobId}_gen{g}_{phase}_{epochMs}`.
pub fn call_id(job_id: &str, generation: u32, phase: Phase) -> String {
    let epoch_ms = chrono::Utc::now().timestamp_millis();
    format!("{job_id}_gen{generation}_{phase}_{epoch_ms}")
}
