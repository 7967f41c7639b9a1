// completion-client-rs/src/http_client.rs
//
// HTTP client for OpenAI-compatible chat completion endpoints.
//
// - One request per call, bounded by the caller's timeout. No retries: the
//   pipeline treats a failed call as a failed stage.
// - Status codes are classified the same way for every provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared_types::config::CompletionConfig;

use crate::{CompletionError, TextCompletion};

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl HttpCompletionClient {
    pub fn new(config: &CompletionConfig) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .build()
            .map_err(|e| CompletionError::InvalidRequest(format!("http client: {e}")))?;
        let endpoint = format!("{}/chat/completions", config.api_url.trim_end_matches('/'));
        if config.api_key.is_none() {
            tracing::warn!(endpoint = %endpoint, "no completion API key configured; sending unauthenticated requests");
        }
        tracing::info!(endpoint = %endpoint, model = %config.model, "completion client initialized");
        Ok(Self {
            client,
            endpoint,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn classify_status(status: reqwest::StatusCode, text: String) -> CompletionError {
        match status.as_u16() {
            400 => CompletionError::InvalidRequest(format!("Bad request: {text}")),
            401 => CompletionError::InvalidRequest(format!("Unauthorized: {text}")),
            403 => CompletionError::InvalidRequest(format!("Forbidden: {text}")),
            404 => CompletionError::InvalidRequest(format!("Not found: {text}")),
            429 => CompletionError::RateLimitExceeded(text),
            500 | 502 | 503 | 504 => CompletionError::ServerError(format!("({status}) {text}")),
            _ => CompletionError::UnknownError(format!("({status}) {text}")),
        }
    }
}

#[async_trait]
impl TextCompletion for HttpCompletionClient {
    async fn complete_text(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, CompletionError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut request = self.client.post(&self.endpoint).timeout(timeout).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                CompletionError::Timeout(timeout)
            } else if err.is_connect() {
                CompletionError::NetworkError(format!("Connection failed: {err}"))
            } else {
                CompletionError::NetworkError(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            metrics::increment_counter!("completion_requests_total", "status" => "error");
            return Err(Self::classify_status(status, text));
        }

        let data: ChatCompletionResponse = response.json().await.map_err(|err| {
            if err.is_timeout() {
                CompletionError::Timeout(timeout)
            } else {
                CompletionError::ParseError(format!("Failed to parse response: {err}"))
            }
        })?;

        let choice = data
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CompletionError::ParseError("No choices returned in response".to_string()))?;

        metrics::increment_counter!("completion_requests_total", "status" => "ok");
        if let Some(usage) = data.usage {
            tracing::debug!(total_tokens = usage.total_tokens, "completion request finished");
        }
        Ok(choice.message.content)
    }
}
