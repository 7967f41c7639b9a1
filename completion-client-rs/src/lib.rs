//! completion-client-rs
//! The `complete_text` collaborator used by the candidate synthesizer and the
//! evaluation gate, plus its OpenAI-compatible HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use shared_types::ErrorClass;

mod http_client;


pub use http_client::HttpCompletionClient;

/// Errors from a completion call. Nothing here is retried by the client.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("unparsable completion response: {0}")]
    ParseError(String),

    #[error("unexpected response: {0}")]
    UnknownError(String),
}

impl CompletionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CompletionError::ParseError(_) => ErrorClass::Parse,
            _ => ErrorClass::ExternalService,
        }
    }
}

#[async_trait]
pub trait TextCompletion: Send + Sync {
    /// Complete `prompt`, giving up after `timeout`.
    async fn complete_text(&self, prompt: &str, timeout: Duration)
        -> Result<String, CompletionError>;
}

/// Call `completion` and give up after `timeout` even when the
/// implementation ignores its own timeout argument.
pub async fn complete_within(
    completion: &dyn TextCompletion,
    prompt: &str,
    timeout: Duration,
) -> Result<String, CompletionError> {
    tokio::time::timeout(timeout, completion.complete_text(prompt, timeout))
        .await
        .map_err(|_| CompletionError::Timeout(timeout))?
}
