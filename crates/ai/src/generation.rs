//! Boundary to the external text-generation service.
//!
//! Implementations (local Ollama, remote OpenAI-compatible) live in
//! `casefile-infra` and are selected at startup by configuration; the worker
//! only sees `dyn GenerationClient`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single prompt to complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
        }
    }
}

/// Provider-reported timings (nanoseconds) and token counts.
///
/// Fields are optional because not every provider reports every metric.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub total_duration_ns: Option<u64>,
    pub load_duration_ns: Option<u64>,
    pub prompt_eval_count: Option<u64>,
    pub prompt_eval_duration_ns: Option<u64>,
    pub eval_count: Option<u64>,
    pub eval_duration_ns: Option<u64>,
}

/// Transport-side measurements of the final (successful) HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HttpMetrics {
    pub status_code: u16,
    pub elapsed_ms: u64,
    pub request_bytes: usize,
    pub response_bytes: usize,
    /// Number of HTTP attempts including retries.
    pub attempts: u32,
}

/// Result envelope of a generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResponse {
    pub text: String,
    /// Model that actually served the request.
    pub model: String,
    pub done_reason: Option<String>,
    pub metrics: GenerationMetrics,
    pub http: HttpMetrics,
}

/// Typed fault raised by a generation client.
///
/// Every variant knows its own machine-readable code and whether the job
/// should be retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("generation request timed out: {0}")]
    Timeout(String),

    #[error("generation service unreachable: {0}")]
    Network(String),

    #[error("generation request cancelled: {0}")]
    Cancelled(String),

    #[error("failed to decode generation response: {0}")]
    Decode(String),

    #[error("generation service error ({code}): {message}")]
    Service {
        code: String,
        message: String,
        status: Option<u16>,
        status_name: Option<String>,
        retryable: bool,
    },
}

impl GenerationError {
    pub fn code(&self) -> &str {
        match self {
            GenerationError::Timeout(_) => "ollama_timeout",
            GenerationError::Network(_) => "ollama_network",
            GenerationError::Cancelled(_) => "ollama_cancelled",
            GenerationError::Decode(_) => "ollama_parse_error",
            GenerationError::Service { code, .. } => code,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Timeout(_)
            | GenerationError::Network(_)
            | GenerationError::Cancelled(_) => true,
            GenerationError::Decode(_) => false,
            GenerationError::Service { retryable, .. } => *retryable,
        }
    }

    /// HTTP status `(code, canonical name)` when the fault came from a response.
    pub fn http_status(&self) -> Option<(u16, Option<&str>)> {
        match self {
            GenerationError::Service {
                status: Some(status),
                status_name,
                ..
            } => Some((*status, status_name.as_deref())),
            _ => None,
        }
    }
}

/// Client for the external text-generation service.
#[async_trait::async_trait]
pub trait GenerationClient: Send + Sync {
    /// Human-readable provider name for logs (`ollama`, `remote`, ...).
    fn provider(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError>;
}
