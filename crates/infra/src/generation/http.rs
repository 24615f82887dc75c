//! JSON-over-HTTP transport shared by the generation clients.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use casefile_ai::{GenerationError, HttpMetrics};

use crate::retry::RetryPolicy;

pub const CODE_MODEL_NOT_FOUND: &str = "ollama_model_not_found";
pub const CODE_RATE_LIMITED: &str = "ollama_rate_limited";
pub const CODE_SERVER_ERROR: &str = "ollama_server_error";
pub const CODE_HTTP_ERROR: &str = "ollama_http_error";

/// Longest error body excerpt kept in a fault message.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Clone)]
pub(crate) struct JsonTransport {
    client: reqwest::Client,
    retry: RetryPolicy,
    bearer: Option<HeaderValue>,
}

impl JsonTransport {
    pub(crate) fn new(
        timeout: Duration,
        retry: RetryPolicy,
        api_key: Option<&str>,
    ) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Network(format!("failed to build HTTP client: {e}")))?;

        let bearer = api_key
            .filter(|key| !key.trim().is_empty())
            .map(|key| {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", key.trim())).map_err(|_| {
                    GenerationError::Service {
                        code: CODE_HTTP_ERROR.into(),
                        message: "API key contains characters not allowed in a header".into(),
                        status: None,
                        status_name: None,
                        retryable: false,
                    }
                })?;
                value.set_sensitive(true);
                Ok::<_, GenerationError>(value)
            })
            .transpose()?;

        Ok(Self {
            client,
            retry,
            bearer,
        })
    }

    /// POST `body` as JSON and decode the JSON reply.
    ///
    /// Transport faults are retried per the policy; HTTP error statuses and
    /// undecodable bodies are returned at once.
    pub(crate) async fn post_json<B, R>(
        &self,
        operation: &str,
        url: &str,
        body: &B,
    ) -> Result<(R, HttpMetrics), GenerationError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body)
            .map_err(|e| GenerationError::Decode(format!("failed to encode request: {e}")))?;
        let request_bytes = payload.len();
        let attempts = &AtomicU32::new(0);
        let payload = &payload;

        self.retry
            .run(operation, move || async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let started = Instant::now();

                let mut request = self
                    .client
                    .post(url)
                    .header(CONTENT_TYPE, "application/json")
                    .body(payload.clone());
                if let Some(bearer) = &self.bearer {
                    request = request.header(AUTHORIZATION, bearer.clone());
                }

                let response = request.send().await.map_err(map_reqwest_error)?;
                let status = response.status();
                let bytes = response.bytes().await.map_err(map_reqwest_error)?;
                let elapsed_ms = started.elapsed().as_millis() as u64;

                debug!(operation, url, attempt, status = status.as_u16(), elapsed_ms, "generation HTTP exchange");

                if !status.is_success() {
                    return Err(status_error(status, &bytes));
                }

                let decoded = serde_json::from_slice::<R>(&bytes)
                    .map_err(|e| GenerationError::Decode(e.to_string()))?;

                Ok((
                    decoded,
                    HttpMetrics {
                        status_code: status.as_u16(),
                        elapsed_ms,
                        request_bytes,
                        response_bytes: bytes.len(),
                        attempts: attempt,
                    },
                ))
            })
            .await
    }
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn map_reqwest_error(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout(err.to_string())
    } else if err.is_decode() {
        GenerationError::Decode(err.to_string())
    } else {
        GenerationError::Network(err.to_string())
    }
}

/// Fault for a non-2xx response.
pub(crate) fn status_error(status: StatusCode, body: &[u8]) -> GenerationError {
    let (code, retryable) = match status {
        StatusCode::NOT_FOUND => (CODE_MODEL_NOT_FOUND, false),
        StatusCode::TOO_MANY_REQUESTS => (CODE_RATE_LIMITED, true),
        s if s.is_server_error() => (CODE_SERVER_ERROR, true),
        _ => (CODE_HTTP_ERROR, false),
    };

    GenerationError::Service {
        code: code.into(),
        message: error_message(status, body),
        status: Some(status.as_u16()),
        status_name: status.canonical_reason().map(str::to_string),
        retryable,
    }
}

/// Best-effort message from an error body: `{"error": "..."}` (Ollama),
/// `{"error": {"message": "..."}}` (OpenAI), else the raw text.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    let parsed = serde_json::from_slice::<serde_json::Value>(body).ok();
    let from_json = parsed.as_ref().and_then(|v| match v.get("error") {
        Some(serde_json::Value::String(msg)) => Some(msg.clone()),
        Some(obj) => obj.get("message").and_then(|m| m.as_str()).map(str::to_string),
        None => None,
    });

    let message = from_json.unwrap_or_else(|| {
        let text = String::from_utf8_lossy(body);
        text.trim().chars().take(MAX_ERROR_BODY).collect()
    });

    if message.is_empty() {
        format!("HTTP {status}")
    } else {
        message
    }
}
