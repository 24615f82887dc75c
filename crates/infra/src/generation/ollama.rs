use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use casefile_ai::{
    GenerationClient, GenerationError, GenerationMetrics, GenerationRequest, GenerationResponse,
};

use super::http::{JsonTransport, join_url};
use crate::retry::RetryPolicy;

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// Non-streaming `/api/generate` reply. Timings are nanoseconds.
#[derive(Debug, Deserialize)]
struct GenerateReply {
    #[serde(default)]
    model: Option<String>,
    response: String,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    load_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    prompt_eval_duration: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

/// Client for a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    endpoint: String,
    transport: JsonTransport,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self, GenerationError> {
        Ok(Self {
            endpoint: join_url(base_url, "api/generate"),
            transport: JsonTransport::new(timeout, retry, None)?,
        })
    }
}

#[async_trait]
impl GenerationClient for OllamaClient {
    fn provider(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
        };
        let (reply, http) = self
            .transport
            .post_json::<_, GenerateReply>("ollama_generate", &self.endpoint, &body)
            .await?;

        Ok(GenerationResponse {
            text: reply.response,
            model: reply.model.unwrap_or_else(|| request.model.clone()),
            done_reason: reply.done_reason,
            metrics: GenerationMetrics {
                total_duration_ns: reply.total_duration,
                load_duration_ns: reply.load_duration,
                prompt_eval_count: reply.prompt_eval_count,
                prompt_eval_duration_ns: reply.prompt_eval_duration,
                eval_count: reply.eval_count,
                eval_duration_ns: reply.eval_duration,
            },
            http,
        })
    }
}
