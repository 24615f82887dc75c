use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use casefile_ai::{
    GenerationClient, GenerationError, GenerationMetrics, GenerationRequest, GenerationResponse,
};

use super::http::{JsonTransport, join_url};
use crate::retry::RetryPolicy;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

/// Client for an OpenAI-compatible chat completions API.
#[derive(Debug, Clone)]
pub struct RemoteGenerationClient {
    endpoint: String,
    transport: JsonTransport,
}

impl RemoteGenerationClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            endpoint: join_url(base_url, "v1/chat/completions"),
            transport: JsonTransport::new(timeout, retry, api_key.as_deref())?,
        })
    }
}

#[async_trait]
impl GenerationClient for RemoteGenerationClient {
    fn provider(&self) -> &str {
        "remote"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError> {
        let body = ChatBody {
            model: &request.model,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            stream: false,
        };
        let (reply, http) = self
            .transport
            .post_json::<_, ChatReply>("remote_chat_completion", &self.endpoint, &body)
            .await?;

        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::Decode("response contained no choices".into()))?;
        let usage = reply.usage;

        Ok(GenerationResponse {
            text: choice.message.content.unwrap_or_default(),
            model: reply.model.unwrap_or_else(|| request.model.clone()),
            done_reason: choice.finish_reason,
            metrics: GenerationMetrics {
                prompt_eval_count: usage.as_ref().and_then(|u| u.prompt_tokens),
                eval_count: usage.as_ref().and_then(|u| u.completion_tokens),
                ..Default::default()
            },
            http,
        })
    }
}
