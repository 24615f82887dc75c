//! Generation service clients.
//!
//! Two providers speak plain JSON over HTTP:
//!
//! - `local`: an Ollama server (`POST /api/generate`)
//! - `remote`: an OpenAI-compatible API (`POST /v1/chat/completions`, bearer key)
//!
//! The provider is chosen once at startup by [`build_client`].

mod http;
mod ollama;
mod remote;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use casefile_ai::{AiJobType, GenerationClient, GenerationError};

use crate::retry::RetryPolicy;

pub use ollama::OllamaClient;
pub use remote::RemoteGenerationClient;

pub const DEFAULT_LOCAL_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_REMOTE_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationProvider {
    Local,
    Remote,
}

impl GenerationProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationProvider::Local => "local",
            GenerationProvider::Remote => "remote",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            GenerationProvider::Local => DEFAULT_LOCAL_BASE_URL,
            GenerationProvider::Remote => DEFAULT_REMOTE_BASE_URL,
        }
    }
}

impl std::fmt::Display for GenerationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "ollama" => Ok(GenerationProvider::Local),
            "remote" | "openai" => Ok(GenerationProvider::Remote),
            other => Err(format!("unknown generation provider: {other}")),
        }
    }
}

/// Model used when a job does not name one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefaults {
    pub analysis: String,
    pub inference: String,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            analysis: "llama3.1:8b".into(),
            inference: "llama3.1:8b".into(),
        }
    }
}

impl ModelDefaults {
    pub fn for_job(&self, job_type: AiJobType) -> &str {
        match job_type {
            AiJobType::Analysis => &self.analysis,
            AiJobType::Inference => &self.inference,
        }
    }
}

/// Generation client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub provider: GenerationProvider,
    pub base_url: String,
    /// Bearer token for the remote provider.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub models: ModelDefaults,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: GenerationProvider::Local,
            base_url: DEFAULT_LOCAL_BASE_URL.into(),
            api_key: None,
            request_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            models: ModelDefaults::default(),
        }
    }
}

/// Build the configured generation client.
pub fn build_client(config: &GenerationConfig) -> Result<Arc<dyn GenerationClient>, GenerationError> {
    info!(
        provider = %config.provider,
        base_url = %config.base_url,
        timeout_secs = config.request_timeout.as_secs(),
        max_http_attempts = config.retry.max_attempts,
        "building generation client"
    );

    Ok(match config.provider {
        GenerationProvider::Local => Arc::new(OllamaClient::new(
            &config.base_url,
            config.request_timeout,
            config.retry.clone(),
        )?),
        GenerationProvider::Remote => Arc::new(RemoteGenerationClient::new(
            &config.base_url,
            config.api_key.clone(),
            config.request_timeout,
            config.retry.clone(),
        )?),
    })
}
