//! Runtime configuration from environment variables.
//!
//! | variable | default |
//! |----------|---------|
//! | `DATABASE_URL` | unset |
//! | `CASEFILE_USE_POSTGRES` | `true` when `DATABASE_URL` is set |
//! | `CASEFILE_JOB_MAX_ATTEMPTS` | `3` |
//! | `CASEFILE_JOB_RETRY_BACKOFF_SECONDS` | `5` (at most one week) |
//! | `CASEFILE_JOB_LEASE_TIMEOUT_SECONDS` | `900` (`0` disables recovery) |
//! | `CASEFILE_WORKER_ID` | `casefile-worker-<uuid>` |
//! | `CASEFILE_WORKER_IDLE_DELAY_MS` | `3000` |
//! | `CASEFILE_WORKER_SUCCESS_DELAY_MS` | `250` |
//! | `CASEFILE_WORKER_LEASE_SWEEP_SECONDS` | `60` (`0` disables the sweep) |
//! | `CASEFILE_GENERATION_PROVIDER` | `local` |
//! | `CASEFILE_GENERATION_BASE_URL` | provider default |
//! | `CASEFILE_GENERATION_API_KEY` | unset |
//! | `CASEFILE_GENERATION_TIMEOUT_SECONDS` | `120` |
//! | `CASEFILE_MODEL_ANALYSIS`, `CASEFILE_MODEL_INFERENCE` | `llama3.1:8b` |
//! | `CASEFILE_HTTP_RETRY_MAX_ATTEMPTS` | `3` |
//! | `CASEFILE_HTTP_RETRY_INITIAL_DELAY_MS` | `500` |
//! | `CASEFILE_HTTP_RETRY_MULTIPLIER` | `2.0` |
//! | `CASEFILE_HTTP_RETRY_MAX_DELAY_MS` | `10000` |

use std::str::FromStr;
use std::time::Duration;

use crate::generation::{GenerationConfig, GenerationProvider};
use crate::jobs::{AiJobWorkerConfig, JobQueueConfig, MAX_RETRY_BACKOFF};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key} must be set: {reason}")]
    Missing { key: &'static str, reason: &'static str },
}

/// Everything the worker process needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CasefileConfig {
    pub database_url: Option<String>,
    pub use_postgres: bool,
    pub queue: JobQueueConfig,
    pub worker: AiJobWorkerConfig,
    pub generation: GenerationConfig,
}

impl CasefileConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let database_url = env.string("DATABASE_URL");
        let use_postgres = env.parse("CASEFILE_USE_POSTGRES")?.unwrap_or(database_url.is_some());
        if use_postgres && database_url.is_none() {
            return Err(ConfigError::Missing {
                key: "DATABASE_URL",
                reason: "CASEFILE_USE_POSTGRES is enabled",
            });
        }

        let queue_defaults = JobQueueConfig::default();
        let max_attempts = env
            .parse::<u32>("CASEFILE_JOB_MAX_ATTEMPTS")?
            .unwrap_or(queue_defaults.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "CASEFILE_JOB_MAX_ATTEMPTS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        let retry_backoff = env
            .secs("CASEFILE_JOB_RETRY_BACKOFF_SECONDS")?
            .unwrap_or(queue_defaults.retry_backoff);
        if retry_backoff > MAX_RETRY_BACKOFF {
            return Err(ConfigError::Invalid {
                key: "CASEFILE_JOB_RETRY_BACKOFF_SECONDS",
                value: retry_backoff.as_secs().to_string(),
                reason: format!("must be at most {}", MAX_RETRY_BACKOFF.as_secs()),
            });
        }
        let queue = JobQueueConfig {
            max_attempts,
            retry_backoff,
            lease_timeout: match env.secs("CASEFILE_JOB_LEASE_TIMEOUT_SECONDS")? {
                Some(d) if d.is_zero() => None,
                Some(d) => Some(d),
                None => queue_defaults.lease_timeout,
            },
        };

        let worker_defaults = AiJobWorkerConfig::default();
        let worker = AiJobWorkerConfig {
            worker_id: env.string("CASEFILE_WORKER_ID").unwrap_or(worker_defaults.worker_id),
            idle_delay: env
                .millis("CASEFILE_WORKER_IDLE_DELAY_MS")?
                .unwrap_or(worker_defaults.idle_delay),
            success_delay: env
                .millis("CASEFILE_WORKER_SUCCESS_DELAY_MS")?
                .unwrap_or(worker_defaults.success_delay),
            lease_sweep_interval: match env.secs("CASEFILE_WORKER_LEASE_SWEEP_SECONDS")? {
                Some(d) if d.is_zero() => None,
                Some(d) => Some(d),
                None => worker_defaults.lease_sweep_interval,
            },
        };

        let gen_defaults = GenerationConfig::default();
        let provider = env
            .parse::<GenerationProvider>("CASEFILE_GENERATION_PROVIDER")?
            .unwrap_or(gen_defaults.provider);
        let mut retry = gen_defaults.retry.clone();
        if let Some(n) = env.parse("CASEFILE_HTTP_RETRY_MAX_ATTEMPTS")? {
            retry.max_attempts = n;
        }
        if let Some(d) = env.millis("CASEFILE_HTTP_RETRY_INITIAL_DELAY_MS")? {
            retry.initial_delay = d;
        }
        if let Some(m) = env.parse::<f64>("CASEFILE_HTTP_RETRY_MULTIPLIER")? {
            retry.multiplier = m;
        }
        if let Some(d) = env.millis("CASEFILE_HTTP_RETRY_MAX_DELAY_MS")? {
            retry.max_delay = d;
        }

        let mut models = gen_defaults.models.clone();
        if let Some(model) = env.string("CASEFILE_MODEL_ANALYSIS") {
            models.analysis = model;
        }
        if let Some(model) = env.string("CASEFILE_MODEL_INFERENCE") {
            models.inference = model;
        }

        let generation = GenerationConfig {
            provider,
            base_url: env
                .string("CASEFILE_GENERATION_BASE_URL")
                .unwrap_or_else(|| provider.default_base_url().to_string()),
            api_key: env.string("CASEFILE_GENERATION_API_KEY"),
            request_timeout: env
                .secs("CASEFILE_GENERATION_TIMEOUT_SECONDS")?
                .unwrap_or(gen_defaults.request_timeout),
            retry,
            models,
        };

        Ok(Self {
            database_url,
            use_postgres,
            queue,
            worker,
            generation,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Trimmed value; blank counts as unset.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    key,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn secs(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<CasefileConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CasefileConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config(&[]).unwrap();
        assert!(!cfg.use_postgres);
        assert_eq!(cfg.queue, JobQueueConfig::default());
        assert_eq!(cfg.worker.idle_delay, Duration::from_secs(3));
        assert_eq!(cfg.worker.success_delay, Duration::from_millis(250));
        assert_eq!(cfg.generation.provider, GenerationProvider::Local);
        assert_eq!(cfg.generation.base_url, "http://localhost:11434");
    }

    #[test]
    fn database_url_enables_postgres_by_default() {
        let cfg = config(&[("DATABASE_URL", "postgres://localhost/casefile")]).unwrap();
        assert!(cfg.use_postgres);

        let cfg = config(&[
            ("DATABASE_URL", "postgres://localhost/casefile"),
            ("CASEFILE_USE_POSTGRES", "false"),
        ])
        .unwrap();
        assert!(!cfg.use_postgres);
    }

    #[test]
    fn postgres_without_url_is_rejected() {
        let err = config(&[("CASEFILE_USE_POSTGRES", "true")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "DATABASE_URL", .. }));
    }

    #[test]
    fn queue_and_worker_overrides() {
        let cfg = config(&[
            ("CASEFILE_JOB_MAX_ATTEMPTS", "5"),
            ("CASEFILE_JOB_RETRY_BACKOFF_SECONDS", "1"),
            ("CASEFILE_JOB_LEASE_TIMEOUT_SECONDS", "0"),
            ("CASEFILE_WORKER_ID", " worker-a "),
            ("CASEFILE_WORKER_IDLE_DELAY_MS", "10"),
        ])
        .unwrap();

        assert_eq!(cfg.queue.max_attempts, 5);
        assert_eq!(cfg.queue.retry_backoff, Duration::from_secs(1));
        assert_eq!(cfg.queue.lease_timeout, None);
        assert_eq!(cfg.worker.worker_id, "worker-a");
        assert_eq!(cfg.worker.idle_delay, Duration::from_millis(10));
    }

    #[test]
    fn remote_provider_settings() {
        let cfg = config(&[
            ("CASEFILE_GENERATION_PROVIDER", "remote"),
            ("CASEFILE_GENERATION_API_KEY", "sk-test"),
            ("CASEFILE_MODEL_INFERENCE", "gpt-4o-mini"),
            ("CASEFILE_HTTP_RETRY_MAX_ATTEMPTS", "1"),
        ])
        .unwrap();

        assert_eq!(cfg.generation.base_url, "https://api.openai.com");
        assert_eq!(cfg.generation.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.generation.models.inference, "gpt-4o-mini");
        assert_eq!(cfg.generation.retry.max_attempts, 1);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = config(&[("CASEFILE_JOB_RETRY_BACKOFF_SECONDS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CASEFILE_JOB_RETRY_BACKOFF_SECONDS", .. }));

        let err = config(&[("CASEFILE_JOB_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(err.to_string().contains("CASEFILE_JOB_MAX_ATTEMPTS"));
    }

    #[test]
    fn retry_backoff_beyond_a_week_is_rejected() {
        let err = config(&[("CASEFILE_JOB_RETRY_BACKOFF_SECONDS", "10000000000000")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CASEFILE_JOB_RETRY_BACKOFF_SECONDS", .. }));

        let cfg = config(&[("CASEFILE_JOB_RETRY_BACKOFF_SECONDS", "604800")]).unwrap();
        assert_eq!(cfg.queue.retry_backoff, MAX_RETRY_BACKOFF);
    }
}
