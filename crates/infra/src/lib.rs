//! Infrastructure layer: job storage, the AI job queue and worker, outbound
//! generation clients, and configuration.

pub mod config;
pub mod generation;
pub mod investigations;
pub mod jobs;
pub mod retry;

pub use config::{CasefileConfig, ConfigError};
