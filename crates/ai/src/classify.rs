//! Fault classification for failed AI jobs.
//!
//! | fault | code | retryable |
//! |-------|------|-----------|
//! | [`GenerationError`] | its own code | its own flag |
//! | I/O timeout | `ollama_timeout` | yes |
//! | other I/O (transport) error | `ollama_network` | yes |
//! | JSON (de)serialization error | `ollama_parse_error` | no |
//! | anything else | `unexpected_error` | no |

use std::collections::BTreeMap;
use std::io;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::generation::GenerationError;
use crate::result::AiJobErrorInfo;

pub const CODE_TIMEOUT: &str = "ollama_timeout";
pub const CODE_NETWORK: &str = "ollama_network";
pub const CODE_PARSE: &str = "ollama_parse_error";
pub const CODE_UNEXPECTED: &str = "unexpected_error";

/// Map a fault raised while processing a job into a stored error record.
///
/// The whole `anyhow` chain is inspected, so context added on top of a
/// [`GenerationError`] does not hide its classification. The outermost
/// message is kept as the human-readable message.
pub fn classify_error(err: &anyhow::Error, occurred_at: DateTime<Utc>) -> AiJobErrorInfo {
    let message = err.to_string();
    let details = format!("{err:#}");

    let (code, retryable, metadata) = classify_chain(err);

    AiJobErrorInfo::new(code, message, retryable, occurred_at)
        .with_details(details)
        .with_metadata(metadata)
}

fn classify_chain(err: &anyhow::Error) -> (String, bool, BTreeMap<String, serde_json::Value>) {
    let mut metadata = BTreeMap::new();

    if let Some(generation) = err.chain().find_map(|e| e.downcast_ref::<GenerationError>()) {
        if let Some((status, name)) = generation.http_status() {
            metadata.insert("http_status".to_string(), json!(status));
            if let Some(name) = name {
                metadata.insert("http_status_name".to_string(), json!(name));
            }
        }
        return (generation.code().to_string(), generation.is_retryable(), metadata);
    }

    if let Some(io_err) = err.chain().find_map(|e| e.downcast_ref::<io::Error>()) {
        let code = if io_err.kind() == io::ErrorKind::TimedOut {
            CODE_TIMEOUT
        } else {
            CODE_NETWORK
        };
        metadata.insert("io_error_kind".to_string(), json!(format!("{:?}", io_err.kind())));
        return (code.to_string(), true, metadata);
    }

    if err.chain().any(|e| e.is::<serde_json::Error>()) {
        return (CODE_PARSE.to_string(), false, metadata);
    }

    (CODE_UNEXPECTED.to_string(), false, metadata)
}
