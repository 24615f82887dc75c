use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::generation::{GenerationMetrics, HttpMetrics};

/// One `## Heading` block of generated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSection {
    /// Normalized heading (`"Entities & Relationships"` -> `"entities_and_relationships"`).
    pub key: String,
    /// Heading as the model wrote it.
    pub heading: String,
    pub content: String,
}

impl ResultSection {
    pub fn new(key: impl Into<String>, heading: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            heading: heading.into(),
            content: content.into(),
        }
    }
}

/// Parsed, section-keyed representation of a model completion.
///
/// This is an AI insight for consumers (UI, exports); it is never fed back
/// into the findings store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructuredResult {
    pub sections: Vec<ResultSection>,

    /// Free-form metadata (job type, parser version, missing sections, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, JsonValue>,
}

impl StructuredResult {
    pub fn section(&self, key: &str) -> Option<&ResultSection> {
        self.sections.iter().find(|s| s.key == key)
    }

    /// Expected section keys the completion did not contain.
    pub fn missing_sections(&self) -> Vec<String> {
        match self.metadata.get("missing_sections") {
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Structured failure record stored on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiJobErrorInfo {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable code (`ollama_timeout`, `unexpected_error`, ...).
    pub code: String,
    /// Full error chain, for operator triage.
    pub details: Option<String>,
    pub is_retryable: bool,
    pub occurred_at: DateTime<Utc>,
    /// HTTP status and similar context; `None` rather than an empty map.
    pub metadata: Option<BTreeMap<String, JsonValue>>,
}

impl AiJobErrorInfo {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        is_retryable: bool,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            details: None,
            is_retryable,
            occurred_at,
            metadata: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attach metadata; an empty map is normalized to `None`.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, JsonValue>) -> Self {
        self.metadata = if metadata.is_empty() { None } else { Some(metadata) };
        self
    }
}

/// Diagnostics captured for jobs queued with the debug flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiJobDebugInfo {
    pub prompt: String,
    pub prompt_length: usize,
    pub model: String,
    pub request_started_at: DateTime<Utc>,
    pub response_received_at: Option<DateTime<Utc>>,
    /// Provider-side timings and token counts.
    pub generation: Option<GenerationMetrics>,
    /// Transport-side timing and payload sizes.
    pub http: Option<HttpMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_error_metadata_is_absent() {
        let info = AiJobErrorInfo::new("unexpected_error", "boom", false, Utc::now())
            .with_metadata(BTreeMap::new());
        assert!(info.metadata.is_none());
    }

    #[test]
    fn missing_sections_reads_metadata() {
        let mut result = StructuredResult::default();
        result
            .metadata
            .insert("missing_sections".into(), json!(["risk_assessment"]));
        assert_eq!(result.missing_sections(), vec!["risk_assessment".to_string()]);
    }
}
