//! Collected intelligence record.
//!
//! Findings are written by the tool integrations (scanners, username
//! enumeration, ...) and only ever *read* by the AI pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{FindingId, InvestigationId};

/// A single piece of collected data attached to an investigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub investigation_id: InvestigationId,
    /// Tool that produced the finding (e.g. `spiderfoot`, `sherlock`).
    pub tool_name: String,
    /// Kind of data (e.g. `EMAILADDR`, `USERNAME`, `DOMAIN_NAME`).
    pub data_type: String,
    /// Human-readable summary, when the collector produced one.
    pub summary: Option<String>,
    /// Raw payload as captured from the tool.
    pub raw_data: Option<String>,
    pub collected_at: DateTime<Utc>,
}

impl Finding {
    pub fn new(
        id: FindingId,
        investigation_id: InvestigationId,
        tool_name: impl Into<String>,
        data_type: impl Into<String>,
        collected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            investigation_id,
            tool_name: tool_name.into(),
            data_type: data_type.into(),
            summary: None,
            raw_data: None,
            collected_at,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_raw_data(mut self, raw: impl Into<String>) -> Self {
        self.raw_data = Some(raw.into());
        self
    }
}
