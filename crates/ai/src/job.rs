use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of AI job kinds an analyst can queue.
///
/// Each kind has a fixed list of output sections the model is asked to
/// produce; the prompt builder enumerates them and the completion parser
/// checks for them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiJobType {
    /// Summarise and assess what was collected.
    Analysis,
    /// Draw conclusions about the subject beyond what was directly collected.
    Inference,
}

const ANALYSIS_HEADINGS: [&str; 5] = [
    "Executive Summary",
    "Key Findings",
    "Entities & Relationships",
    "Risk Assessment",
    "Recommended Next Steps",
];

const INFERENCE_HEADINGS: [&str; 5] = [
    "Identity Hypotheses",
    "Behavioral Patterns",
    "Connections & Associations",
    "Confidence & Gaps",
    "Suggested Pivots",
];

impl AiJobType {
    pub const ALL: [AiJobType; 2] = [AiJobType::Analysis, AiJobType::Inference];

    pub fn as_str(&self) -> &'static str {
        match self {
            AiJobType::Analysis => "analysis",
            AiJobType::Inference => "inference",
        }
    }

    /// Output section headings, in the order the model is asked to emit them.
    pub fn section_headings(&self) -> &'static [&'static str] {
        match self {
            AiJobType::Analysis => &ANALYSIS_HEADINGS,
            AiJobType::Inference => &INFERENCE_HEADINGS,
        }
    }

    /// Normalized keys of [`Self::section_headings`].
    pub fn section_keys(&self) -> Vec<String> {
        self.section_headings()
            .iter()
            .map(|h| crate::parser::normalize_heading(h))
            .collect()
    }

    /// One-line description of the task, used in the prompt preamble.
    pub fn task_description(&self) -> &'static str {
        match self {
            AiJobType::Analysis => {
                "Analyze the collected open-source intelligence below and produce a concise, \
                 evidence-backed assessment of the investigation subject."
            }
            AiJobType::Inference => {
                "Infer likely identities, behaviors and connections of the investigation subject \
                 from the collected open-source intelligence below, separating evidence from \
                 speculation."
            }
        }
    }
}

impl core::fmt::Display for AiJobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown AI job type '{0}' (expected one of: analysis, inference)")]
pub struct ParseJobTypeError(pub String);

impl FromStr for AiJobType {
    type Err = ParseJobTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "analysis" => Ok(AiJobType::Analysis),
            "inference" => Ok(AiJobType::Inference),
            _ => Err(ParseJobTypeError(s.to_string())),
        }
    }
}
