//! `casefile-ai`
//!
//! **Responsibility:** the pure half of the AI job pipeline.
//!
//! - Job types and their fixed output section headings
//! - Prompt construction from collected findings
//! - Parsing generated text into a section-keyed structured result
//! - Classifying faults into retryability-tagged error records
//! - The generation client boundary (trait + fault taxonomy)
//!
//! Nothing in this crate performs I/O; storage and HTTP live in `casefile-infra`.

pub mod classify;
pub mod generation;
pub mod job;
pub mod parser;
pub mod prompt;
pub mod result;

pub use classify::classify_error;
pub use generation::{
    GenerationClient, GenerationError, GenerationMetrics, GenerationRequest, GenerationResponse,
    HttpMetrics,
};
pub use job::{AiJobType, ParseJobTypeError};
pub use parser::{PARSER_VERSION, RESULT_FORMAT_VERSION, parse_completion};
pub use prompt::{MAX_PROMPT_FINDINGS, build_prompt};
pub use result::{AiJobDebugInfo, AiJobErrorInfo, ResultSection, StructuredResult};
