//! Completion parser: raw generated text -> [`StructuredResult`].
//!
//! Sections are introduced by lines starting with `## `. Content accumulates
//! until the next header or end of input.

use std::collections::BTreeSet;

use serde_json::{Value as JsonValue, json};

use crate::job::AiJobType;
use crate::result::{ResultSection, StructuredResult};

/// Format tag stored alongside every structured result.
pub const RESULT_FORMAT_VERSION: &str = "sections.v1";

/// Parser version recorded in result metadata.
pub const PARSER_VERSION: &str = "1.0";

const HEADER_PREFIX: &str = "## ";

/// Parse `raw` into sections and record which expected sections are missing.
pub fn parse_completion(raw: &str, job_type: AiJobType) -> StructuredResult {
    let trimmed = raw.trim();
    let expected = job_type.section_keys();

    let mut result = StructuredResult::default();

    if trimmed.is_empty() {
        result.sections.push(ResultSection::new(
            "empty_response",
            "Empty Response",
            "The model returned an empty response.",
        ));
        finish(&mut result, job_type, expected);
        return result;
    }

    let mut preamble: Vec<&str> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in trimmed.lines() {
        if let Some(heading) = line.strip_prefix(HEADER_PREFIX) {
            if let Some((heading, body)) = current.take() {
                push_section(&mut result.sections, heading, &body);
            }
            current = Some((heading.trim().to_string(), Vec::new()));
        } else {
            match current.as_mut() {
                Some((_, body)) => body.push(line),
                None => preamble.push(line),
            }
        }
    }
    if let Some((heading, body)) = current.take() {
        push_section(&mut result.sections, heading, &body);
    }

    if result.sections.is_empty() {
        result
            .sections
            .push(ResultSection::new("full_response", "Full Response", trimmed));
    } else {
        let preamble = preamble.join("\n");
        let preamble = preamble.trim();
        if !preamble.is_empty() {
            result.metadata.insert("preamble".into(), json!(preamble));
        }
    }

    let found: BTreeSet<&str> = result.sections.iter().map(|s| s.key.as_str()).collect();
    let missing: Vec<String> = expected
        .into_iter()
        .filter(|key| !found.contains(key.as_str()))
        .collect();
    finish(&mut result, job_type, missing);
    result
}

fn push_section(sections: &mut Vec<ResultSection>, heading: String, body: &[&str]) {
    let mut key = normalize_heading(&heading);
    if key.is_empty() {
        key = format!("section_{}", sections.len() + 1);
    }
    let content = body.join("\n").trim().to_string();
    sections.push(ResultSection { key, heading, content });
}

fn finish(result: &mut StructuredResult, job_type: AiJobType, missing: Vec<String>) {
    let metadata = &mut result.metadata;
    metadata.insert("job_type".into(), json!(job_type.as_str()));
    metadata.insert("parser_version".into(), json!(PARSER_VERSION));
    metadata.insert("section_count".into(), json!(result.sections.len()));
    metadata.insert(
        "missing_sections".into(),
        JsonValue::Array(missing.into_iter().map(JsonValue::String).collect()),
    );
}

/// Normalize a heading into a section key.
///
/// Lowercase, `&` becomes `and`, punctuation is dropped and the remaining
/// alphanumeric tokens are joined with `_`.
pub fn normalize_heading(heading: &str) -> String {
    let spaced = heading.replace('&', " and ");
    spaced
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn well_formed(job_type: AiJobType) -> String {
        job_type
            .section_headings()
            .iter()
            .map(|h| format!("## {h}\n- something about {h}\n"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn normalizes_headings() {
        assert_eq!(normalize_heading("Entities & Relationships"), "entities_and_relationships");
        assert_eq!(normalize_heading("  Key Findings: "), "key_findings");
        assert_eq!(normalize_heading("**Risk** Assessment!"), "risk_assessment");
        assert_eq!(normalize_heading("Confidence&Gaps"), "confidence_and_gaps");
        assert_eq!(normalize_heading("---"), "");
    }

    #[test]
    fn well_formed_input_has_no_missing_sections() {
        for job_type in AiJobType::ALL {
            let result = parse_completion(&well_formed(job_type), job_type);
            assert_eq!(result.sections.len(), 5);
            assert!(result.missing_sections().is_empty());
            let keys: Vec<_> = result.sections.iter().map(|s| s.key.clone()).collect();
            assert_eq!(keys, job_type.section_keys());
        }
    }

    #[test]
    fn empty_input_yields_single_empty_section() {
        let result = parse_completion("  \n\t ", AiJobType::Analysis);
        assert_eq!(result.sections.len(), 1);
        assert_eq!(result.sections[0].key, "empty_response");
        assert_eq!(result.missing_sections(), AiJobType::Analysis.section_keys());
        assert_eq!(result.metadata["job_type"], json!("analysis"));
        assert_eq!(result.metadata["parser_version"], json!(PARSER_VERSION));
    }

    #[test]
    fn headerless_input_becomes_full_response() {
        let result = parse_completion("\n  just some prose\nwith two lines  \n", AiJobType::Inference);
        assert_eq!(result.sections.len(), 1);
        assert_eq!(result.sections[0].key, "full_response");
        assert_eq!(result.sections[0].content, "just some prose\nwith two lines");
        assert_eq!(result.missing_sections().len(), 5);
    }

    #[test]
    fn records_missing_sections_and_preamble() {
        let raw = "Sure, here is the report.\n\n## Executive Summary\nShort.\n\n## Key Findings\n- a\n- b\n### Detail\nnested stays in body\n";
        let result = parse_completion(raw, AiJobType::Analysis);

        assert_eq!(result.sections.len(), 2);
        let findings = result.section("key_findings").unwrap();
        assert_eq!(findings.heading, "Key Findings");
        assert_eq!(findings.content, "- a\n- b\n### Detail\nnested stays in body");
        assert_eq!(
            result.missing_sections(),
            vec!["entities_and_relationships", "risk_assessment", "recommended_next_steps"]
        );
        assert_eq!(result.metadata["preamble"], json!("Sure, here is the report."));
        assert_eq!(result.metadata["section_count"], json!(2));
    }

    #[test]
    fn blank_heading_gets_positional_key() {
        let result = parse_completion("## \nbody\n## Risk Assessment\nlow", AiJobType::Analysis);
        assert_eq!(result.sections[0].key, "section_1");
        assert_eq!(result.sections[1].key, "risk_assessment");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: parsing never panics and always tags job type and parser version.
            #[test]
            fn always_tags_metadata(raw in "(## [A-Za-z &]{0,20}\n|[^\n]{0,40}\n){0,12}") {
                let result = parse_completion(&raw, AiJobType::Analysis);
                prop_assert!(!result.sections.is_empty());
                prop_assert_eq!(&result.metadata["job_type"], &json!("analysis"));
                prop_assert_eq!(&result.metadata["parser_version"], &json!(PARSER_VERSION));
            }
        }
    }
}
