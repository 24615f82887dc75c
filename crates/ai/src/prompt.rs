//! Deterministic prompt construction from collected findings.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use casefile_core::Finding;

use crate::job::AiJobType;

/// Findings beyond this many (in collection order) are left out of the prompt.
pub const MAX_PROMPT_FINDINGS: usize = 60;

const SUMMARY_MAX_CHARS: usize = 400;
const RAW_MAX_CHARS: usize = 300;
const NO_DETAILS: &str = "(no details recorded)";

/// Build the prompt for `job_type` from `findings`.
///
/// `findings` are expected in collection order. Output is a pure function of
/// the input: identical findings and job type yield a byte-identical prompt.
pub fn build_prompt(findings: &[Finding], job_type: AiJobType) -> String {
    let mut out = String::with_capacity(2048 + findings.len().min(MAX_PROMPT_FINDINGS) * 160);

    write_preamble(&mut out, job_type);
    write_sections(&mut out, job_type);
    write_formatting(&mut out);
    write_dataset_context(&mut out, findings);
    write_findings(&mut out, findings);

    out
}

fn write_preamble(out: &mut String, job_type: AiJobType) {
    out.push_str(
        "You are an experienced open-source intelligence (OSINT) analyst supporting an investigation.\n",
    );
    out.push_str(job_type.task_description());
    out.push_str("\n\n");
}

fn write_sections(out: &mut String, job_type: AiJobType) {
    out.push_str("Respond in Markdown using exactly these section headings, in this order:\n");
    for (idx, heading) in job_type.section_headings().iter().enumerate() {
        let _ = writeln!(out, "{}. ## {}", idx + 1, heading);
    }
    out.push('\n');
}

fn write_formatting(out: &mut String) {
    out.push_str("Formatting guidance:\n");
    out.push_str("- Start every section with its `## ` heading on a line of its own; add no other `## ` headings.\n");
    out.push_str("- Use short bullet points and name the tool that produced each fact you rely on.\n");
    out.push_str("- Separate evidence from speculation and state your confidence explicitly.\n");
    out.push_str("- Do not invent data that is not present in the findings.\n");
    out.push_str("- If a section has nothing to report, write \"No relevant information.\"\n\n");
}

fn write_dataset_context(out: &mut String, findings: &[Finding]) {
    let shown = findings.len().min(MAX_PROMPT_FINDINGS);
    let tools: BTreeSet<&str> = findings.iter().map(|f| f.tool_name.as_str()).collect();
    let data_types: BTreeSet<&str> = findings.iter().map(|f| f.data_type.as_str()).collect();

    out.push_str("Dataset context:\n");
    let _ = writeln!(out, "- Findings collected: {}", findings.len());
    let _ = writeln!(out, "- Findings included below: {shown}");
    let _ = writeln!(out, "- Tools: {}", join_or_none(&tools));
    let _ = writeln!(out, "- Data types: {}", join_or_none(&data_types));
    if findings.len() > MAX_PROMPT_FINDINGS {
        let _ = writeln!(
            out,
            "- Note: the dataset was truncated to the first {} of {} findings; treat omitted data as unknown.",
            MAX_PROMPT_FINDINGS,
            findings.len()
        );
    }
    out.push('\n');
}

fn write_findings(out: &mut String, findings: &[Finding]) {
    out.push_str("Findings:\n");

    if findings.is_empty() {
        out.push_str("No findings have been collected for this investigation yet.\n");
        return;
    }

    // Grouped by data type (sorted); collection order is kept inside a group.
    let mut groups: BTreeMap<&str, Vec<&Finding>> = BTreeMap::new();
    for finding in findings.iter().take(MAX_PROMPT_FINDINGS) {
        groups.entry(finding.data_type.as_str()).or_default().push(finding);
    }

    for (data_type, items) in groups {
        let label = if data_type.trim().is_empty() { "UNKNOWN" } else { data_type };
        let _ = writeln!(out, "\n### {} ({})", label, items.len());
        for finding in items {
            let _ = writeln!(
                out,
                "- [{}] {} - {}",
                finding.tool_name,
                finding.collected_at.format("%Y-%m-%d %H:%M:%S UTC"),
                finding_detail(finding)
            );
        }
    }
}

/// Summary, else raw payload, else a placeholder.
fn finding_detail(finding: &Finding) -> String {
    if let Some(summary) = non_blank(finding.summary.as_deref()) {
        return truncate(summary, SUMMARY_MAX_CHARS);
    }
    if let Some(raw) = non_blank(finding.raw_data.as_deref()) {
        return truncate(raw, RAW_MAX_CHARS);
    }
    NO_DETAILS.to_string()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Collapse whitespace (bullets stay on one line) and cap at `max` chars.
fn truncate(text: &str, max: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(max).collect();
    cut.push_str("...");
    cut
}

fn join_or_none(items: &BTreeSet<&str>) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.iter().copied().collect::<Vec<_>>().join(", ")
    }
}
