//! Interpretation of backend plan and apply output.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::ChangeCounts;

static PLAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Plan:\s+(\d+)\s+to add,\s+(\d+)\s+to change,\s+(\d+)\s+to destroy").unwrap()
});

static COMPLETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(Apply|Destroy) complete!.*$").unwrap()
});

/// Extract change counts from the `Plan: X to add, Y to change, Z to destroy.` line.
///
/// Returns `None` when the output carries no such line (e.g. "No changes.").
pub fn parse_change_counts(output: &str) -> Option<ChangeCounts> {
    let caps = PLAN_RE.captures(output)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    Some(ChangeCounts {
        add: num(1)?,
        change: num(2)?,
        destroy: num(3)?,
    })
}

/// Pull the diff description out of plan output: everything from the first
/// resource action header (or the `Plan:` line) to the end of the `Plan:` line.
pub fn plan_summary(output: &str) -> String {
    let trimmed = output.trim();
    if let Some(idx) = trimmed.find("No changes.") {
        let rest = &trimmed[idx..];
        return rest.lines().next().unwrap_or(rest).trim().to_string();
    }
    let start = trimmed
        .find("Terraform will perform the following actions")
        .or_else(|| trimmed.find("Plan:"))
        .unwrap_or(0);
    let end = PLAN_RE
        .find(trimmed)
        .map(|m| {
            trimmed[m.end()..]
                .find('\n')
                .map(|nl| m.end() + nl)
                .unwrap_or(trimmed.len())
        })
        .unwrap_or(trimmed.len());
    if start >= end {
        return trimmed.to_string();
    }
    trimmed[start..end].trim().to_string()
}

/// The `Apply complete!` / `Destroy complete!` line, if the backend printed one.
pub fn completion_line(output: &str) -> Option<String> {
    COMPLETE_RE
        .find(output)
        .map(|m| m.as_str().trim().to_string())
}
