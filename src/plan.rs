//! Structured data extracted from the Architect's free-form PLAN.md.
//!
//! The plan is Markdown for humans; two machine-readable conventions are
//! parsed out of it: fenced command blocks that override the sandbox's
//! runtime defaults, and an optional Resource Requirements section that
//! tunes sandbox limits for heavyweight stacks.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

/// Commands extracted from fenced blocks of the form:
///
/// ```text
/// Install Commands:
/// ```bash
/// npm install
/// ```
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanStrategy {
    pub install: Vec<String>,
    pub build: Vec<String>,
    pub test: Vec<String>,
    pub run: Vec<String>,
}

pub fn extract_strategy(plan: &str) -> PlanStrategy {
    PlanStrategy {
        install: extract_command_block(plan, "Install Commands"),
        build: extract_command_block(plan, "Build Commands"),
        test: extract_command_block(plan, "Test Commands"),
        run: extract_command_block(plan, "Run Commands"),
    }
}

fn extract_command_block(plan: &str, section: &str) -> Vec<String> {
    let pattern = format!(r"(?is){section}[:\s]*```(?:bash|sh)?\s*\n(.*?)```");
    let re = Regex::new(&pattern).expect("static plan regex");
    let Some(caps) = re.captures(plan) else {
        return Vec::new();
    };
    caps[1]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Sandbox-limit fields the Architect may set, with their expected shapes.
const RESOURCE_INT_FIELDS: &[&str] =
    &["timeout_install", "timeout_build", "timeout_test", "timeout_lint"];
const RESOURCE_FLOAT_FIELDS: &[&str] = &["cpu_limit"];
const RESOURCE_STRING_FIELDS: &[&str] = &["memory_limit", "tmpfs_size"];

/// Parse a `## Resource Requirements` section into typed overrides suitable
/// for `state.verification`. Placeholder values (`[...]`, `default`) are
/// skipped; unparseable values are logged at debug and dropped.
pub fn extract_resource_requirements(plan: &str) -> HashMap<String, JsonValue> {
    let section_re = Regex::new(r"(?is)##\s*Resource\s+Requirements.*?\n(.*?)(?:\n##|\z)")
        .expect("static plan regex");
    let Some(caps) = section_re.captures(plan) else {
        return HashMap::new();
    };
    let section = &caps[1];
    let mut overrides = HashMap::new();

    let mut parse_field = |field: &str, parse: &dyn Fn(&str) -> Option<JsonValue>| {
        let line_re = Regex::new(&format!(
            r"(?im)^\s*(?:[-*]\s*)?(?:\*\*)?{}(?:\*\*)?\s*:\s*(.+)$",
            regex::escape(field)
        ))
        .expect("static plan regex");
        if let Some(line) = line_re.captures(section) {
            let raw = line[1].trim().trim_matches('"').trim_matches('\'');
            if raw.starts_with('[') || raw.starts_with("default") {
                return;
            }
            match parse(raw) {
                Some(value) => {
                    overrides.insert(field.to_string(), value);
                }
                None => debug!(field, raw, "Could not parse resource field"),
            }
        }
    };

    for field in RESOURCE_INT_FIELDS {
        parse_field(field, &|raw| raw.parse::<u64>().ok().map(JsonValue::from));
    }
    for field in RESOURCE_FLOAT_FIELDS {
        parse_field(field, &|raw| raw.parse::<f64>().ok().map(JsonValue::from));
    }
    for field in RESOURCE_STRING_FIELDS {
        parse_field(field, &|raw| Some(JsonValue::from(raw.to_string())));
    }

    if !overrides.is_empty() {
        info!(?overrides, "Plan recommends sandbox resource overrides");
    }
    overrides
}

/// File paths listed in the plan's directory tree / bullet lists. Used to
/// decide whether engineering output should be chunked across parallel
/// requests.
pub fn extract_planned_files(plan: &str) -> Vec<String> {
    let patterns = [
        // Tree style: ├── src/main.py
        r"[├└│─\s]+([A-Za-z0-9_\-./]+\.[A-Za-z0-9]+)",
        // Bullets: - src/main.py   * `src/main.py`
        r"(?m)^\s*[-*]\s+`?([A-Za-z0-9_\-./]+\.[A-Za-z0-9]+)`?",
        // Numbered: 1. src/main.py
        r"(?m)^\s*\d+\.\s+`?([A-Za-z0-9_\-./]+\.[A-Za-z0-9]+)`?",
    ];
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();
    for pattern in patterns {
        let re = Regex::new(pattern).expect("static plan regex");
        for caps in re.captures_iter(plan) {
            let path = caps[1].trim().to_string();
            if path.contains('.') && path.contains('/') && seen.insert(path.clone()) {
                result.push(path);
            }
        }
    }
    result
}
