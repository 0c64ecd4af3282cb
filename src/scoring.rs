//! Deterministic quality metrics over sandbox results.
//!
//! The score the loop converges on comes from two places: the Verifier
//! agent's report (parsed for an `Overall Score: X/10` line) and this
//! module's metric over the raw sandbox output. The report wins when both
//! exist; 5.0 ("needs human judgement") when neither does.

use regex::Regex;

use crate::sandbox::SandboxResult;

/// Parse test pass/total counts out of test-runner output.
///
/// Recognized dialects:
/// - pytest: `5 passed, 2 failed`
/// - jest/vitest: `Tests:  3 passed, 4 total`
/// - go test: `ok` / `FAIL` package lines
/// - generic: `7/9 tests passed`
pub fn parse_test_counts(output: &str) -> (u32, u32) {
    let passed_re = Regex::new(r"(\d+)\s+passed").expect("static regex");
    let failed_re = Regex::new(r"(\d+)\s+failed").expect("static regex");

    // Jest's summary also matches the pytest pattern, so check it first.
    let jest_re =
        Regex::new(r"Tests:\s+(\d+)\s+passed.*?(\d+)\s+total").expect("static regex");
    if let Some(caps) = jest_re.captures(output) {
        let passed: u32 = caps[1].parse().unwrap_or(0);
        let total: u32 = caps[2].parse().unwrap_or(0);
        return (passed, total);
    }

    if let Some(caps) = passed_re.captures(output) {
        let passed: u32 = caps[1].parse().unwrap_or(0);
        let failed: u32 = failed_re
            .captures(output)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(0);
        return (passed, passed + failed);
    }

    let ok_count = Regex::new(r"(?m)^ok\s+")
        .expect("static regex")
        .find_iter(output)
        .count() as u32;
    let fail_count = Regex::new(r"(?m)^FAIL\s+")
        .expect("static regex")
        .find_iter(output)
        .count() as u32;
    if ok_count + fail_count > 0 {
        return (ok_count, ok_count + fail_count);
    }

    let generic_re =
        Regex::new(r"(?i)(\d+)/(\d+)\s*(?:tests?\s+)?passed").expect("static regex");
    if let Some(caps) = generic_re.captures(output) {
        return (caps[1].parse().unwrap_or(0), caps[2].parse().unwrap_or(0));
    }

    (0, 0)
}

/// Count lint issues: `file:line:col:` diagnostic lines, falling back to an
/// explicit `N problems` / `N errors` / `N warnings` summary.
pub fn count_lint_issues(output: &str) -> u32 {
    let issue_re = Regex::new(r"(?m)^\s*\S+:\d+:\d+:?\s+").expect("static regex");
    let issue_count = issue_re.find_iter(output).count() as u32;
    if issue_count > 0 {
        return issue_count;
    }

    let summary_re =
        Regex::new(r"(?i)(\d+)\s+(?:problems?|errors?|warnings?)").expect("static regex");
    if let Some(caps) = summary_re.captures(output) {
        return caps[1].parse().unwrap_or(0);
    }
    0
}

/// Deterministic 0–10 metric:
///
/// | component | points | criterion |
/// |---|---|---|
/// | build | 3 | install and build both exited 0 |
/// | tests | 4 | 4 · passed/total (0 when no tests reported) |
/// | lint | 2 | 0 issues → 2; <5 → 1; else 0 |
/// | no critical errors | 1 | no collected runtime errors |
///
/// Returns None in code-review-only mode: with no sandbox signal the metric
/// would be meaningless, so the Verifier's report score decides.
pub fn metric_score(result: &SandboxResult) -> Option<f64> {
    if result.code_review_only {
        return None;
    }

    let mut score = 0.0;
    if result.build_succeeded() {
        score += 3.0;
    }
    let (passed, total) = result.test_counts;
    if total > 0 {
        score += 4.0 * (passed as f64 / total as f64);
    }
    match result.lint_issues {
        0 => score += 2.0,
        1..=4 => score += 1.0,
        _ => {}
    }
    if result.errors.is_empty() {
        score += 1.0;
    }
    Some(score.min(10.0))
}

/// Extract the Verifier's own score from its Markdown report.
/// Accepts `**Overall Score**: 8.5/10`, `**Total**: 8/10`, `Score: 8/10`
/// (case-insensitive).
pub fn extract_report_score(report: &str) -> Option<f64> {
    let patterns = [
        r"(?i)\*\*Overall Score\*\*:\s*(\d+(?:\.\d+)?)/10",
        r"(?i)Overall Score:\s*(\d+(?:\.\d+)?)/10",
        r"(?i)\*\*Total\*\*:\s*(\d+(?:\.\d+)?)/10",
        r"(?i)Score:\s*(\d+(?:\.\d+)?)/10",
    ];
    for pattern in patterns {
        let re = Regex::new(pattern).expect("static regex");
        if let Some(caps) = re.captures(report) {
            if let Ok(score) = caps[1].parse::<f64>() {
                return Some(score.clamp(0.0, 10.0));
            }
        }
    }
    None
}

/// Resolution rule: report score > metric score > 5.0.
pub fn resolve_score(report: &str, metric: Option<f64>) -> f64 {
    extract_report_score(report).or(metric).unwrap_or(5.0)
}
