//! Verifier: sandbox results plus generated code in, REPORT_iter{N}.md out.
//!
//! The sandbox output section is never placed inside compression markers:
//! the model must see exact build/test/lint output to score accurately.

use std::collections::BTreeMap;

use crate::providers::ChatMessage;
use crate::sandbox::SandboxResult;

pub const SYSTEM_PROMPT: &str = "You are a Senior QA Engineer. Analyze verification \
results for generated code and produce a quality report in Markdown with: a score \
breakdown, a detailed analysis of each verification step, specific issues with file \
locations, and actionable recommendations for the engineer. You MUST include a line of \
the exact form 'Overall Score: X/10' (decimals allowed). Be objective, specific, and \
constructive.";

pub fn build_messages(
    plan: &str,
    iteration: u32,
    result: &SandboxResult,
    code: &BTreeMap<String, String>,
) -> Vec<ChatMessage> {
    let mut user = format!(
        "<compress>\n# Architectural Plan\n\n{plan}\n\n\
         # Iteration {iteration} — Generated Code\n\n"
    );
    if code.is_empty() {
        user.push_str("No files found in staging directory.\n");
    }
    for (path, content) in code {
        if content.starts_with('[') {
            user.push_str(&format!("- {path} {content}\n"));
        } else {
            user.push_str(&format!("### {path}\n```\n{content}\n```\n\n"));
        }
    }
    user.push_str("</compress>\n");

    if result.code_review_only {
        user.push_str(
            "\n# Verification Results\n\n\
             No automated build/test/lint commands could run for this project. Static \
             review is the only available signal; scoring must be based on code review \
             alone.\n\
             \n# Your Task\n\n\
             Perform a code review of the generated code and produce a quality report \
             following the format in your system prompt. Base your score ENTIRELY on:\n\
             1. Does the code match the architectural plan?\n\
             2. Are all planned files present and complete?\n\
             3. Are imports correct and consistent?\n\
             4. Is the code well-structured and idiomatic?\n\
             5. Are there obvious bugs, missing error handling, or security issues?\n\n\
             You MUST include an 'Overall Score: X/10' line in your report.\n",
        );
    } else {
        let (passed, total) = result.test_counts;
        user.push_str(&format!(
            "\n# Verification Results\n\n\
             ## Install\n\n**Status**: {}\n\n```\n{}\n```\n\n\
             ## Build\n\n**Status**: {}\n\n```\n{}\n```\n\n\
             ## Test Results\n\n**Tests Passed**: {passed}/{total}\n\n```\n{}\n```\n\n\
             ## Linting Results\n\n**Issues Found**: {}\n\n```\n{}\n```\n\n\
             ## Errors\n\n",
            result.install.status.as_str().to_uppercase(),
            result.install.combined_output(),
            result.build.status.as_str().to_uppercase(),
            result.build.combined_output(),
            result.test.combined_output(),
            result.lint_issues,
            result.lint.combined_output(),
        ));
        if result.errors.is_empty() {
            user.push_str("None\n");
        } else {
            for error in &result.errors {
                user.push_str(&format!("- {error}\n"));
            }
        }
        user.push_str(
            "\n# Your Task\n\n\
             Analyze these verification results and generate a comprehensive quality \
             report following the format in your system prompt. Include:\n\
             1. Overall quality score (0-10)\n\
             2. Detailed analysis of each verification step\n\
             3. Specific issues found with locations\n\
             4. Actionable recommendations for the Engineer\n",
        );
    }

    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}
