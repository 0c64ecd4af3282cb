//! Architect: requirements in, PLAN.md out.

use crate::providers::ChatMessage;

pub const SYSTEM_PROMPT: &str = "You are a Senior Software Architect. Analyze the \
requirements and produce a complete technical plan in Markdown with: technology stack \
selection, a directory structure listing every file to create, implementation guidance \
per component, and a verification strategy. Express the verification strategy as fenced \
command blocks titled 'Install Commands:', 'Build Commands:', 'Test Commands:', and \
'Run Commands:'. If the project needs more sandbox resources than usual, add a \
'## Resource Requirements' section with key: value lines (timeout_install, \
timeout_build, timeout_test, timeout_lint, memory_limit, cpu_limit). Another AI will \
implement your plan, so be specific and unambiguous.";

/// First-iteration planning: requirements only.
pub fn build_messages(requirements: &str, project_name: &str) -> Vec<ChatMessage> {
    let user = format!(
        "<compress>\n# Project Requirements\n\n{requirements}\n\n# Project Details\n\
         - **Project Name**: {project_name}\n</compress>\n\n\
         # Your Task\n\n\
         Analyze these requirements and produce a comprehensive technical plan following \
         the format in your system prompt. Focus on:\n\
         1. Selecting the most appropriate technology stack\n\
         2. Designing a clear, logical directory structure\n\
         3. Defining a complete verification strategy\n\
         4. Providing actionable implementation guidance\n"
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Plan revision: requirements plus the previous plan and the feedback that
/// motivated the revision.
pub fn build_revision_messages(
    requirements: &str,
    project_name: &str,
    previous_plan: &str,
    feedback: &str,
) -> Vec<ChatMessage> {
    let user = format!(
        "<compress>\n# Project Requirements\n\n{requirements}\n\n\
         # Project Details\n- **Project Name**: {project_name}\n\n\
         # Previous Plan\n\n{previous_plan}\n</compress>\n\n\
         # Verifier Feedback\n\n{feedback}\n\n\
         # Your Task\n\n\
         Revise the plan to address the feedback. Keep what worked; change only what the \
         feedback shows to be wrong or missing. Output the complete revised plan.\n"
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}
