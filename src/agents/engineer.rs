//! Engineer: plan (plus feedback) in, staged code tree out.
//!
//! The model answers with a JSON array of `{path, content}` objects.
//! Parsing is staged from strict to forgiving, and every path is
//! normalized and containment-checked before anything touches disk.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::TumblerError;
use crate::providers::ChatMessage;
use crate::state::MANIFEST_FILE;

pub const SYSTEM_PROMPT: &str = "You are a Senior Software Engineer. Generate complete, \
production-quality code implementing the architectural plan. Output ONLY a JSON array \
of file objects: [{\"path\": \"relative/path\", \"content\": \"full file content\"}, ...]. \
Every file from the plan must be present and complete — no placeholders, no elisions. \
Include tests and configuration files. Do not wrap the JSON in prose.";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// First-iteration generation: the whole tree from the plan.
pub fn build_messages(plan: &str) -> Vec<ChatMessage> {
    let user = format!(
        "<compress>\n# Architectural Plan\n\n{plan}\n</compress>\n\n\
         # Your Task\n\n\
         This is **iteration 1** — implement the project from scratch according to the \
         plan. Generate ALL files specified in the plan as a JSON array. Ensure:\n\
         1. All files from the plan are included\n\
         2. All imports are correct\n\
         3. All tests are comprehensive\n\
         4. All configuration files are complete\n\n\
         Output pure JSON (no markdown fences):\n\
         [{{\"path\": \"...\", \"content\": \"...\"}}, ...]\n"
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Refinement iteration: previous code and the verification report drive
/// the rewrite. Sandbox-derived feedback stays outside the compression
/// markers.
pub fn build_refinement_messages(
    plan: &str,
    iteration: u32,
    feedback: &str,
    previous_code: &BTreeMap<String, String>,
) -> Vec<ChatMessage> {
    let mut user = format!(
        "<compress>\n# Architectural Plan\n\n{plan}\n\n\
         # Iteration {iteration} — Refinement\n\n## Previous Implementation\n\n"
    );
    for (path, content) in previous_code {
        if content.starts_with('[') {
            user.push_str(&format!("- {path} {content}\n"));
        } else {
            user.push_str(&format!("### {path}\n```\n{content}\n```\n\n"));
        }
    }
    user.push_str("</compress>\n");
    user.push_str(&format!("\n## Verifier Feedback\n\n{feedback}\n"));
    user.push_str(
        "\n# Your Task\n\n\
         Fix the issues identified in the feedback while preserving working parts of the \
         code. Focus on:\n\
         1. Fixing failing tests\n\
         2. Resolving build errors\n\
         3. Addressing linting issues\n\n\
         Generate the COMPLETE file tree again as a JSON array (including files that did \
         not change):\n\
         [{\"path\": \"...\", \"content\": \"...\"}, ...]\n",
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Split the plan's file list into generation chunks for providers that
/// serve concurrent requests. Roughly five chunks, never fewer than two
/// files per chunk.
pub fn plan_chunks(files: &[String]) -> Vec<Vec<String>> {
    let chunk_size = (files.len() / 5).max(2);
    files.chunks(chunk_size).map(|chunk| chunk.to_vec()).collect()
}

/// One chunk of a parallel generation pass: same context as a full pass,
/// but the task names exactly the files this request owns.
pub fn build_chunk_messages(
    plan: &str,
    iteration: u32,
    feedback: &str,
    previous_code: &BTreeMap<String, String>,
    target_files: &[String],
    chunk_num: usize,
    total_chunks: usize,
) -> Vec<ChatMessage> {
    let mut user = format!("<compress>\n# Architectural Plan\n\n{plan}\n");
    let relevant: Vec<(&String, &String)> = previous_code
        .iter()
        .filter(|(path, _)| target_files.contains(path))
        .collect();
    if !relevant.is_empty() {
        user.push_str(&format!("\n# Iteration {iteration} — Current Implementation\n\n"));
        for (path, content) in relevant {
            if content.starts_with('[') {
                user.push_str(&format!("- {path} {content}\n"));
            } else {
                user.push_str(&format!("### {path}\n```\n{content}\n```\n\n"));
            }
        }
    }
    user.push_str("</compress>\n");
    if !feedback.is_empty() {
        user.push_str(&format!("\n## Verifier Feedback\n\n{feedback}\n"));
    }
    let file_list: String =
        target_files.iter().map(|f| format!("- `{f}`\n")).collect();
    user.push_str(&format!(
        "\n# Chunked Generation (Part {chunk_num} of {total_chunks})\n\n\
         Generate ONLY the following files in this request:\n{file_list}\n\
         Do NOT generate files outside this list; the other parts are generated in \
         separate requests.\n\n\
         Output as a JSON array (only the files listed above):\n\
         [{{\"path\": \"...\", \"content\": \"...\"}}, ...]\n"
    ));
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Parse the model's response into files. Strategies, strict to forgiving:
/// fenced ```json block, then the raw text, then a per-file regex salvage
/// for structurally broken JSON.
pub fn parse_files(response: &str) -> Result<Vec<GeneratedFile>, TumblerError> {
    let trimmed = response.trim();

    let fenced_re = Regex::new(r"(?s)```(?:json)?\s*\n(.*?)```").expect("static regex");
    let candidate = fenced_re
        .captures(trimmed)
        .map(|caps| caps[1].trim().to_string())
        .unwrap_or_else(|| trimmed.to_string());

    if let Ok(files) = serde_json::from_str::<Vec<GeneratedFile>>(&candidate) {
        return Ok(files);
    }
    if let Ok(files) = serde_json::from_str::<Vec<GeneratedFile>>(trimmed) {
        return Ok(files);
    }

    let salvaged = salvage_with_regex(trimmed);
    if salvaged.is_empty() {
        // Unparseable output is retryable: the next attempt in the same
        // iteration may well produce valid JSON.
        return Err(TumblerError::agent_error(
            "engineer",
            format!(
                "response is not a JSON file array ({} chars, starts: {:?})",
                trimmed.len(),
                crate::utils::truncate_str(trimmed, 80)
            ),
            true,
        ));
    }
    warn!(files = salvaged.len(), "Engineer JSON was malformed; salvaged files via regex");
    Ok(salvaged)
}

/// Lenient extraction of `"path": "...", "content": "..."` pairs.
fn salvage_with_regex(response: &str) -> Vec<GeneratedFile> {
    let re = Regex::new(r#""path"\s*:\s*"([^"]+)"\s*,\s*"content"\s*:\s*"((?:[^"\\]|\\.)*)""#)
        .expect("static regex");
    re.captures_iter(response)
        .map(|caps| GeneratedFile {
            path: caps[1].to_string(),
            content: unescape_json_string(&caps[2]),
        })
        .collect()
}

fn unescape_json_string(s: &str) -> String {
    // Feeding the captured span back through the JSON parser handles every
    // escape form without a hand-rolled state machine.
    serde_json::from_str::<String>(&format!("\"{s}\"")).unwrap_or_else(|_| {
        s.replace("\\n", "\n").replace("\\t", "\t").replace("\\\"", "\"").replace("\\\\", "\\")
    })
}

/// Normalize generated paths for staging:
/// - backslashes become forward slashes;
/// - absolute paths and `..` segments drop the file with a warning;
/// - when every file sits under one shared wrapper directory (models often
///   emit `myproject/...`), the wrapper is stripped so marker files like
///   `requirements.txt` land where the sandbox looks for them.
pub fn normalize_paths(files: Vec<GeneratedFile>) -> Vec<GeneratedFile> {
    let mut cleaned: Vec<GeneratedFile> = Vec::with_capacity(files.len());
    for mut file in files {
        file.path = file.path.replace('\\', "/");
        let path = Path::new(&file.path);
        let is_clean = !file.path.is_empty()
            && path.is_relative()
            && path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !is_clean {
            warn!(path = %file.path, "Dropping generated file with unsafe path");
            continue;
        }
        file.path = file.path.trim_start_matches("./").to_string();
        cleaned.push(file);
    }

    // A wrapper directory is only strippable when nothing already sits at
    // the staging root: a top-level workspace marker (or any top-level
    // file) means the paths are final. common_root is None in that case.
    let Some(prefix) = common_root(&cleaned) else {
        return cleaned;
    };
    info!(prefix = %prefix, "Stripping common root directory from generated paths");
    cleaned
        .into_iter()
        .map(|mut f| {
            f.path = f.path[prefix.len() + 1..].to_string();
            f
        })
        .collect()
}

/// The single shared top-level directory, if every path has the same one.
fn common_root(files: &[GeneratedFile]) -> Option<String> {
    let mut root: Option<&str> = None;
    for file in files {
        let (first, _) = file.path.split_once('/')?;
        match root {
            None => root = Some(first),
            Some(existing) if existing == first => {}
            Some(_) => return None,
        }
    }
    root.map(str::to_string)
}

/// Write files to staging and drop the `.manifest.json` completion marker.
/// Returns the number of files written.
pub fn write_staging(files: &[GeneratedFile], staging: &Path) -> Result<usize, TumblerError> {
    std::fs::create_dir_all(staging)?;
    let mut written = 0usize;
    for file in files {
        let dest = staging.join(&file.path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, &file.content)?;
        written += 1;
    }

    let manifest = serde_json::json!({
        "files": files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
        "completed_at": chrono::Utc::now().to_rfc3339(),
    });
    std::fs::write(
        staging.join(MANIFEST_FILE),
        serde_json::to_vec_pretty(&manifest)
            .map_err(|e| TumblerError::Internal(format!("manifest serialize: {e}")))?,
    )?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> GeneratedFile {
        GeneratedFile { path: path.to_string(), content: "x".to_string() }
    }

    #[test]
    fn test_parse_clean_json() {
        let files =
            parse_files(r#"[{"path": "main.py", "content": "print('hi')"}]"#).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "main.py");
        assert_eq!(files[0].content, "print('hi')");
    }

    #[test]
    fn test_parse_fenced_json() {
        let response = "Here are the files:\n```json\n[{\"path\": \"a.py\", \"content\": \"1\"}]\n```\n";
        let files = parse_files(response).unwrap();
        assert_eq!(files[0].path, "a.py");
    }

    #[test]
    fn test_parse_salvages_broken_json() {
        // Trailing comma breaks strict parsing; the salvage pass still
        // recovers both files.
        let response = r#"[{"path": "a.py", "content": "line1\nline2"}, {"path": "b.py", "content": "x = \"quoted\""},]"#;
        let files = parse_files(response).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].content, "line1\nline2");
        assert_eq!(files[1].content, "x = \"quoted\"");
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(parse_files("I could not generate the code, sorry.").is_err());
    }

    #[test]
    fn test_parse_empty_array_ok() {
        assert_eq!(parse_files("[]").unwrap().len(), 0);
    }

    #[test]
    fn test_normalize_drops_escapes() {
        let files = vec![
            file("../../etc/passwd"),
            file("/etc/shadow"),
            file("src/../..//x"),
            file("src/ok.py"),
        ];
        let normalized = normalize_paths(files);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].path, "src/ok.py");
    }

    #[test]
    fn test_normalize_strips_common_wrapper() {
        let files = vec![
            file("myproject/requirements.txt"),
            file("myproject/src/main.py"),
            file("myproject/tests/test_main.py"),
        ];
        let normalized = normalize_paths(files);
        let paths: Vec<&str> = normalized.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["requirements.txt", "src/main.py", "tests/test_main.py"]);
    }

    #[test]
    fn test_normalize_keeps_root_when_marker_outside() {
        let files = vec![file("requirements.txt"), file("src/main.py")];
        let normalized = normalize_paths(files);
        let paths: Vec<&str> = normalized.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["requirements.txt", "src/main.py"]);
    }

    #[test]
    fn test_normalize_mixed_roots_untouched() {
        let files = vec![file("a/x.py"), file("b/y.py")];
        let normalized = normalize_paths(files);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].path, "a/x.py");
    }

    #[test]
    fn test_write_staging_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            GeneratedFile { path: "src/main.py".into(), content: "print('hi')".into() },
            GeneratedFile { path: "requirements.txt".into(), content: "pytest\n".into() },
        ];
        let written = write_staging(&files, dir.path()).unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/main.py")).unwrap(),
            "print('hi')"
        );

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap())
                .unwrap();
        assert_eq!(manifest["files"].as_array().unwrap().len(), 2);
        assert!(manifest["completed_at"].is_string());
    }

    #[test]
    fn test_plan_chunks_sizing() {
        let files: Vec<String> = (0..12).map(|i| format!("src/f{i}.py")).collect();
        let chunks = plan_chunks(&files);
        // 12 files → chunk size 2 → 6 chunks, nothing lost.
        assert_eq!(chunks.len(), 6);
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), 12);

        let few: Vec<String> = (0..3).map(|i| format!("f{i}.py")).collect();
        let chunks = plan_chunks(&few);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_chunk_messages_name_only_target_files() {
        let previous = BTreeMap::new();
        let targets = vec!["src/a.py".to_string(), "src/b.py".to_string()];
        let messages = build_chunk_messages("plan", 1, "", &previous, &targets, 2, 5);
        let content = &messages[1].content;
        assert!(content.contains("Part 2 of 5"));
        assert!(content.contains("- `src/a.py`"));
        assert!(content.contains("- `src/b.py`"));
        assert!(content.contains("ONLY the following files"));
    }

    #[test]
    fn test_chunk_messages_filter_previous_code() {
        let mut previous = BTreeMap::new();
        previous.insert("src/a.py".to_string(), "a code".to_string());
        previous.insert("src/other.py".to_string(), "other code".to_string());
        let targets = vec!["src/a.py".to_string()];
        let messages = build_chunk_messages("plan", 2, "fix a", &previous, &targets, 1, 2);
        let content = &messages[1].content;
        assert!(content.contains("a code"));
        assert!(!content.contains("other code"));
    }

    #[test]
    fn test_refinement_messages_feedback_outside_markers() {
        let mut previous = BTreeMap::new();
        previous.insert("main.py".to_string(), "old code".to_string());
        let messages =
            build_refinement_messages("the plan", 2, "test_main failed: exit 1", &previous);
        let content = &messages[1].content;
        let close = content.find("</compress>").unwrap();
        assert!(content[..close].contains("old code"));
        assert!(content[close..].contains("test_main failed"));
    }
}
