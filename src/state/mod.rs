//! Per-project persistence.
//!
//! The filesystem is authoritative: every project carries its state under
//! `<project>/.tumbler/` as plain JSON. An optional RDBMS mirror receives
//! best-effort write-throughs (see [`mirror`]); it is never read back.

pub mod mirror;
pub mod safety;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::compression::CompressionConfig;
use crate::errors::TumblerError;
use mirror::StateMirror;

/// Subdirectories a Reset is allowed to clear. Anything else is refused.
const CLEARABLE_PROJECT_SUBDIRS: &[&str] = &["02_plan", "03_staging", "04_feedback"];
const CLEARABLE_STATE_SUBDIRS: &[&str] = &["logs"];

pub const INPUT_DIR: &str = "01_input";
pub const PLAN_DIR: &str = "02_plan";
pub const STAGING_DIR: &str = "03_staging";
pub const FEEDBACK_DIR: &str = "04_feedback";
pub const FINAL_DIR: &str = "05_final";
pub const STATE_DIR: &str = ".tumbler";

pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const PLAN_FILE: &str = "PLAN.md";
pub const MANIFEST_FILE: &str = ".manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    Idle,
    Planning,
    Engineering,
    Verifying,
    Completed,
    Failed,
}

impl ProjectPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectPhase::Idle => "idle",
            ProjectPhase::Planning => "planning",
            ProjectPhase::Engineering => "engineering",
            ProjectPhase::Verifying => "verifying",
            ProjectPhase::Completed => "completed",
            ProjectPhase::Failed => "failed",
        }
    }

    /// Phases a live loop may be in. `is_running` implies one of these.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProjectPhase::Planning | ProjectPhase::Engineering | ProjectPhase::Verifying
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectPhase::Completed | ProjectPhase::Failed)
    }
}

/// The persisted project entity (`.tumbler/state.json`).
///
/// Unknown fields round-trip through `extra` so external writers can attach
/// data without this daemon destroying it on the next save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub name: String,
    pub phase: ProjectPhase,
    pub iteration: u32,
    pub max_iterations: u32,
    pub quality_threshold: f64,
    #[serde(default)]
    pub max_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_score: Option<f64>,
    #[serde(default)]
    pub provider_overrides: HashMap<String, String>,
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Per-project sandbox overrides (timeouts, memory), merged over the
    /// global verification config. Populated by operators or the Architect's
    /// Resource Requirements section.
    #[serde(default)]
    pub verification: HashMap<String, JsonValue>,
    pub start_time: String,
    pub last_update: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_running: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

impl ProjectState {
    pub fn new(name: &str, max_iterations: u32, quality_threshold: f64, max_cost: f64) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            name: name.to_string(),
            phase: ProjectPhase::Idle,
            iteration: 0,
            max_iterations,
            quality_threshold,
            max_cost,
            last_score: None,
            provider_overrides: HashMap::new(),
            compression: CompressionConfig::default(),
            verification: HashMap::new(),
            start_time: now.clone(),
            last_update: now,
            error: None,
            is_running: false,
            extra: serde_json::Map::new(),
        }
    }
}

/// One agent call's worth of token accounting (`usage.json` history entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub timestamp: String,
    pub project: String,
    pub agent: String,
    pub iteration: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub provider: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUsageTotals {
    pub tokens: u64,
    pub cost: f64,
    pub calls: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageLedger {
    pub total_tokens: u64,
    pub total_cost: f64,
    #[serde(default)]
    pub by_agent: HashMap<String, AgentUsageTotals>,
    #[serde(default)]
    pub history: Vec<UsageRecord>,
}

/// Append-only conversation entry (`.tumbler/conversation.json`, one JSON
/// object per line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub timestamp: String,
    /// architect | engineer | verifier | system
    pub agent: String,
    /// input | output | error | status | sandbox
    pub role: String,
    pub iteration: u32,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl ConversationMessage {
    pub fn new(agent: &str, role: &str, iteration: u32, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            agent: agent.to_string(),
            role: role.to_string(),
            iteration,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Summary row for `ListProjects`.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    pub name: String,
    pub phase: ProjectPhase,
    pub iteration: u32,
    pub last_score: Option<f64>,
    pub is_running: bool,
    pub last_update: String,
}

/// JSON state persistence for one workspace of projects.
pub struct StateStore {
    workspace_root: PathBuf,
    mirror: Option<Arc<dyn StateMirror>>,
}

impl StateStore {
    pub fn new(workspace_root: PathBuf, mirror: Option<Arc<dyn StateMirror>>) -> Self {
        Self { workspace_root, mirror }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn project_root(&self, name: &str) -> PathBuf {
        self.workspace_root.join(name)
    }

    fn state_file(project_root: &Path) -> PathBuf {
        project_root.join(STATE_DIR).join("state.json")
    }

    fn usage_file(project_root: &Path) -> PathBuf {
        project_root.join(STATE_DIR).join("usage.json")
    }

    fn conversation_file(project_root: &Path) -> PathBuf {
        project_root.join(STATE_DIR).join("conversation.json")
    }

    /// Create the canonical workspace layout for a new project and seed its
    /// state. Fails with `InvalidRequest` when the project already exists.
    pub fn create_project(
        &self,
        name: &str,
        requirements: &str,
        defaults: &crate::config::TumblerConfig,
    ) -> Result<ProjectState, TumblerError> {
        if !crate::utils::is_valid_project_name(name) {
            return Err(TumblerError::InvalidRequest(format!(
                "project name '{name}' is not URL-safe"
            )));
        }
        let root = self.project_root(name);
        if root.exists() {
            return Err(TumblerError::InvalidRequest(format!(
                "project '{name}' already exists"
            )));
        }
        for dir in [INPUT_DIR, PLAN_DIR, STAGING_DIR, FEEDBACK_DIR, FINAL_DIR, STATE_DIR] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        std::fs::create_dir_all(root.join(STATE_DIR).join("logs"))?;
        std::fs::write(root.join(INPUT_DIR).join(REQUIREMENTS_FILE), requirements)?;

        let state = ProjectState::new(
            name,
            defaults.max_iterations,
            defaults.quality_threshold,
            defaults.max_cost_per_project,
        );
        self.save_state(&root, &state)?;
        info!(project = name, "Project created");
        Ok(state)
    }

    /// Load state from disk. Missing file yields `InvalidRequest` (unknown
    /// project); a corrupt file is an error rather than silently defaulted so
    /// a crashed writer cannot cause state loss.
    pub fn load_state(&self, project_root: &Path) -> Result<ProjectState, TumblerError> {
        let path = Self::state_file(project_root);
        if !path.exists() {
            return Err(TumblerError::InvalidRequest(format!(
                "no state at '{}'",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| {
            TumblerError::InvalidRequest(format!("malformed state '{}': {e}", path.display()))
        })
    }

    /// Atomic write-then-rename. Publishes no events; that is the caller's
    /// job. Mirrors to the RDBMS best-effort.
    pub fn save_state(&self, project_root: &Path, state: &ProjectState) -> Result<(), TumblerError> {
        let mut state = state.clone();
        state.last_update = Utc::now().to_rfc3339();

        let path = Self::state_file(project_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &serde_json::to_vec_pretty(&state).map_err(io_internal)?)?;

        if let Some(mirror) = &self.mirror {
            mirror.upsert_project(&state);
        }
        Ok(())
    }

    pub fn load_usage(&self, project_root: &Path) -> UsageLedger {
        let path = Self::usage_file(project_root);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), "Corrupt usage ledger, starting fresh: {e}");
                UsageLedger::default()
            }),
            Err(_) => UsageLedger::default(),
        }
    }

    /// Fold a usage record into the per-agent totals and history.
    pub fn append_usage(
        &self,
        project_root: &Path,
        record: UsageRecord,
    ) -> Result<UsageLedger, TumblerError> {
        let mut ledger = self.load_usage(project_root);
        let tokens = record.input_tokens + record.output_tokens;
        ledger.total_tokens += tokens;
        ledger.total_cost += record.cost;
        let agent = ledger.by_agent.entry(record.agent.clone()).or_default();
        agent.tokens += tokens;
        agent.cost += record.cost;
        agent.calls += 1;
        ledger.history.push(record.clone());

        let path = Self::usage_file(project_root);
        write_atomic(&path, &serde_json::to_vec_pretty(&ledger).map_err(io_internal)?)?;

        if let Some(mirror) = &self.mirror {
            mirror.log_usage(&record);
        }
        Ok(ledger)
    }

    pub fn total_cost(&self, project_root: &Path) -> f64 {
        self.load_usage(project_root).total_cost
    }

    /// Append-only conversation log: one JSON object per line.
    pub fn append_conversation(
        &self,
        project_root: &Path,
        msg: &ConversationMessage,
    ) -> Result<(), TumblerError> {
        use std::io::Write;
        let path = Self::conversation_file(project_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let line = serde_json::to_string(msg).map_err(io_internal)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn load_conversation(&self, project_root: &Path) -> Vec<ConversationMessage> {
        let path = Self::conversation_file(project_root);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Reset: clear plan/staging/feedback, usage, conversation, and agent
    /// logs; return phase to idle and iteration to 0. Requirements, final
    /// archives, and provider overrides are preserved. Idempotent.
    pub fn reset_project(&self, project_root: &Path) -> Result<ProjectState, TumblerError> {
        let previous = self.load_state(project_root)?;

        for dir in CLEARABLE_PROJECT_SUBDIRS {
            let target = project_root.join(dir);
            if target.exists() {
                let (deleted, skipped) =
                    safety::safe_clear_dir(project_root, &target, CLEARABLE_PROJECT_SUBDIRS)?;
                info!(dir, deleted, skipped, "Reset cleared directory");
                std::fs::create_dir_all(&target)?;
            }
        }
        let logs_dir = project_root.join(STATE_DIR).join("logs");
        if logs_dir.exists() {
            let (deleted, skipped) =
                safety::safe_clear_dir(project_root, &logs_dir, CLEARABLE_STATE_SUBDIRS)?;
            info!(deleted, skipped, "Reset cleared agent logs");
        }
        std::fs::create_dir_all(&logs_dir)?;

        for file in [Self::usage_file(project_root), Self::conversation_file(project_root)] {
            if file.exists() {
                safety::assert_within(project_root, &file)?;
                if let Err(e) = std::fs::remove_file(&file) {
                    warn!(path = %file.display(), "Could not clear file during reset: {e}");
                }
            }
        }

        let mut state = ProjectState::new(
            &previous.name,
            previous.max_iterations,
            previous.quality_threshold,
            previous.max_cost,
        );
        state.provider_overrides = previous.provider_overrides;
        state.compression = previous.compression;
        self.save_state(project_root, &state)?;
        Ok(state)
    }

    /// Delete the entire project tree, honoring the path-safety rules.
    pub fn delete_project(&self, project_root: &Path) -> Result<(), TumblerError> {
        let (deleted, skipped) = safety::safe_delete_tree(project_root)?;
        info!(project = %project_root.display(), deleted, skipped, "Project deleted");
        Ok(())
    }

    /// Discover projects under the workspace root. A directory is a project
    /// when it has a `.tumbler` state dir or an `01_input` dir.
    pub fn list_projects(&self) -> Vec<ProjectSummary> {
        let Ok(entries) = std::fs::read_dir(&self.workspace_root) else {
            return Vec::new();
        };
        let mut summaries = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if !path.join(STATE_DIR).exists() && !path.join(INPUT_DIR).exists() {
                continue;
            }
            match self.load_state(&path) {
                Ok(state) => summaries.push(ProjectSummary {
                    name: state.name,
                    phase: state.phase,
                    iteration: state.iteration,
                    last_score: state.last_score,
                    is_running: state.is_running,
                    last_update: state.last_update,
                }),
                Err(e) => warn!(path = %path.display(), "Skipping unreadable project: {e}"),
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TumblerError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn io_internal(e: serde_json::Error) -> TumblerError {
    TumblerError::Internal(format!("serialize: {e}"))
}
