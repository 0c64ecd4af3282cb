//! The per-project feedback loop.
//!
//! One cooperative task per project drives the whole lifecycle:
//!
//! ```text
//! planning → (engineering → verifying → decide)* → completed | failed
//! ```
//!
//! The loop owns all mutations of its project's state while it runs;
//! control reaches it only through the cancellation token handed out by the
//! orchestrator. Cancellation is observed at phase boundaries and inside
//! agent streaming.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agents::runner::{AgentCall, AgentOutcome, AgentRunner};
use crate::agents::{architect, collect_code_listing, engineer, verifier, AgentKind};
use crate::config::AppConfig;
use crate::errors::TumblerError;
use crate::events::{
    EventBus, EventType, LogData, PhaseChangeData, ProjectCompleteData, ProjectFailedData,
    SandboxPhaseData, ScoreUpdateData,
};
use crate::providers::{ChatMessage, ProviderHandle, ProviderRegistry};
use crate::sandbox::{PhaseResult, SandboxExecutor, SandboxResult, SandboxSettings};
use crate::scoring;
use crate::state::{
    ConversationMessage, ProjectPhase, ProjectState, StateStore, FEEDBACK_DIR, INPUT_DIR,
    PLAN_DIR, PLAN_FILE, REQUIREMENTS_FILE, STAGING_DIR,
};

/// Where a trigger asks the loop to enter the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPoint {
    /// Normal start: plan first (or resume past it).
    Planning,
    /// An operator-edited PLAN.md exists; skip the Architect.
    Engineering,
    /// Staging was populated externally; verify it as-is first.
    Verifying,
}

/// Scores within this band across [`PLATEAU_WINDOW`] iterations count as
/// "no meaningful improvement".
const PLATEAU_WINDOW: usize = 3;
const PLATEAU_EPSILON: f64 = 0.5;

/// Outcome of the convergence decision after each verification.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Complete,
    NextIteration,
    Fail(String),
}

/// Pure convergence rule, checked in order: threshold, iteration cap,
/// cost cap, plateau, continue.
pub fn decide(
    score: f64,
    threshold: f64,
    iteration: u32,
    max_iterations: u32,
    total_cost: f64,
    max_cost: f64,
    history: &[f64],
) -> Decision {
    if score >= threshold {
        return Decision::Complete;
    }
    if iteration >= max_iterations {
        return Decision::Fail(
            TumblerError::IterationCap { iterations: iteration }.failure_reason(),
        );
    }
    if max_cost > 0.0 && total_cost >= max_cost {
        return Decision::Fail(
            TumblerError::BudgetExceeded { spent: total_cost, cap: max_cost }.failure_reason(),
        );
    }
    if history.len() >= PLATEAU_WINDOW {
        let recent = &history[history.len() - PLATEAU_WINDOW..];
        let min = recent.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = recent.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max - min < PLATEAU_EPSILON {
            return Decision::Fail(format!(
                "score_plateau: {recent:?} over the last {PLATEAU_WINDOW} iterations"
            ));
        }
    }
    Decision::NextIteration
}

pub struct ProjectCycle {
    pub project: String,
    pub root: PathBuf,
    pub entry: StartPoint,
    pub config: Arc<AppConfig>,
    pub store: Arc<StateStore>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<ProviderRegistry>,
    pub sandbox: Arc<SandboxExecutor>,
    pub runner: Arc<AgentRunner>,
    pub cancel: CancellationToken,
}

impl ProjectCycle {
    /// Run the loop to a terminal state (or idle on cancellation). Never
    /// panics outward; every failure path persists state and publishes the
    /// terminal event.
    pub async fn run(self) {
        let timeout = Duration::from_secs(self.config.tumbler.project_timeout_secs);
        let result = tokio::time::timeout(timeout, self.run_inner()).await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(_)) if self.cancel.is_cancelled() => {
                info!(project = %self.project, "Loop cancelled, returning to idle");
                self.transition_to_idle().await;
            }
            Ok(Err(e)) => self.mark_failed(&e.failure_reason()).await,
            Err(_) => {
                warn!(project = %self.project, "Project wall-clock timeout");
                self.mark_failed(&format!(
                    "timeout: exceeded {}s wall clock",
                    self.config.tumbler.project_timeout_secs
                ))
                .await;
            }
        }

        // is_running is transient; whatever happened above, it ends false.
        if let Ok(mut state) = self.store.load_state(&self.root) {
            if state.is_running {
                state.is_running = false;
                let _ = self.store.save_state(&self.root, &state);
            }
        }
    }

    async fn run_inner(&self) -> Result<(), TumblerError> {
        let mut state = self.store.load_state(&self.root)?;

        let plan_path = self.root.join(PLAN_DIR).join(PLAN_FILE);
        let has_plan =
            plan_path.exists() && plan_path.metadata().map(|m| m.len() > 0).unwrap_or(false);
        let resuming = has_plan && state.iteration > 0 && self.entry == StartPoint::Planning;
        let skip_architect = resuming || self.entry != StartPoint::Planning;

        if resuming {
            self.log_conversation(
                "system",
                "input",
                state.iteration,
                format!("Resuming project from iteration {}.", state.iteration),
                Some(json!({"label": "Resume"})),
            );
        } else if self.entry == StartPoint::Planning {
            // Fresh start: clear any previous terminal condition.
            state.iteration = 0;
            state.last_score = None;
            state.error = None;
        }
        state.error = None;
        self.store.save_state(&self.root, &state)?;

        let requirements_path = self.root.join(INPUT_DIR).join(REQUIREMENTS_FILE);
        let requirements = std::fs::read_to_string(&requirements_path).map_err(|_| {
            TumblerError::InvalidRequest(format!(
                "requirements file not found: {}",
                requirements_path.display()
            ))
        })?;

        if !skip_architect {
            self.run_architect(&requirements).await?;
        } else if !has_plan {
            return Err(TumblerError::InvalidRequest(
                "cannot skip planning without a PLAN.md".to_string(),
            ));
        }

        let mut score_history: Vec<f64> = Vec::new();
        // A manifest trigger verifies the existing staging before any new
        // engineering pass.
        let mut skip_engineering = self.entry == StartPoint::Verifying;

        loop {
            self.checkpoint()?;

            let mut state = self.store.load_state(&self.root)?;
            if self.budget_exhausted(&state) {
                let total = self.store.total_cost(&self.root);
                return Err(TumblerError::BudgetExceeded { spent: total, cap: state.max_cost });
            }

            let iteration = if skip_engineering {
                skip_engineering = false;
                if state.iteration == 0 {
                    state.iteration = 1;
                    self.store.save_state(&self.root, &state)?;
                }
                state.iteration
            } else {
                self.run_engineer(&mut state).await?
            };

            self.checkpoint()?;
            let score = self.run_verification(iteration).await?;
            score_history.push(score);

            let state = self.store.load_state(&self.root)?;
            let total_cost = self.store.total_cost(&self.root);
            match decide(
                score,
                state.quality_threshold,
                iteration,
                state.max_iterations,
                total_cost,
                state.max_cost,
                &score_history,
            ) {
                Decision::Complete => {
                    self.finalize(score, iteration).await?;
                    return Ok(());
                }
                Decision::Fail(reason) => {
                    // The reason already carries its machine prefix
                    // (iteration_cap / cost_cap / score_plateau).
                    self.mark_failed(&reason).await;
                    return Ok(());
                }
                Decision::NextIteration => {
                    self.log_conversation(
                        "system",
                        "status",
                        iteration,
                        format!(
                            "Score {score}/10 is below threshold ({}). Starting iteration {}...",
                            state.quality_threshold,
                            iteration + 1
                        ),
                        Some(json!({"label": "Continuing"})),
                    );
                    self.publish_log(
                        format!("Score {score}/10 below threshold, starting iteration {}", iteration + 1),
                        "warning",
                    )
                    .await;
                }
            }
        }
    }

    // --- phases ---------------------------------------------------------

    async fn run_architect(&self, requirements: &str) -> Result<(), TumblerError> {
        self.set_phase(ProjectPhase::Planning, None).await?;
        self.publish_log("Architect agent started - creating plan".to_string(), "info").await;
        self.log_conversation(
            "system",
            "input",
            0,
            requirements.to_string(),
            Some(json!({"label": "Project Requirements"})),
        );

        let state = self.store.load_state(&self.root)?;
        let handle = self.provider_for("architect", &state)?;

        // A revision pass sees the previous plan and the report that
        // motivated it; a first pass sees requirements alone.
        let plan_path = self.root.join(PLAN_DIR).join(PLAN_FILE);
        let previous_plan = std::fs::read_to_string(&plan_path).ok().filter(|p| !p.is_empty());
        let previous_feedback = (state.iteration > 0)
            .then(|| self.read_feedback(state.iteration))
            .flatten();
        let messages = match (previous_plan, previous_feedback) {
            (Some(plan), Some(feedback)) => {
                architect::build_revision_messages(requirements, &self.project, &plan, &feedback)
            }
            _ => architect::build_messages(requirements, &self.project),
        };

        let outcome = self
            .call_agent(AgentKind::Architect, &handle, messages, 0, "Architectural Plan")
            .await?;

        std::fs::create_dir_all(plan_path.parent().expect("plan dir"))?;
        std::fs::write(&plan_path, &outcome.text)?;
        info!(project = %self.project, chars = outcome.text.len(), "Plan written");

        // Architect resource recommendations never overwrite operator-set
        // overrides.
        let recommended = crate::plan::extract_resource_requirements(&outcome.text);
        if !recommended.is_empty() {
            let mut state = self.store.load_state(&self.root)?;
            for (key, value) in recommended {
                state.verification.entry(key).or_insert(value);
            }
            self.store.save_state(&self.root, &state)?;
        }

        self.publish_log("Architect agent completed - plan created".to_string(), "info").await;
        Ok(())
    }

    async fn run_engineer(&self, state: &mut ProjectState) -> Result<u32, TumblerError> {
        state.iteration += 1;
        let iteration = state.iteration;
        self.store.save_state(&self.root, state)?;
        self.set_phase(ProjectPhase::Engineering, Some(iteration)).await?;
        self.bus
            .publish(
                EventType::IterationUpdate,
                json!({"project": self.project, "iteration": iteration}),
            )
            .await;
        self.publish_log(format!("Engineer agent started - iteration {iteration}"), "info").await;

        let plan = self.read_plan()?;

        let feedback = if iteration > 1 {
            let feedback = self.read_feedback(iteration - 1).unwrap_or_default();
            if feedback.is_empty() {
                warn!(
                    project = %self.project,
                    iteration,
                    "Feedback report missing or empty, using fallback guidance"
                );
                fallback_feedback(iteration - 1)
            } else {
                self.log_conversation(
                    "system",
                    "input",
                    iteration,
                    feedback.clone(),
                    Some(json!({"label": format!("Feedback from iteration {}", iteration - 1)})),
                );
                feedback
            }
        } else {
            String::new()
        };

        self.log_conversation(
            "engineer",
            "status",
            iteration,
            format!("Starting code generation for iteration {iteration}..."),
            Some(json!({"label": "Engineer Started"})),
        );

        let staging = self.root.join(STAGING_DIR);
        let previous_code =
            if iteration > 1 { collect_code_listing(&staging) } else { Default::default() };

        let handle = self.provider_for("engineer", state)?;

        // Providers that advertise concurrent serving get a fan-out pass
        // over the plan's file list; anything it fails to produce falls
        // back to a single full-tree request.
        let planned = crate::plan::extract_planned_files(&plan);
        let mut files = Vec::new();
        if handle.settings.supports_async && planned.len() >= 4 {
            files = self
                .generate_parallel(&handle, &plan, iteration, &feedback, &previous_code, &planned)
                .await?;
            if files.is_empty() {
                warn!(project = %self.project, "Parallel generation produced no files, falling back");
            }
        }

        if files.is_empty() {
            let messages = if iteration == 1 {
                engineer::build_messages(&plan)
            } else {
                engineer::build_refinement_messages(&plan, iteration, &feedback, &previous_code)
            };

            // Generation and parsing retry together: unparseable output is
            // as retryable as a dropped connection.
            let mut attempt = 0;
            files = loop {
                let result = async {
                    let outcome = self
                        .call_agent(
                            AgentKind::Engineer,
                            &handle,
                            messages.clone(),
                            iteration,
                            "Code Generation",
                        )
                        .await?;
                    let files = engineer::parse_files(&outcome.text)?;
                    Ok::<_, TumblerError>(engineer::normalize_paths(files))
                }
                .await;
                match result {
                    Ok(files) => break files,
                    Err(e) if self.may_retry(&e, attempt) => {
                        attempt += 1;
                        warn!(project = %self.project, attempt, "Engineer failed, retrying: {e}");
                    }
                    Err(e) => return Err(e),
                }
            };
        }

        let written = engineer::write_staging(&files, &staging)?;
        info!(project = %self.project, iteration, files = written, "Code generated");
        self.publish_log(format!("Engineer agent completed - {written} files staged"), "info")
            .await;
        Ok(iteration)
    }

    /// Fan the plan's file list out across concurrent chunk requests. A
    /// chunk that fails or parses empty just contributes nothing; partial
    /// results beat total failure, and the caller falls back to a full
    /// single-request pass when everything came back empty.
    async fn generate_parallel(
        &self,
        handle: &ProviderHandle,
        plan: &str,
        iteration: u32,
        feedback: &str,
        previous_code: &std::collections::BTreeMap<String, String>,
        planned: &[String],
    ) -> Result<Vec<engineer::GeneratedFile>, TumblerError> {
        let chunks = engineer::plan_chunks(planned);
        let total = chunks.len();
        info!(
            project = %self.project,
            files = planned.len(),
            chunks = total,
            "Parallel generation fan-out"
        );

        let calls = chunks.iter().enumerate().map(|(idx, chunk)| {
            let messages = engineer::build_chunk_messages(
                plan,
                iteration,
                feedback,
                previous_code,
                chunk,
                idx + 1,
                total,
            );
            let label = format!("Code Generation (part {}/{total})", idx + 1);
            async move {
                match self
                    .call_agent(AgentKind::Engineer, handle, messages, iteration, &label)
                    .await
                {
                    Ok(outcome) => match engineer::parse_files(&outcome.text) {
                        Ok(files) => files,
                        Err(e) => {
                            warn!(project = %self.project, chunk = idx + 1, "Chunk parse failed: {e}");
                            Vec::new()
                        }
                    },
                    Err(e) => {
                        warn!(project = %self.project, chunk = idx + 1, "Chunk generation failed: {e}");
                        Vec::new()
                    }
                }
            }
        });
        let results = futures::future::join_all(calls).await;
        self.checkpoint()?;

        // Last write wins on duplicate paths across chunks.
        let mut merged: std::collections::BTreeMap<String, engineer::GeneratedFile> =
            Default::default();
        for file in results.into_iter().flatten() {
            merged.insert(file.path.clone(), file);
        }
        Ok(engineer::normalize_paths(merged.into_values().collect()))
    }

    async fn run_verification(&self, iteration: u32) -> Result<f64, TumblerError> {
        self.set_phase(ProjectPhase::Verifying, Some(iteration)).await?;
        self.publish_log("Verifier agent started - validating code".to_string(), "info").await;
        self.log_conversation(
            "verifier",
            "status",
            iteration,
            format!("Verifying code from iteration {iteration}..."),
            Some(json!({"label": "Verifier Started"})),
        );

        let plan = self.read_plan()?;
        let strategy = crate::plan::extract_strategy(&plan);
        let state = self.store.load_state(&self.root)?;
        let settings = SandboxSettings::from_config(&self.config.verification, &state.verification);
        let staging = self.root.join(STAGING_DIR);

        self.bus
            .publish(
                EventType::SandboxStart,
                json!({"project": self.project, "iteration": iteration}),
            )
            .await;

        let sandbox_result = if self.config.verification.sandbox_enabled {
            let (phase_tx, phase_rx) = tokio::sync::mpsc::unbounded_channel();
            let forwarder = self.spawn_phase_forwarder(iteration, phase_rx);
            // Stop must reach an in-flight sandbox run: dropping the run
            // future tears the current container down via its guard.
            let run_result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(TumblerError::Internal("cancelled".to_string()));
                }
                result = self.sandbox.run(&staging, &plan, &strategy, &settings, Some(phase_tx)) => result,
            };
            // The sender is dropped by now; drain the forwarder fully so
            // sandbox_phase events precede the verifier's output.
            let _ = forwarder.await;
            match run_result {
                Ok(result) => result,
                Err(TumblerError::SandboxUnavailable(reason)) => {
                    warn!(project = %self.project, reason = %reason, "Sandbox unavailable, code-review-only mode");
                    self.publish_log(
                        format!("Sandbox unavailable ({reason}) - static review only"),
                        "warning",
                    )
                    .await;
                    SandboxResult::review_only(&format!("sandbox unavailable: {reason}"))
                }
                Err(e) => return Err(e),
            }
        } else {
            SandboxResult::review_only("sandbox disabled in configuration")
        };

        let metric = scoring::metric_score(&sandbox_result);
        let code_listing = collect_code_listing(&staging);
        let handle = self.provider_for("verifier", &state)?;
        let messages = verifier::build_messages(&plan, iteration, &sandbox_result, &code_listing);

        let mut attempt = 0;
        let report = loop {
            match self
                .call_agent(
                    AgentKind::Verifier,
                    &handle,
                    messages.clone(),
                    iteration,
                    "Verification Report",
                )
                .await
            {
                Ok(outcome) => break outcome.text,
                Err(e) if self.may_retry(&e, attempt) => {
                    attempt += 1;
                    warn!(project = %self.project, attempt, "Verifier failed, retrying: {e}");
                }
                Err(e) => return Err(e),
            }
        };

        let report_path =
            self.root.join(FEEDBACK_DIR).join(format!("REPORT_iter{iteration}.md"));
        std::fs::create_dir_all(report_path.parent().expect("feedback dir"))?;
        std::fs::write(&report_path, &report)?;

        let score = scoring::resolve_score(&report, metric);
        let mut state = self.store.load_state(&self.root)?;
        state.last_score = Some(score);
        self.store.save_state(&self.root, &state)?;

        self.bus
            .publish(
                EventType::ScoreUpdate,
                ScoreUpdateData {
                    project: self.project.clone(),
                    iteration,
                    score,
                    phase: ProjectPhase::Verifying.as_str().to_string(),
                },
            )
            .await;
        self.publish_log(format!("Verifier completed - score: {score}/10"), "info").await;
        Ok(score)
    }

    /// Forwards live sandbox phase results to the bus and the conversation
    /// log while the sandbox is still running later phases.
    fn spawn_phase_forwarder(
        &self,
        iteration: u32,
        mut phase_rx: tokio::sync::mpsc::UnboundedReceiver<(String, PhaseResult)>,
    ) -> tokio::task::JoinHandle<()> {
        let bus = self.bus.clone();
        let store = self.store.clone();
        let project = self.project.clone();
        let root = self.root.clone();
        tokio::spawn(async move {
            while let Some((phase, result)) = phase_rx.recv().await {
                bus.publish(
                    EventType::SandboxPhase,
                    SandboxPhaseData {
                        project: project.clone(),
                        iteration,
                        phase: phase.clone(),
                        status: result.status.as_str().to_string(),
                        stdout: crate::utils::cap_output(&result.stdout, 10_000),
                        stderr: crate::utils::cap_output(&result.stderr, 10_000),
                        exit_code: result.exit_code,
                        duration_s: result.duration_s,
                        commands: result.commands.clone(),
                    },
                )
                .await;
                let msg = ConversationMessage::new(
                    "verifier",
                    "sandbox",
                    iteration,
                    crate::utils::cap_output(&result.stdout, 5_000),
                )
                .with_metadata(json!({
                    "label": format!("Sandbox: {phase}"),
                    "sandbox_phase": phase,
                    "sandbox_status": result.status.as_str(),
                    "exit_code": result.exit_code,
                    "duration_s": result.duration_s,
                    "commands": result.commands,
                }));
                if let Err(e) = store.append_conversation(&root, &msg) {
                    warn!(project = %project, "Could not log sandbox phase: {e}");
                }
            }
        })
    }

    async fn finalize(&self, score: f64, iteration: u32) -> Result<(), TumblerError> {
        info!(project = %self.project, score, "Quality threshold met, finalizing");

        let final_dir = self.root.join(crate::state::FINAL_DIR);
        std::fs::create_dir_all(&final_dir)?;
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let archive_path = final_dir.join(format!("{}_{timestamp}.zip", self.project));
        let staging = self.root.join(STAGING_DIR);
        let archived = crate::sandbox::archive::zip_dir(&staging, &archive_path)?;
        info!(project = %self.project, files = archived, archive = %archive_path.display(), "Final archive written");

        self.set_phase(ProjectPhase::Completed, Some(iteration)).await?;
        self.log_conversation(
            "system",
            "status",
            iteration,
            format!("Project completed! Final score: {score}/10 after {iteration} iteration(s)."),
            Some(json!({"label": "Completed", "score": score})),
        );
        self.bus
            .publish(
                EventType::ProjectComplete,
                ProjectCompleteData { project: self.project.clone(), score, iteration },
            )
            .await;
        Ok(())
    }

    // --- helpers --------------------------------------------------------

    fn checkpoint(&self) -> Result<(), TumblerError> {
        if self.cancel.is_cancelled() {
            Err(TumblerError::Internal("cancelled".to_string()))
        } else {
            Ok(())
        }
    }

    fn budget_exhausted(&self, state: &ProjectState) -> bool {
        state.max_cost > 0.0 && self.store.total_cost(&self.root) >= state.max_cost
    }

    fn provider_for(&self, agent: &str, state: &ProjectState) -> Result<ProviderHandle, TumblerError> {
        let provider_id =
            self.config.resolve_agent_provider(agent, &state.provider_overrides);
        self.registry
            .get(provider_id)
            .map_err(|e| TumblerError::InvalidRequest(format!("provider '{provider_id}': {e}")))
    }

    async fn call_agent(
        &self,
        agent: AgentKind,
        handle: &ProviderHandle,
        messages: Vec<ChatMessage>,
        iteration: u32,
        label: &str,
    ) -> Result<AgentOutcome, TumblerError> {
        let state = self.store.load_state(&self.root)?;
        let call = AgentCall {
            agent,
            project: &self.project,
            project_root: &self.root,
            iteration,
            label,
        };
        let result = self
            .runner
            .run(&call, handle, messages, &state.compression, &self.cancel)
            .await;
        if let Err(e) = &result {
            if !self.cancel.is_cancelled() {
                self.log_conversation(
                    agent.as_str(),
                    "error",
                    iteration,
                    format!("{} agent failed: {e}", agent.as_str()),
                    Some(json!({"label": "Error"})),
                );
            }
        }
        result
    }

    /// Bounded in-iteration retry policy for transient agent failures.
    fn may_retry(&self, e: &TumblerError, attempt: u32) -> bool {
        e.is_retryable()
            && attempt < self.config.tumbler.agent_retries
            && !self.cancel.is_cancelled()
    }

    fn read_plan(&self) -> Result<String, TumblerError> {
        let path = self.root.join(PLAN_DIR).join(PLAN_FILE);
        std::fs::read_to_string(&path).map_err(|_| {
            TumblerError::InvalidRequest(format!("plan file not found: {}", path.display()))
        })
    }

    fn read_feedback(&self, iteration: u32) -> Option<String> {
        let path = self.root.join(FEEDBACK_DIR).join(format!("REPORT_iter{iteration}.md"));
        std::fs::read_to_string(path).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }

    async fn set_phase(
        &self,
        phase: ProjectPhase,
        iteration: Option<u32>,
    ) -> Result<(), TumblerError> {
        let mut state = self.store.load_state(&self.root)?;
        state.phase = phase;
        // is_running is exactly "the loop is in a transient phase".
        state.is_running = phase.is_transient();
        self.store.save_state(&self.root, &state)?;
        self.bus
            .publish(
                EventType::PhaseChange,
                PhaseChangeData {
                    project: self.project.clone(),
                    phase: phase.as_str().to_string(),
                    iteration,
                },
            )
            .await;
        Ok(())
    }

    async fn transition_to_idle(&self) {
        if let Ok(mut state) = self.store.load_state(&self.root) {
            state.phase = ProjectPhase::Idle;
            state.is_running = false;
            let _ = self.store.save_state(&self.root, &state);
        }
        self.bus
            .publish(
                EventType::PhaseChange,
                PhaseChangeData {
                    project: self.project.clone(),
                    phase: ProjectPhase::Idle.as_str().to_string(),
                    iteration: None,
                },
            )
            .await;
    }

    async fn mark_failed(&self, reason: &str) {
        error!(project = %self.project, reason, "Project failed");
        let mut iteration = 0;
        if let Ok(mut state) = self.store.load_state(&self.root) {
            iteration = state.iteration;
            state.phase = ProjectPhase::Failed;
            state.error = Some(reason.to_string());
            state.is_running = false;
            let _ = self.store.save_state(&self.root, &state);
        }
        self.log_conversation(
            "system",
            "error",
            iteration,
            format!("Project failed: {reason}"),
            Some(json!({"label": "Failed"})),
        );
        self.bus
            .publish(
                EventType::PhaseChange,
                PhaseChangeData {
                    project: self.project.clone(),
                    phase: ProjectPhase::Failed.as_str().to_string(),
                    iteration: None,
                },
            )
            .await;
        self.bus
            .publish(
                EventType::ProjectFailed,
                ProjectFailedData { project: self.project.clone(), error: reason.to_string() },
            )
            .await;
    }

    fn log_conversation(
        &self,
        agent: &str,
        role: &str,
        iteration: u32,
        content: String,
        metadata: Option<serde_json::Value>,
    ) {
        let mut msg = ConversationMessage::new(agent, role, iteration, content);
        if let Some(metadata) = metadata {
            msg = msg.with_metadata(metadata);
        }
        if let Err(e) = self.store.append_conversation(&self.root, &msg) {
            warn!(project = %self.project, "Could not append conversation: {e}");
        }
    }

    async fn publish_log(&self, message: String, level: &str) {
        self.bus
            .publish(
                EventType::Log,
                LogData { project: self.project.clone(), message, level: level.to_string() },
            )
            .await;
    }
}

/// Actionable guidance when a feedback report is empty or missing, so the
/// engineer doesn't regenerate identical code.
fn fallback_feedback(missing_iteration: u32) -> String {
    format!(
        "The verifier report for iteration {missing_iteration} was empty or unavailable. \
         Improve the code by:\n\
         1. Ensure all planned files are complete and functional\n\
         2. Add error handling and input validation\n\
         3. Include at least basic tests\n\
         4. Fix any obvious bugs or missing imports"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converges_at_threshold() {
        assert_eq!(decide(8.0, 8.0, 1, 10, 0.0, 0.0, &[8.0]), Decision::Complete);
        assert_eq!(decide(9.9, 8.0, 1, 10, 0.0, 0.0, &[9.9]), Decision::Complete);
    }

    #[test]
    fn test_iteration_cap() {
        let decision = decide(5.0, 8.0, 10, 10, 0.0, 0.0, &[5.0]);
        match decision {
            Decision::Fail(reason) => assert!(reason.starts_with("iteration_cap")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_max_iterations_one_runs_single_cycle() {
        // One engineering+verifying cycle, then terminal regardless.
        assert_eq!(decide(9.0, 8.0, 1, 1, 0.0, 0.0, &[9.0]), Decision::Complete);
        assert!(matches!(decide(5.0, 8.0, 1, 1, 0.0, 0.0, &[5.0]), Decision::Fail(_)));
    }

    #[test]
    fn test_cost_cap() {
        let decision = decide(5.0, 8.0, 1, 10, 0.02, 0.01, &[5.0]);
        match decision {
            Decision::Fail(reason) => assert!(reason.starts_with("cost_cap")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_max_cost_disables_budget() {
        assert_eq!(decide(5.0, 8.0, 1, 10, 999.0, 0.0, &[5.0]), Decision::NextIteration);
    }

    #[test]
    fn test_plateau_detection() {
        let history = [5.0, 5.2, 5.1];
        assert!(matches!(decide(5.1, 8.0, 3, 10, 0.0, 0.0, &history), Decision::Fail(_)));

        let improving = [4.0, 5.0, 6.5];
        assert_eq!(decide(6.5, 8.0, 3, 10, 0.0, 0.0, &improving), Decision::NextIteration);
    }

    #[test]
    fn test_plateau_needs_full_window() {
        assert_eq!(decide(5.0, 8.0, 2, 10, 0.0, 0.0, &[5.0, 5.0]), Decision::NextIteration);
    }

    #[test]
    fn test_threshold_beats_caps() {
        // Converged on the last allowed iteration still completes.
        assert_eq!(decide(8.5, 8.0, 10, 10, 5.0, 1.0, &[8.5]), Decision::Complete);
    }

    #[test]
    fn test_fallback_feedback_names_iteration() {
        assert!(fallback_feedback(3).contains("iteration 3"));
    }
}
