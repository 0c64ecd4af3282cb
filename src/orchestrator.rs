//! Top-level scheduler over per-project feedback loops.
//!
//! Holds the only registry of running loops and the per-project cooperative
//! lock implied by it: a project appears in the registry exactly while its
//! loop task is alive, and every external mutation (start, stop, reset,
//! delete, provider updates) goes through here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compression::CompressionConfig;
use crate::config::AppConfig;
use crate::cycle::{ProjectCycle, StartPoint};
use crate::errors::TumblerError;
use crate::events::EventBus;
use crate::providers::ProviderRegistry;
use crate::sandbox::SandboxExecutor;
use crate::state::{ProjectPhase, ProjectState, ProjectSummary, StateStore};

struct LoopHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct Orchestrator {
    config: Arc<AppConfig>,
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    registry: Arc<ProviderRegistry>,
    sandbox: Arc<SandboxExecutor>,
    runner: Arc<crate::agents::runner::AgentRunner>,
    running: tokio::sync::Mutex<HashMap<String, LoopHandle>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        registry: Arc<ProviderRegistry>,
        sandbox: Arc<SandboxExecutor>,
        runner: Arc<crate::agents::runner::AgentRunner>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            registry,
            sandbox,
            runner,
            running: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The shared bus, for test subscriptions.
    #[cfg(test)]
    pub fn bus_for_tests(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Startup reconciliation: a crashed daemon leaves `is_running: true`
    /// and a transient phase behind; neither survives a restart unless the
    /// loop actually resumes (it doesn't — operators restart explicitly).
    pub fn reconcile_on_startup(&self) -> usize {
        let mut repaired = 0;
        for summary in self.store.list_projects() {
            let root = self.store.project_root(&summary.name);
            let Ok(mut state) = self.store.load_state(&root) else { continue };
            let mut dirty = false;
            if state.is_running {
                state.is_running = false;
                dirty = true;
            }
            if state.phase.is_transient() {
                state.phase = ProjectPhase::Idle;
                dirty = true;
            }
            if dirty {
                if let Err(e) = self.store.save_state(&root, &state) {
                    warn!(project = %summary.name, "Reconcile failed: {e}");
                } else {
                    info!(project = %summary.name, "Reconciled stale running state");
                    repaired += 1;
                }
            }
        }
        repaired
    }

    pub fn create_project(
        &self,
        name: &str,
        requirements: &str,
    ) -> Result<ProjectState, TumblerError> {
        self.store.create_project(name, requirements, &self.config.tumbler)
    }

    pub fn list_projects(&self) -> Vec<ProjectSummary> {
        self.store.list_projects()
    }

    pub async fn running_count(&self) -> usize {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.join.is_finished());
        running.len()
    }

    /// Start (or advance) a project's loop. Rejects rather than queues when
    /// the pool is full, and drops duplicate starts of a live project.
    pub async fn start(
        self: &Arc<Self>,
        name: &str,
        entry: StartPoint,
    ) -> Result<(), TumblerError> {
        let root = self.store.project_root(name);
        let state = self.store.load_state(&root)?;
        if state.phase == ProjectPhase::Failed && entry == StartPoint::Planning {
            return Err(TumblerError::InvalidRequest(format!(
                "project '{name}' is failed; reset it before starting again"
            )));
        }

        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.join.is_finished());
        if running.contains_key(name) {
            return Err(TumblerError::InvalidRequest(format!(
                "project '{name}' is already running"
            )));
        }
        let limit = self.config.tumbler.max_concurrent_projects;
        if running.len() >= limit {
            return Err(TumblerError::AtCapacity { limit });
        }

        let cancel = CancellationToken::new();
        let cycle = ProjectCycle {
            project: name.to_string(),
            root,
            entry,
            config: self.config.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            registry: self.registry.clone(),
            sandbox: self.sandbox.clone(),
            runner: self.runner.clone(),
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(cycle.run());
        running.insert(name.to_string(), LoopHandle { cancel, join });
        info!(project = name, ?entry, active = running.len(), "Project loop started");
        Ok(())
    }

    /// Cancel a running loop and wait (bounded) for it to settle into idle.
    pub async fn stop(&self, name: &str) -> Result<(), TumblerError> {
        let handle = {
            let mut running = self.running.lock().await;
            running.remove(name)
        };
        let Some(handle) = handle else {
            return Err(TumblerError::InvalidRequest(format!(
                "project '{name}' is not running"
            )));
        };
        handle.cancel.cancel();
        let drain = Duration::from_secs(self.config.tumbler.shutdown_drain_secs);
        if tokio::time::timeout(drain, handle.join).await.is_err() {
            warn!(project = name, "Loop did not drain in time, detaching");
        }
        info!(project = name, "Project loop stopped");
        Ok(())
    }

    /// Filesystem trigger entry point. Idempotent for running projects:
    /// duplicate triggers are dropped silently.
    pub async fn handle_trigger(self: &Arc<Self>, name: &str, entry: StartPoint) {
        {
            let mut running = self.running.lock().await;
            running.retain(|_, handle| !handle.join.is_finished());
            if running.contains_key(name) {
                debug!(project = name, "Trigger ignored, loop already running");
                return;
            }
        }

        // Plan/manifest triggers only advance idle projects; a terminal or
        // mid-flight project ignores them.
        if entry != StartPoint::Planning {
            let root = self.store.project_root(name);
            match self.store.load_state(&root) {
                Ok(state) if state.phase == ProjectPhase::Idle => {}
                Ok(state) => {
                    debug!(project = name, phase = state.phase.as_str(), "Trigger ignored in this phase");
                    return;
                }
                Err(e) => {
                    warn!(project = name, "Trigger for unknown project: {e}");
                    return;
                }
            }
        }

        match self.start(name, entry).await {
            Ok(()) => {}
            Err(TumblerError::AtCapacity { limit }) => {
                warn!(project = name, limit, "Trigger rejected, orchestrator at capacity");
            }
            Err(e) => debug!(project = name, "Trigger not started: {e}"),
        }
    }

    /// Reset requires a stopped project; artifacts in `05_final` and the
    /// requirements survive.
    pub async fn reset(&self, name: &str) -> Result<ProjectState, TumblerError> {
        if self.is_running(name).await {
            return Err(TumblerError::InvalidRequest(format!(
                "project '{name}' is running; stop it before reset"
            )));
        }
        self.store.reset_project(&self.store.project_root(name))
    }

    pub async fn delete(&self, name: &str) -> Result<(), TumblerError> {
        if self.is_running(name).await {
            self.stop(name).await?;
        }
        self.store.delete_project(&self.store.project_root(name))
    }

    pub async fn update_providers(
        &self,
        name: &str,
        overrides: HashMap<String, String>,
    ) -> Result<(), TumblerError> {
        for provider in overrides.values() {
            self.registry.get(provider).map_err(|e| {
                TumblerError::InvalidRequest(format!("unknown provider '{provider}': {e}"))
            })?;
        }
        let root = self.store.project_root(name);
        let mut state = self.store.load_state(&root)?;
        state.provider_overrides = overrides;
        self.store.save_state(&root, &state)
    }

    pub async fn update_compression(
        &self,
        name: &str,
        compression: CompressionConfig,
    ) -> Result<(), TumblerError> {
        let root = self.store.project_root(name);
        let mut state = self.store.load_state(&root)?;
        state.compression = compression;
        self.store.save_state(&root, &state)
    }

    async fn is_running(&self, name: &str) -> bool {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.join.is_finished());
        running.contains_key(name)
    }

    /// Cancel every loop and wait up to the drain interval for all of them.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, LoopHandle)> = {
            let mut running = self.running.lock().await;
            running.drain().collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Shutting down running project loops");
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        let drain = Duration::from_secs(self.config.tumbler.shutdown_drain_secs);
        let all = futures::future::join_all(handles.into_iter().map(|(name, handle)| async move {
            if tokio::time::timeout(drain, handle.join).await.is_err() {
                warn!(project = %name, "Loop did not drain before shutdown");
            }
        }));
        all.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::runner::AgentRunner;
    use crate::compression::PassThrough;

    fn test_config(workspace: &std::path::Path) -> AppConfig {
        let yaml = format!(
            r#"
active_provider: local
providers:
  local:
    type: ollama
    base_url: http://localhost:11434
    model: test-model
workspace:
  base_path: "{}"
tumbler:
  max_concurrent_projects: 1
"#,
            workspace.display()
        );
        serde_yaml::from_str(&yaml).expect("test config")
    }

    fn orchestrator(dir: &tempfile::TempDir) -> Arc<Orchestrator> {
        let config = Arc::new(test_config(dir.path()));
        let store = Arc::new(StateStore::new(dir.path().to_path_buf(), None));
        let bus = Arc::new(EventBus::default());
        let registry = Arc::new(ProviderRegistry::new(config.providers.clone()));
        let sandbox = Arc::new(SandboxExecutor::new());
        let runner =
            Arc::new(AgentRunner::new(bus.clone(), store.clone(), Arc::new(PassThrough)));
        Arc::new(Orchestrator::new(config, store, bus, registry, sandbox, runner))
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.create_project("demo", "Build a CLI").unwrap();
        let projects = orch.list_projects();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "demo");
        assert_eq!(projects[0].phase, ProjectPhase::Idle);
    }

    #[tokio::test]
    async fn test_start_unknown_project_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        assert!(matches!(
            orch.start("ghost", StartPoint::Planning).await,
            Err(TumblerError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_clears_stale_running_flags() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.create_project("demo", "reqs").unwrap();
        let root = orch.store.project_root("demo");
        let mut state = orch.store.load_state(&root).unwrap();
        state.is_running = true;
        state.phase = ProjectPhase::Engineering;
        orch.store.save_state(&root, &state).unwrap();

        assert_eq!(orch.reconcile_on_startup(), 1);
        let state = orch.store.load_state(&root).unwrap();
        assert!(!state.is_running);
        assert_eq!(state.phase, ProjectPhase::Idle);
    }

    #[tokio::test]
    async fn test_reconcile_leaves_terminal_phases() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.create_project("done", "reqs").unwrap();
        let root = orch.store.project_root("done");
        let mut state = orch.store.load_state(&root).unwrap();
        state.phase = ProjectPhase::Completed;
        state.last_score = Some(9.0);
        orch.store.save_state(&root, &state).unwrap();

        assert_eq!(orch.reconcile_on_startup(), 0);
        assert_eq!(orch.store.load_state(&root).unwrap().phase, ProjectPhase::Completed);
    }

    #[tokio::test]
    async fn test_failed_project_requires_reset_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.create_project("demo", "reqs").unwrap();
        let root = orch.store.project_root("demo");
        let mut state = orch.store.load_state(&root).unwrap();
        state.phase = ProjectPhase::Failed;
        state.error = Some("iteration_cap: 3".to_string());
        orch.store.save_state(&root, &state).unwrap();

        assert!(matches!(
            orch.start("demo", StartPoint::Planning).await,
            Err(TumblerError::InvalidRequest(_))
        ));

        let after = orch.reset("demo").await.unwrap();
        assert_eq!(after.phase, ProjectPhase::Idle);
        assert!(after.error.is_none());
    }

    #[tokio::test]
    async fn test_update_providers_validates_ids() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.create_project("demo", "reqs").unwrap();

        let mut bad = HashMap::new();
        bad.insert("engineer".to_string(), "nonexistent".to_string());
        assert!(orch.update_providers("demo", bad).await.is_err());

        let mut good = HashMap::new();
        good.insert("engineer".to_string(), "local".to_string());
        orch.update_providers("demo", good).await.unwrap();
        let state = orch.store.load_state(&orch.store.project_root("demo")).unwrap();
        assert_eq!(state.provider_overrides["engineer"], "local");
    }

    #[tokio::test]
    async fn test_stop_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.create_project("demo", "reqs").unwrap();
        assert!(matches!(
            orch.stop("demo").await,
            Err(TumblerError::InvalidRequest(_))
        ));
    }
}
