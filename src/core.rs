//! Daemon wiring: config in, running subsystems out.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::agents::runner::AgentRunner;
use crate::compression::PassThrough;
use crate::config::AppConfig;
use crate::events::EventBus;
use crate::orchestrator::Orchestrator;
use crate::providers::ProviderRegistry;
use crate::sandbox::SandboxExecutor;
use crate::state::mirror::{SqlxMirror, StateMirror};
use crate::state::StateStore;

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);

    // 1. Workspace — missing and uncreatable is a fatal startup error.
    let workspace_root = PathBuf::from(&config.workspace.base_path);
    std::fs::create_dir_all(&workspace_root).map_err(|e| {
        anyhow::anyhow!("cannot create workspace '{}': {e}", workspace_root.display())
    })?;
    let workspace_root = workspace_root.canonicalize()?;
    info!(workspace = %workspace_root.display(), "Workspace ready");

    // 2. Optional RDBMS mirror. Failure to connect downgrades to
    // JSON-only persistence; it never blocks startup.
    let mirror: Option<Arc<dyn StateMirror>> = match &config.database.url {
        Some(url) => match SqlxMirror::connect(url).await {
            Ok(mirror) => Some(Arc::new(mirror)),
            Err(e) => {
                warn!("State mirror unavailable, continuing with JSON only: {e}");
                None
            }
        },
        None => None,
    };

    // 3. State store
    let store = Arc::new(StateStore::new(workspace_root.clone(), mirror));

    // 4. Event bus
    let bus = Arc::new(EventBus::default());

    // 5. Provider registry
    let registry = Arc::new(ProviderRegistry::new(config.providers.clone()));
    info!(
        active = %config.active_provider,
        providers = config.providers.len(),
        "Provider registry configured"
    );

    // 6. Sandbox executor. An explicitly configured proxy that is down at
    // startup is a config error (exit 1); the ambient local socket is
    // allowed to come and go and degrades to code-review-only at runtime.
    let sandbox = Arc::new(SandboxExecutor::new());
    if !config.verification.sandbox_enabled {
        warn!("Sandbox verification disabled; projects will be scored by code review only");
    } else if let Some(host) = &config.verification.docker_host {
        sandbox
            .startup_check(&config.verification)
            .await
            .map_err(|e| anyhow::anyhow!("container proxy '{host}' unreachable at startup: {e}"))?;
        info!(proxy = %host, "Container proxy reachable");
    }

    // 7. Agent runner (compression is a pass-through until a real engine
    // is plugged in)
    let runner = Arc::new(AgentRunner::new(bus.clone(), store.clone(), Arc::new(PassThrough)));

    // 8. Orchestrator
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        store,
        bus,
        registry,
        sandbox,
        runner,
    ));
    let repaired = orchestrator.reconcile_on_startup();
    if repaired > 0 {
        info!(repaired, "Reconciled projects left running by a previous daemon");
    }

    // 9. Health probe
    if let Some(port) = config.daemon.health_port {
        tokio::spawn(async move {
            if let Err(e) = crate::daemon::start_health_server(port).await {
                warn!("Health server exited: {e}");
            }
        });
    }

    // 10. File watcher — kept alive by binding until shutdown.
    let _watcher = crate::watcher::spawn(
        workspace_root,
        orchestrator.clone(),
        std::time::Duration::from_secs(config.tumbler.debounce_secs),
    )?;

    info!(
        max_concurrent = config.tumbler.max_concurrent_projects,
        quality_threshold = config.tumbler.quality_threshold,
        max_iterations = config.tumbler.max_iterations,
        "Orchestrator daemon running; waiting for triggers (Ctrl+C to stop)"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining project loops");
    orchestrator.shutdown().await;
    info!("Orchestrator stopped");
    Ok(())
}
