//! Filesystem trigger watcher.
//!
//! The workspace layout is a public interface: dropping
//! `01_input/requirements.txt`, editing `02_plan/PLAN.md`, or placing
//! `03_staging/.manifest.json` advances a project without touching any API.
//! Events are debounced per (project, trigger) and forwarded to the
//! orchestrator, which owns idempotence for already-running projects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cycle::StartPoint;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Requirements,
    Plan,
    Manifest,
}

impl TriggerKind {
    pub fn start_point(&self) -> StartPoint {
        match self {
            TriggerKind::Requirements => StartPoint::Planning,
            TriggerKind::Plan => StartPoint::Engineering,
            TriggerKind::Manifest => StartPoint::Verifying,
        }
    }
}

/// Map an absolute event path to (project name, trigger kind). The project
/// is the first path component under the workspace root.
pub fn classify(workspace_root: &Path, path: &Path) -> Option<(String, TriggerKind)> {
    let relative = path.strip_prefix(workspace_root).ok()?;
    let mut components = relative.components();
    let project = components.next()?.as_os_str().to_str()?.to_string();
    if project.starts_with('.') {
        return None;
    }
    let rest: PathBuf = components.collect();
    let kind = match rest.to_str()? {
        "01_input/requirements.txt" => TriggerKind::Requirements,
        "02_plan/PLAN.md" => TriggerKind::Plan,
        "03_staging/.manifest.json" => TriggerKind::Manifest,
        _ => return None,
    };
    Some((project, kind))
}

/// Coalesces rapid saves of the same trigger file: only the first event in
/// each window is forwarded.
pub struct Debouncer {
    window: Duration,
    last_seen: HashMap<(String, TriggerKind), Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last_seen: HashMap::new() }
    }

    pub fn should_process(&mut self, project: &str, kind: TriggerKind) -> bool {
        let key = (project.to_string(), kind);
        let now = Instant::now();
        match self.last_seen.get(&key) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.last_seen.insert(key, now);
                true
            }
        }
    }
}

/// Watch the workspace and dispatch triggers until the daemon shuts down.
/// Returns the watcher, which must stay alive for events to flow.
pub fn spawn(
    workspace_root: PathBuf,
    orchestrator: Arc<Orchestrator>,
    debounce: Duration,
) -> anyhow::Result<RecommendedWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) => {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    let _ = tx.send(event);
                }
            }
            Err(e) => warn!("File watcher error: {e}"),
        }
    })?;
    watcher.watch(&workspace_root, RecursiveMode::Recursive)?;
    info!(workspace = %workspace_root.display(), "File watcher started");

    tokio::spawn(async move {
        let mut debouncer = Debouncer::new(debounce);
        while let Some(event) = rx.recv().await {
            for path in &event.paths {
                let Some((project, kind)) = classify(&workspace_root, path) else {
                    continue;
                };
                if !debouncer.should_process(&project, kind) {
                    debug!(project = %project, ?kind, "Trigger debounced");
                    continue;
                }
                info!(project = %project, ?kind, "Trigger file detected");
                orchestrator.handle_trigger(&project, kind.start_point()).await;
            }
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_trigger_paths() {
        let root = Path::new("/ws");
        assert_eq!(
            classify(root, Path::new("/ws/demo/01_input/requirements.txt")),
            Some(("demo".to_string(), TriggerKind::Requirements))
        );
        assert_eq!(
            classify(root, Path::new("/ws/demo/02_plan/PLAN.md")),
            Some(("demo".to_string(), TriggerKind::Plan))
        );
        assert_eq!(
            classify(root, Path::new("/ws/demo/03_staging/.manifest.json")),
            Some(("demo".to_string(), TriggerKind::Manifest))
        );
    }

    #[test]
    fn test_classify_ignores_non_triggers() {
        let root = Path::new("/ws");
        assert_eq!(classify(root, Path::new("/ws/demo/03_staging/main.py")), None);
        assert_eq!(classify(root, Path::new("/ws/demo/.tumbler/state.json")), None);
        assert_eq!(classify(root, Path::new("/elsewhere/x/01_input/requirements.txt")), None);
        // Dotdirs directly under the root are not projects.
        assert_eq!(classify(root, Path::new("/ws/.cache/01_input/requirements.txt")), None);
    }

    #[test]
    fn test_trigger_start_points() {
        assert_eq!(TriggerKind::Requirements.start_point(), StartPoint::Planning);
        assert_eq!(TriggerKind::Plan.start_point(), StartPoint::Engineering);
        assert_eq!(TriggerKind::Manifest.start_point(), StartPoint::Verifying);
    }

    #[test]
    fn test_debounce_window() {
        let mut debouncer = Debouncer::new(Duration::from_millis(200));
        assert!(debouncer.should_process("demo", TriggerKind::Plan));
        // Second identical trigger inside the window is swallowed.
        assert!(!debouncer.should_process("demo", TriggerKind::Plan));
        // Different trigger or project has its own window.
        assert!(debouncer.should_process("demo", TriggerKind::Manifest));
        assert!(debouncer.should_process("other", TriggerKind::Plan));
    }

    #[test]
    fn test_debounce_expires() {
        let mut debouncer = Debouncer::new(Duration::from_millis(10));
        assert!(debouncer.should_process("demo", TriggerKind::Plan));
        std::thread::sleep(Duration::from_millis(20));
        assert!(debouncer.should_process("demo", TriggerKind::Plan));
    }
}
