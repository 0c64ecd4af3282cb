//! Cross-module scenarios over real temp workspaces.
//!
//! Providers are scripted (no network) and the sandbox is disabled, which
//! exercises the code-review-only path end to end: the loop converges or
//! fails purely on Verifier report scores.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::agents::runner::AgentRunner;
use crate::compression::PassThrough;
use crate::config::{AppConfig, ProviderKind, ProviderSettings};
use crate::cycle::StartPoint;
use crate::errors::TumblerError;
use crate::events::{EventBus, EventType, SubscriptionFilter};
use crate::orchestrator::Orchestrator;
use crate::providers::{
    ChatMessage, ChatOptions, ChatProvider, EventStream, ProviderHandle, ProviderRegistry,
    StreamEvent,
};
use crate::sandbox::SandboxExecutor;
use crate::state::{ProjectPhase, StateStore, FEEDBACK_DIR, FINAL_DIR, STAGING_DIR};

/// Streams one canned response per call, in 7-char fragments. An exhausted
/// script yields a never-ending silent stream (useful for stop tests).
struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedProvider {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn stream_chat(
        &self,
        _messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> anyhow::Result<EventStream> {
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(response) => {
                let fragments: Vec<anyhow::Result<StreamEvent>> = response
                    .as_bytes()
                    .chunks(7)
                    .map(|c| Ok(StreamEvent::Content(String::from_utf8_lossy(c).into_owned())))
                    .collect();
                Ok(futures::stream::iter(fragments).boxed())
            }
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

const PLAN_RESPONSE: &str = r#"# Plan: hello CLI

## Stack
Plain Python, pytest.

## Files
- main.py
- test_main.py

Test Commands:
```bash
python -m pytest -x
```
"#;

const ENGINEER_RESPONSE: &str = r#"[
  {"path": "main.py", "content": "def main():\n    print('hello world')\n"},
  {"path": "test_main.py", "content": "from main import main\n\ndef test_main():\n    main()\n"},
  {"path": "../../etc/passwd", "content": "pwned"}
]"#;

fn harness(
    dir: &tempfile::TempDir,
    script: &[&str],
    costs_per_1k: f64,
    overrides: &str,
) -> Arc<Orchestrator> {
    let yaml = format!(
        r#"
active_provider: local
providers:
  local:
    type: ollama
    base_url: http://localhost:11434
    model: scripted
    cost_per_1k_input_tokens: {costs_per_1k}
    cost_per_1k_output_tokens: {costs_per_1k}
verification:
  sandbox_enabled: false
workspace:
  base_path: "{}"
{overrides}
"#,
        dir.path().display()
    );
    let config: Arc<AppConfig> = Arc::new(serde_yaml::from_str(&yaml).expect("test config"));
    let store = Arc::new(StateStore::new(dir.path().to_path_buf(), None));
    let bus = Arc::new(EventBus::default());
    let registry = Arc::new(ProviderRegistry::new(config.providers.clone()));
    registry.insert_for_tests(
        "local",
        ProviderHandle {
            id: "local".to_string(),
            settings: ProviderSettings {
                kind: ProviderKind::Ollama,
                base_url: None,
                api_key_env: None,
                model: "scripted".to_string(),
                cost_per_1k_input_tokens: costs_per_1k,
                cost_per_1k_output_tokens: costs_per_1k,
                temperature: 0.7,
                max_tokens: None,
                timeout_secs: 30,
                context_length: None,
                supports_async: false,
                concurrency_limit: 4,
            },
            provider: Arc::new(ScriptedProvider::new(script)),
        },
    );
    let sandbox = Arc::new(SandboxExecutor::new());
    let runner = Arc::new(AgentRunner::new(bus.clone(), store.clone(), Arc::new(PassThrough)));
    Arc::new(Orchestrator::new(config, store, bus, registry, sandbox, runner))
}

async fn wait_for_terminal(orch: &Orchestrator, name: &str) -> ProjectPhase {
    for _ in 0..200 {
        let summary = orch
            .list_projects()
            .into_iter()
            .find(|p| p.name == name)
            .expect("project listed");
        if summary.phase.is_terminal() {
            return summary.phase;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("project '{name}' never reached a terminal phase");
}

#[tokio::test]
async fn test_happy_path_completes_and_archives() {
    let dir = tempfile::tempdir().unwrap();
    let report = "Looks good.\n\nOverall Score: 9/10\n";
    let orch = harness(&dir, &[PLAN_RESPONSE, ENGINEER_RESPONSE, report], 0.0, "");

    orch.create_project("hello", "Write a Python CLI that prints 'hello world'.").unwrap();

    // Watch terminal events while the loop runs.
    let bus_rx = {
        // Subscribe through a fresh filter on the same bus the harness
        // wired into the orchestrator.
        orch_subscribe(&orch, "hello")
    };

    orch.start("hello", StartPoint::Planning).await.unwrap();
    let phase = wait_for_terminal(&orch, "hello").await;
    assert_eq!(phase, ProjectPhase::Completed);

    let root = dir.path().join("hello");
    // Plan, staging (path-escape entry dropped), report, archive.
    assert!(root.join("02_plan/PLAN.md").exists());
    assert!(root.join(STAGING_DIR).join("main.py").exists());
    assert!(root.join(STAGING_DIR).join("test_main.py").exists());
    assert!(root.join(STAGING_DIR).join(".manifest.json").exists());
    assert!(!dir.path().join("etc/passwd").exists());
    assert!(root.join(FEEDBACK_DIR).join("REPORT_iter1.md").exists());
    let archives: Vec<_> = std::fs::read_dir(root.join(FINAL_DIR))
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "zip"))
        .collect();
    assert_eq!(archives.len(), 1);
    assert!(archives[0].file_name().to_string_lossy().starts_with("hello_"));

    // State reflects convergence.
    let store = StateStore::new(dir.path().to_path_buf(), None);
    let state = store.load_state(&root).unwrap();
    assert_eq!(state.phase, ProjectPhase::Completed);
    assert_eq!(state.iteration, 1);
    assert_eq!(state.last_score, Some(9.0));
    assert!(!state.is_running);

    // Three agent calls recorded.
    let usage = store.load_usage(&root);
    assert_eq!(usage.history.len(), 3);
    let agents: Vec<&str> = usage.history.iter().map(|r| r.agent.as_str()).collect();
    assert_eq!(agents, vec!["architect", "engineer", "verifier"]);

    // Terminal events arrived in loop order for this project.
    let phases = drain_phases(bus_rx).await;
    assert_eq!(phases, vec!["planning", "engineering", "verifying", "completed"]);
}

fn orch_subscribe(
    orch: &Orchestrator,
    project: &str,
) -> tokio::sync::mpsc::Receiver<crate::events::Event> {
    orch.bus_for_tests().subscribe(SubscriptionFilter {
        project: Some(project.to_string()),
        event_types: Some(vec![EventType::PhaseChange]),
    })
}

async fn drain_phases(
    mut rx: tokio::sync::mpsc::Receiver<crate::events::Event>,
) -> Vec<String> {
    let mut phases = Vec::new();
    while let Ok(event) = rx.try_recv() {
        phases.push(event.data["phase"].as_str().unwrap_or("").to_string());
    }
    phases
}

#[tokio::test]
async fn test_refinement_loop_uses_feedback() {
    let dir = tempfile::tempdir().unwrap();
    let weak_report = "test_main failed: expected greeting.\n\nOverall Score: 6/10\n";
    let fixed_engineer = r#"[{"path": "main.py", "content": "print('hello world')\n"}]"#;
    let good_report = "All good now.\n\nOverall Score: 9.5/10\n";
    let orch = harness(
        &dir,
        &[PLAN_RESPONSE, ENGINEER_RESPONSE, weak_report, fixed_engineer, good_report],
        0.0,
        "tumbler:\n  quality_threshold: 9.5\n",
    );

    orch.create_project("refine", "Print hello world. Tests included.").unwrap();
    orch.start("refine", StartPoint::Planning).await.unwrap();
    assert_eq!(wait_for_terminal(&orch, "refine").await, ProjectPhase::Completed);

    let root = dir.path().join("refine");
    let store = StateStore::new(dir.path().to_path_buf(), None);
    let state = store.load_state(&root).unwrap();
    assert_eq!(state.iteration, 2);
    assert_eq!(state.last_score, Some(9.5));
    assert!(root.join(FEEDBACK_DIR).join("REPORT_iter1.md").exists());
    assert!(root.join(FEEDBACK_DIR).join("REPORT_iter2.md").exists());

    // Iteration-2 input carried the iteration-1 feedback forward.
    let conversation = store.load_conversation(&root);
    let feedback_inputs: Vec<_> = conversation
        .iter()
        .filter(|m| m.role == "input" && m.content.contains("test_main failed"))
        .collect();
    assert!(!feedback_inputs.is_empty());
}

#[tokio::test]
async fn test_iteration_cap_fails_without_archive() {
    let dir = tempfile::tempdir().unwrap();
    let orch = harness(
        &dir,
        &[
            PLAN_RESPONSE,
            ENGINEER_RESPONSE,
            "Weak.\n\nOverall Score: 5/10\n",
            ENGINEER_RESPONSE,
            "Slightly better.\n\nOverall Score: 6/10\n",
        ],
        0.0,
        "tumbler:\n  quality_threshold: 10.0\n  max_iterations: 2\n",
    );

    orch.create_project("capped", "Impossible standards.").unwrap();
    orch.start("capped", StartPoint::Planning).await.unwrap();
    assert_eq!(wait_for_terminal(&orch, "capped").await, ProjectPhase::Failed);

    let root = dir.path().join("capped");
    let store = StateStore::new(dir.path().to_path_buf(), None);
    let state = store.load_state(&root).unwrap();
    assert!(state.error.as_deref().unwrap_or("").starts_with("iteration_cap"));
    assert!(root.join(FEEDBACK_DIR).join("REPORT_iter1.md").exists());
    assert!(root.join(FEEDBACK_DIR).join("REPORT_iter2.md").exists());
    // Artifacts kept for forensics, but nothing archived.
    let finals = std::fs::read_dir(root.join(FINAL_DIR)).map(|d| d.count()).unwrap_or(0);
    assert_eq!(finals, 0);
    assert!(root.join(STAGING_DIR).join("main.py").exists());
}

#[tokio::test]
async fn test_budget_cap_stops_agent_calls() {
    let dir = tempfile::tempdir().unwrap();
    // Absurd per-token pricing makes the architect call alone bust the cap.
    let orch = harness(
        &dir,
        &[PLAN_RESPONSE, ENGINEER_RESPONSE, "Overall Score: 6/10"],
        1000.0,
        "tumbler:\n  quality_threshold: 9.0\n  max_cost_per_project: 0.01\n",
    );

    orch.create_project("pricey", "Anything at all.").unwrap();
    orch.start("pricey", StartPoint::Planning).await.unwrap();
    assert_eq!(wait_for_terminal(&orch, "pricey").await, ProjectPhase::Failed);

    let root = dir.path().join("pricey");
    let store = StateStore::new(dir.path().to_path_buf(), None);
    let state = store.load_state(&root).unwrap();
    assert!(state.error.as_deref().unwrap_or("").starts_with("cost_cap"));
    // Cap detection preceded any engineering call.
    let usage = store.load_usage(&root);
    assert_eq!(usage.history.len(), 1);
    assert_eq!(usage.history[0].agent, "architect");
}

#[tokio::test]
async fn test_stop_returns_to_idle_without_persisting_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    // Empty script: the first agent call hangs on a silent stream.
    let orch = harness(&dir, &[], 0.0, "");

    orch.create_project("stoppable", "Takes forever.").unwrap();
    orch.start("stoppable", StartPoint::Planning).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    orch.stop("stoppable").await.unwrap();

    let root = dir.path().join("stoppable");
    let store = StateStore::new(dir.path().to_path_buf(), None);
    let state = store.load_state(&root).unwrap();
    assert_eq!(state.phase, ProjectPhase::Idle);
    assert!(!state.is_running);
    // The cancelled architect call persisted no output message and no usage.
    let conversation = store.load_conversation(&root);
    assert!(conversation.iter().all(|m| m.role != "output"));
    assert!(store.load_usage(&root).history.is_empty());
}

#[tokio::test]
async fn test_duplicate_start_and_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let orch = harness(&dir, &[], 0.0, "tumbler:\n  max_concurrent_projects: 1\n");

    orch.create_project("one", "reqs").unwrap();
    orch.create_project("two", "reqs").unwrap();

    orch.start("one", StartPoint::Planning).await.unwrap();
    assert!(matches!(
        orch.start("one", StartPoint::Planning).await,
        Err(TumblerError::InvalidRequest(_))
    ));
    assert!(matches!(
        orch.start("two", StartPoint::Planning).await,
        Err(TumblerError::AtCapacity { limit: 1 })
    ));

    // A trigger for the running project is dropped silently.
    orch.handle_trigger("one", StartPoint::Planning).await;
    assert_eq!(orch.running_count().await, 1);

    orch.stop("one").await.unwrap();
}
