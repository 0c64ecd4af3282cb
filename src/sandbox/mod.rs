//! Sandboxed verification of generated code in ephemeral containers.
//!
//! Each phase (install, build, test, lint) runs in a fresh container with
//! all capabilities dropped, no-new-privileges, resource limits, and no
//! network except restricted egress during install. Project files enter via
//! an in-memory tar; nothing on the host is bind-mounted. The container
//! runtime is reached through a restricted proxy (`docker_host`) when
//! configured — failure to reach it degrades to code-review-only
//! verification upstream, never a loop failure.

pub mod archive;

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
    LogsOptions, RemoveContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{parse_byte_size, VerificationConfig};
use crate::errors::TumblerError;
use crate::plan::PlanStrategy;
use crate::utils::cap_output;

const MAX_CAPTURED_OUTPUT: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Success,
    Failed,
    Timeout,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Success => "success",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Timeout => "timeout",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PhaseResult {
    pub status: PhaseStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration_s: f64,
    pub commands: Vec<String>,
}

impl Default for PhaseResult {
    fn default() -> Self {
        Self {
            status: PhaseStatus::Skipped,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            duration_s: 0.0,
            commands: Vec::new(),
        }
    }
}

impl PhaseResult {
    fn skipped(commands: Vec<String>) -> Self {
        Self { commands, ..Default::default() }
    }

    /// Skipped counts as ok: a runtime with no build step hasn't failed.
    pub fn ok(&self) -> bool {
        matches!(self.status, PhaseStatus::Success | PhaseStatus::Skipped)
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub install: PhaseResult,
    pub build: PhaseResult,
    pub test: PhaseResult,
    pub lint: PhaseResult,
    pub test_counts: (u32, u32),
    pub lint_issues: u32,
    pub errors: Vec<String>,
    pub code_review_only: bool,
}

impl SandboxResult {
    /// All phases skipped, static review is the only signal.
    pub fn review_only(reason: &str) -> Self {
        Self {
            install: PhaseResult::default(),
            build: PhaseResult::default(),
            test: PhaseResult::default(),
            lint: PhaseResult::default(),
            test_counts: (0, 0),
            lint_issues: 0,
            errors: vec![reason.to_string()],
            code_review_only: true,
        }
    }

    pub fn build_succeeded(&self) -> bool {
        self.install.ok() && self.build.ok()
    }
}

/// Detected language runtime with default phase commands.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub language: &'static str,
    pub image: &'static str,
    pub install_commands: Vec<String>,
    pub build_commands: Vec<String>,
    pub test_commands: Vec<String>,
    pub lint_commands: Vec<String>,
}

fn runtime_for_marker(marker: &str) -> Option<RuntimeInfo> {
    let commands = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    match marker {
        "package.json" => Some(RuntimeInfo {
            language: "javascript",
            image: "node:20-slim",
            install_commands: commands(&["npm install --ignore-scripts"]),
            build_commands: commands(&["npm run build --if-present"]),
            test_commands: commands(&["npm test --if-present"]),
            lint_commands: commands(&[
                "npx eslint . --no-error-on-unmatched-pattern 2>/dev/null || true",
            ]),
        }),
        "requirements.txt" => Some(RuntimeInfo {
            language: "python",
            image: "python:3.12-slim",
            install_commands: commands(&["pip install --no-cache-dir -r requirements.txt"]),
            build_commands: Vec::new(),
            test_commands: commands(&["python -m pytest -x --tb=short 2>&1 || true"]),
            lint_commands: commands(&[
                "python -m flake8 --max-line-length=120 --statistics 2>&1 || true",
            ]),
        }),
        "pyproject.toml" => Some(RuntimeInfo {
            language: "python",
            image: "python:3.12-slim",
            install_commands: commands(&[
                "pip install --no-cache-dir -e '.[dev]' 2>/dev/null || pip install --no-cache-dir .",
            ]),
            build_commands: Vec::new(),
            test_commands: commands(&["python -m pytest -x --tb=short 2>&1 || true"]),
            lint_commands: commands(&[
                "python -m flake8 --max-line-length=120 --statistics 2>&1 || true",
            ]),
        }),
        "go.mod" => Some(RuntimeInfo {
            language: "go",
            image: "golang:1.22-alpine",
            install_commands: commands(&["go mod download"]),
            build_commands: commands(&["go build ./..."]),
            test_commands: commands(&["go test ./... -count=1 -timeout 30s"]),
            lint_commands: commands(&["go vet ./..."]),
        }),
        "Cargo.toml" => Some(RuntimeInfo {
            language: "rust",
            image: "rust:1.78-slim",
            install_commands: Vec::new(),
            build_commands: commands(&["cargo build 2>&1"]),
            test_commands: commands(&["cargo test 2>&1"]),
            lint_commands: commands(&["cargo clippy 2>&1 || true"]),
        }),
        "pom.xml" => Some(RuntimeInfo {
            language: "java",
            image: "eclipse-temurin:21-jdk-alpine",
            install_commands: Vec::new(),
            build_commands: commands(&["mvn -q compile 2>&1"]),
            test_commands: commands(&["mvn -q test 2>&1"]),
            lint_commands: Vec::new(),
        }),
        _ => None,
    }
}

const MARKER_ORDER: &[&str] = &[
    "package.json",
    "requirements.txt",
    "pyproject.toml",
    "go.mod",
    "Cargo.toml",
    "pom.xml",
];

/// First-match runtime detection over marker files, then plan keywords.
pub fn detect_runtime(plan: &str, workspace: &Path) -> Option<RuntimeInfo> {
    for marker in MARKER_ORDER {
        if workspace.join(marker).exists() {
            let runtime = runtime_for_marker(marker).expect("marker table entry");
            info!(language = runtime.language, marker, "Detected runtime from marker file");
            return Some(runtime);
        }
    }

    let plan_lower = plan.to_lowercase();
    let keyword_sets: &[(&str, &[&str])] = &[
        ("package.json", &["react", "node", "npm", "javascript", "typescript", "next.js", "express"]),
        ("requirements.txt", &["python", "flask", "django", "fastapi", "pytest"]),
        ("go.mod", &["golang", "go module", "go.mod"]),
    ];
    for (marker, keywords) in keyword_sets {
        if keywords.iter().any(|kw| plan_lower.contains(kw)) {
            let runtime = runtime_for_marker(marker).expect("marker table entry");
            info!(language = runtime.language, "Detected runtime from plan text");
            return Some(runtime);
        }
    }

    warn!("Could not detect project runtime");
    None
}

/// Effective sandbox limits: the global verification config with any
/// per-project overrides applied.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub timeout_install: u64,
    pub timeout_build: u64,
    pub timeout_test: u64,
    pub timeout_lint: u64,
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub pids_limit: i64,
    pub tmpfs_size: String,
    pub network_install: bool,
    pub docker_host: Option<String>,
}

impl SandboxSettings {
    pub fn from_config(
        config: &VerificationConfig,
        overrides: &HashMap<String, JsonValue>,
    ) -> Self {
        let u64_override = |key: &str, default: u64| {
            overrides.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
        };
        let string_override = |key: &str, default: &str| {
            overrides
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            timeout_install: u64_override("timeout_install", config.timeout_install),
            timeout_build: u64_override("timeout_build", config.timeout_build),
            timeout_test: u64_override("timeout_test", config.timeout_test),
            timeout_lint: u64_override("timeout_lint", config.timeout_lint),
            memory_limit: string_override("memory_limit", &config.memory_limit),
            cpu_limit: overrides
                .get("cpu_limit")
                .and_then(|v| v.as_f64())
                .unwrap_or(config.cpu_limit),
            pids_limit: config.pids_limit,
            tmpfs_size: string_override("tmpfs_size", &config.tmpfs_size),
            network_install: config.network_install,
            docker_host: config.docker_host.clone(),
        }
    }
}

/// Live progress notification: (phase name, result so far).
pub type PhaseSender = mpsc::UnboundedSender<(String, PhaseResult)>;

/// Runs verification phases in ephemeral containers.
pub struct SandboxExecutor {
    /// Serializes image pulls so concurrent project sandboxes don't race
    /// the same download.
    pull_lock: tokio::sync::Mutex<()>,
}

impl Default for SandboxExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxExecutor {
    pub fn new() -> Self {
        Self { pull_lock: tokio::sync::Mutex::new(()) }
    }

    async fn connect(&self, settings: &SandboxSettings) -> Result<Docker, TumblerError> {
        let docker_host = settings
            .docker_host
            .clone()
            .or_else(|| std::env::var("DOCKER_HOST").ok());
        let docker = match docker_host {
            Some(host) if !host.is_empty() => {
                Docker::connect_with_http(&host, 30, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| TumblerError::SandboxUnavailable(e.to_string()))?
            }
            _ => Docker::connect_with_socket_defaults()
                .map_err(|e| TumblerError::SandboxUnavailable(e.to_string()))?,
        };
        docker
            .ping()
            .await
            .map_err(|e| TumblerError::SandboxUnavailable(format!("container proxy ping: {e}")))?;
        Ok(docker)
    }

    async fn ensure_image(&self, docker: &Docker, image: &str) -> Result<(), TumblerError> {
        if docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image already available");
            return Ok(());
        }
        let _guard = self.pull_lock.lock().await;
        // Another project may have pulled it while we waited.
        if docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(image, "Pulling sandbox image");
        let mut pull = docker.create_image(
            Some(CreateImageOptions { from_image: image, ..Default::default() }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| {
                TumblerError::SandboxUnavailable(format!("image pull '{image}': {e}"))
            })?;
        }
        info!(image, "Image pulled");
        Ok(())
    }

    /// Startup connectivity probe against the configured container proxy.
    pub async fn startup_check(&self, config: &VerificationConfig) -> Result<(), TumblerError> {
        let settings = SandboxSettings::from_config(config, &HashMap::new());
        self.connect(&settings).await.map(|_| ())
    }

    /// Run the full verification pipeline over the workspace.
    ///
    /// Phase ordering: install (restricted egress) → build (no network,
    /// skipped when install failed) → test ∥ lint (no network). Every phase
    /// outcome is sent over `phase_tx` as it completes.
    pub async fn run(
        &self,
        workspace: &Path,
        plan: &str,
        strategy: &PlanStrategy,
        settings: &SandboxSettings,
        phase_tx: Option<PhaseSender>,
    ) -> Result<SandboxResult, TumblerError> {
        let Some(runtime) = detect_runtime(plan, workspace) else {
            return Ok(SandboxResult::review_only("runtime not detected"));
        };

        let docker = self.connect(settings).await?;
        self.ensure_image(&docker, runtime.image).await?;

        // Plan commands override runtime defaults; lint always uses the
        // runtime's own linter.
        let install_cmds = pick(&strategy.install, &runtime.install_commands);
        let build_cmds = pick(&strategy.build, &runtime.build_commands);
        let test_cmds = pick(&strategy.test, &runtime.test_commands);
        let lint_cmds = runtime.lint_commands.clone();

        let notify = |phase: &str, result: &PhaseResult| {
            if let Some(tx) = &phase_tx {
                let _ = tx.send((phase.to_string(), result.clone()));
            }
        };

        let mut errors = Vec::new();

        // --- install: the only networked phase; dependencies installed in
        // the container are pulled back so later phases see them.
        let install = if install_cmds.is_empty() {
            PhaseResult::skipped(Vec::new())
        } else {
            let network = if settings.network_install { "bridge" } else { "none" };
            self.run_phase(
                &docker,
                runtime.image,
                &install_cmds,
                workspace,
                settings,
                settings.timeout_install,
                network,
                "install",
                true,
            )
            .await
        };
        match install.status {
            PhaseStatus::Timeout => {
                errors.push(format!("Install timed out after {}s", settings.timeout_install))
            }
            PhaseStatus::Failed => {
                errors.push(format!("Install failed with exit code {}", install.exit_code))
            }
            _ => {}
        }
        notify("install", &install);

        // --- build: skipped when install failed.
        let build = if build_cmds.is_empty() || !install.ok() {
            PhaseResult::skipped(build_cmds.clone())
        } else {
            self.run_phase(
                &docker,
                runtime.image,
                &build_cmds,
                workspace,
                settings,
                settings.timeout_build,
                "none",
                "build",
                false,
            )
            .await
        };
        match build.status {
            PhaseStatus::Timeout => {
                errors.push(format!("Build timed out after {}s", settings.timeout_build))
            }
            PhaseStatus::Failed => {
                errors.push(format!("Build failed with exit code {}", build.exit_code))
            }
            _ => {}
        }
        notify("build", &build);

        // --- test ∥ lint: separate containers, no shared state. Lint runs
        // regardless of earlier phases; test needs a successful build.
        let can_test = install.ok() && build.ok() && !test_cmds.is_empty();
        let test_fut = async {
            if can_test {
                self.run_phase(
                    &docker,
                    runtime.image,
                    &test_cmds,
                    workspace,
                    settings,
                    settings.timeout_test,
                    "none",
                    "test",
                    false,
                )
                .await
            } else {
                PhaseResult::skipped(test_cmds.clone())
            }
        };
        let lint_fut = async {
            if lint_cmds.is_empty() {
                PhaseResult::skipped(Vec::new())
            } else {
                self.run_phase(
                    &docker,
                    runtime.image,
                    &lint_cmds,
                    workspace,
                    settings,
                    settings.timeout_lint,
                    "none",
                    "lint",
                    false,
                )
                .await
            }
        };
        let (test, lint) = tokio::join!(test_fut, lint_fut);

        if test.status == PhaseStatus::Timeout {
            errors.push(format!("Tests timed out after {}s", settings.timeout_test));
        }
        notify("test", &test);
        notify("lint", &lint);

        let test_counts = crate::scoring::parse_test_counts(&test.combined_output());
        let lint_issues = crate::scoring::count_lint_issues(&lint.combined_output());

        Ok(SandboxResult {
            install,
            build,
            test,
            lint,
            test_counts,
            lint_issues,
            errors,
            code_review_only: false,
        })
    }

    /// One phase in one ephemeral container: create → upload tar → start →
    /// wait (bounded) → collect logs → remove. The removal runs on every
    /// exit path via a drop guard.
    #[allow(clippy::too_many_arguments)]
    async fn run_phase(
        &self,
        docker: &Docker,
        image: &str,
        commands: &[String],
        workspace: &Path,
        settings: &SandboxSettings,
        timeout_secs: u64,
        network_mode: &str,
        label: &str,
        extract_workspace: bool,
    ) -> PhaseResult {
        let started = Instant::now();
        let commands = commands.to_vec();
        let fail = |message: String, started: Instant, commands: &[String]| PhaseResult {
            status: PhaseStatus::Failed,
            stdout: String::new(),
            stderr: message,
            exit_code: -1,
            duration_s: started.elapsed().as_secs_f64(),
            commands: commands.to_vec(),
        };

        let tar_bytes = match archive::build_tar(workspace) {
            Ok(bytes) => bytes,
            Err(e) => return fail(format!("workspace archive failed: {e}"), started, &commands),
        };

        let mut script = String::from("#!/bin/sh\nset -e\ncd /workspace\n");
        for cmd in &commands {
            script.push_str(&format!("echo '=== RUNNING: {cmd} ==='\n{cmd}\n"));
        }

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), format!("size={}", settings.tmpfs_size));
        tmpfs.insert("/root".to_string(), "size=64m".to_string());

        let host_config = HostConfig {
            memory: parse_byte_size(&settings.memory_limit),
            nano_cpus: Some((settings.cpu_limit * 1e9) as i64),
            pids_limit: Some(settings.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            tmpfs: Some(tmpfs),
            network_mode: Some(network_mode.to_string()),
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert("code-tumbler.role".to_string(), "sandbox".to_string());
        labels.insert("code-tumbler.phase".to_string(), label.to_string());

        let name = format!("tumbler-{label}-{}", uuid::Uuid::new_v4().simple());
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
            working_dir: Some("/workspace".to_string()),
            host_config: Some(host_config),
            labels: Some(labels),
            ..Default::default()
        };

        if let Err(e) = docker
            .create_container(Some(CreateContainerOptions { name: name.as_str(), platform: None }), config)
            .await
        {
            return fail(format!("container create failed: {e}"), started, &commands);
        }

        // From here on the container exists; the guard tears it down on
        // every exit path, including cancellation and panic.
        let guard = ContainerGuard { docker: docker.clone(), name: name.clone() };

        let result = self
            .execute_phase(
                docker,
                &name,
                tar_bytes,
                workspace,
                timeout_secs,
                label,
                extract_workspace,
                started,
                &commands,
            )
            .await;
        drop(guard);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_phase(
        &self,
        docker: &Docker,
        name: &str,
        tar_bytes: Vec<u8>,
        workspace: &Path,
        timeout_secs: u64,
        label: &str,
        extract_workspace: bool,
        started: Instant,
        commands: &[String],
    ) -> PhaseResult {
        let fail = |message: String| PhaseResult {
            status: PhaseStatus::Failed,
            stdout: String::new(),
            stderr: message,
            exit_code: -1,
            duration_s: started.elapsed().as_secs_f64(),
            commands: commands.to_vec(),
        };

        let upload_options =
            UploadToContainerOptions { path: "/workspace", ..Default::default() };
        if let Err(e) = docker.upload_to_container(name, Some(upload_options), tar_bytes.into()).await {
            return fail(format!("workspace upload failed: {e}"));
        }

        if let Err(e) = docker.start_container::<String>(name, None).await {
            return fail(format!("container start failed: {e}"));
        }

        let total_timeout = Duration::from_secs(timeout_secs * commands.len().max(1) as u64);
        let mut wait = docker.wait_container(name, None::<WaitContainerOptions<String>>);
        let exit_code = match tokio::time::timeout(total_timeout, wait.next()).await {
            Ok(Some(Ok(response))) => response.status_code,
            // A non-zero exit surfaces as an Err carrying the status code.
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(e))) => return fail(format!("container wait failed: {e}")),
            Ok(None) => return fail("container wait stream ended early".to_string()),
            Err(_) => {
                warn!(phase = label, timeout_secs, "Sandbox phase timed out");
                let _ = docker.kill_container(name, None::<KillContainerOptions<String>>).await;
                return PhaseResult {
                    status: PhaseStatus::Timeout,
                    stdout: String::new(),
                    stderr: format!("phase timed out after {timeout_secs}s"),
                    exit_code: -1,
                    duration_s: started.elapsed().as_secs_f64(),
                    commands: commands.to_vec(),
                };
            }
        };

        let stdout = collect_logs(docker, name, true, false).await;
        let stderr = collect_logs(docker, name, false, true).await;
        let duration_s = started.elapsed().as_secs_f64();
        info!(
            phase = label,
            exit_code,
            duration_s,
            stdout_len = stdout.len(),
            "Sandbox phase finished"
        );

        if extract_workspace && exit_code == 0 {
            match self.download_workspace(docker, name).await {
                Ok(bytes) => match archive::unpack_container_tar(&bytes, workspace) {
                    Ok(written) => debug!(written, "Extracted workspace from container"),
                    Err(e) => warn!("Failed to unpack container workspace: {e}"),
                },
                Err(e) => warn!("Failed to download container workspace: {e}"),
            }
        }

        PhaseResult {
            status: if exit_code == 0 { PhaseStatus::Success } else { PhaseStatus::Failed },
            stdout: cap_output(&stdout, MAX_CAPTURED_OUTPUT),
            stderr: cap_output(&stderr, MAX_CAPTURED_OUTPUT),
            exit_code,
            duration_s,
            commands: commands.to_vec(),
        }
    }

    async fn download_workspace(&self, docker: &Docker, name: &str) -> anyhow::Result<Vec<u8>> {
        let mut stream = docker.download_from_container(
            name,
            Some(DownloadFromContainerOptions { path: "/workspace" }),
        );
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes)
    }
}

fn pick(from_plan: &[String], defaults: &[String]) -> Vec<String> {
    if from_plan.is_empty() {
        defaults.to_vec()
    } else {
        from_plan.to_vec()
    }
}

async fn collect_logs(docker: &Docker, name: &str, stdout: bool, stderr: bool) -> String {
    let mut stream = docker.logs(
        name,
        Some(LogsOptions::<String> { stdout, stderr, ..Default::default() }),
    );
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(log) => out.push_str(&String::from_utf8_lossy(&log.into_bytes())),
            Err(e) => {
                debug!("Log read ended: {e}");
                break;
            }
        }
    }
    out
}

/// Removes the container on drop, so teardown happens on success, error,
/// timeout, cancellation, and panic alike.
struct ContainerGuard {
    docker: Docker,
    name: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let options = RemoveContainerOptions { force: true, ..Default::default() };
            if let Err(e) = docker.remove_container(&name, Some(options)).await {
                warn!(container = %name, "Failed to remove sandbox container: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_detection_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "pytest\n").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        // package.json outranks both when present.
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();

        let runtime = detect_runtime("", dir.path()).unwrap();
        assert_eq!(runtime.language, "javascript");
        assert_eq!(runtime.image, "node:20-slim");
    }

    #[test]
    fn test_plan_text_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = detect_runtime("We will build a FastAPI service with pytest.", dir.path());
        assert_eq!(runtime.unwrap().language, "python");

        let runtime = detect_runtime("a golang worker", dir.path());
        assert_eq!(runtime.unwrap().language, "go");

        assert!(detect_runtime("a COBOL batch job", dir.path()).is_none());
    }

    #[test]
    fn test_settings_overrides_applied() {
        let config = VerificationConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert("timeout_install".to_string(), serde_json::json!(600));
        overrides.insert("memory_limit".to_string(), serde_json::json!("2g"));
        overrides.insert("cpu_limit".to_string(), serde_json::json!(1.5));

        let settings = SandboxSettings::from_config(&config, &overrides);
        assert_eq!(settings.timeout_install, 600);
        assert_eq!(settings.memory_limit, "2g");
        assert!((settings.cpu_limit - 1.5).abs() < 1e-9);
        // Untouched fields keep global defaults.
        assert_eq!(settings.timeout_test, 120);
        assert_eq!(settings.pids_limit, 256);
    }

    #[test]
    fn test_plan_commands_override_defaults_lint_never() {
        let plan_cmds = vec!["pip install -r requirements.txt -r dev.txt".to_string()];
        let defaults = vec!["pip install -r requirements.txt".to_string()];
        assert_eq!(pick(&plan_cmds, &defaults), plan_cmds);
        assert_eq!(pick(&[], &defaults), defaults);
    }

    #[test]
    fn test_phase_result_ok_semantics() {
        assert!(PhaseResult::default().ok()); // skipped
        let success = PhaseResult { status: PhaseStatus::Success, ..Default::default() };
        assert!(success.ok());
        let failed =
            PhaseResult { status: PhaseStatus::Failed, exit_code: 1, ..Default::default() };
        assert!(!failed.ok());
        let timeout = PhaseResult { status: PhaseStatus::Timeout, ..Default::default() };
        assert!(!timeout.ok());
    }

    #[test]
    fn test_review_only_result() {
        let result = SandboxResult::review_only("runtime not detected");
        assert!(result.code_review_only);
        assert_eq!(result.install.status, PhaseStatus::Skipped);
        assert_eq!(result.errors, vec!["runtime not detected"]);
    }
}
