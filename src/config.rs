use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Top-level daemon configuration, loaded from `config.yaml`.
///
/// Secrets never live in the file: provider API keys are named by
/// `api_key_env` and resolved from the environment at provider-build time.
/// `${VAR}` sequences in the raw YAML are interpolated from the environment
/// before parsing, so URLs for dockerized deployments can be injected.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_active_provider")]
    pub active_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    /// Global per-agent provider assignment (architect/engineer/verifier).
    #[serde(default)]
    pub agent_providers: HashMap<String, String>,
    #[serde(default)]
    pub tumbler: TumblerConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Vllm,
    Ollama,
    Openai,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Vllm => "vllm",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderSettings {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub base_url: Option<String>,
    /// Environment variable holding the API key. The key itself is resolved
    /// at provider-build time and never written back to disk or logs.
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub cost_per_1k_input_tokens: f64,
    #[serde(default)]
    pub cost_per_1k_output_tokens: f64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    pub context_length: Option<u32>,
    /// Capability flag: the provider can serve concurrent generation
    /// requests (enables parallel chunked engineering).
    #[serde(default)]
    pub supports_async: bool,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
}

impl ProviderSettings {
    /// Resolve the API key from the environment. Empty when unset — local
    /// providers (Ollama/vLLM) typically need none.
    pub fn resolve_api_key(&self) -> String {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TumblerConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Per-project wall-clock budget. Exceeding it fails the project.
    #[serde(default = "default_project_timeout")]
    pub project_timeout_secs: u64,
    #[serde(default = "default_debounce")]
    pub debounce_secs: u64,
    /// 0 disables the cost cap.
    #[serde(default)]
    pub max_cost_per_project: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_projects: usize,
    /// Retries of a failed agent call within the same iteration.
    #[serde(default = "default_agent_retries")]
    pub agent_retries: u32,
    #[serde(default = "default_shutdown_drain")]
    pub shutdown_drain_secs: u64,
}

impl Default for TumblerConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            quality_threshold: default_quality_threshold(),
            project_timeout_secs: default_project_timeout(),
            debounce_secs: default_debounce(),
            max_cost_per_project: 0.0,
            max_concurrent_projects: default_max_concurrent(),
            agent_retries: default_agent_retries(),
            shutdown_drain_secs: default_shutdown_drain(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VerificationConfig {
    #[serde(default = "default_true")]
    pub sandbox_enabled: bool,
    #[serde(default = "default_timeout_install")]
    pub timeout_install: u64,
    #[serde(default = "default_timeout_build")]
    pub timeout_build: u64,
    #[serde(default = "default_timeout_test")]
    pub timeout_test: u64,
    #[serde(default = "default_timeout_lint")]
    pub timeout_lint: u64,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
    #[serde(default = "default_true")]
    pub network_install: bool,
    /// URL of the restricted container-API proxy. Falls back to DOCKER_HOST,
    /// then the local socket.
    pub docker_host: Option<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            sandbox_enabled: true,
            timeout_install: default_timeout_install(),
            timeout_build: default_timeout_build(),
            timeout_test: default_timeout_test(),
            timeout_lint: default_timeout_lint(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            pids_limit: default_pids_limit(),
            tmpfs_size: default_tmpfs_size(),
            network_install: true,
            docker_host: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    /// Mirror database URL. None disables the write-through mirror; the
    /// JSON state files are always authoritative either way.
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self { base_path: default_base_path() }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DaemonConfig {
    /// Port for the /health probe endpoint. None disables it.
    pub health_port: Option<u16>,
}

fn default_active_provider() -> String {
    "ollama_local".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_provider_timeout() -> u64 {
    300
}
fn default_concurrency_limit() -> usize {
    4
}
fn default_max_iterations() -> u32 {
    10
}
fn default_quality_threshold() -> f64 {
    8.0
}
fn default_project_timeout() -> u64 {
    3600
}
fn default_debounce() -> u64 {
    2
}
fn default_max_concurrent() -> usize {
    2
}
fn default_agent_retries() -> u32 {
    1
}
fn default_shutdown_drain() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_timeout_install() -> u64 {
    300
}
fn default_timeout_build() -> u64 {
    300
}
fn default_timeout_test() -> u64 {
    120
}
fn default_timeout_lint() -> u64 {
    60
}
fn default_memory_limit() -> String {
    "1g".to_string()
}
fn default_cpu_limit() -> f64 {
    1.0
}
fn default_pids_limit() -> i64 {
    256
}
fn default_tmpfs_size() -> String {
    "256m".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_base_path() -> String {
    "./projects".to_string()
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config '{}': {}", path.display(), e))?;
        let interpolated = interpolate_env(&raw);
        let config: AppConfig = serde_yaml::from_str(&interpolated)
            .map_err(|e| anyhow::anyhow!("invalid config '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.providers.contains_key(&self.active_provider) {
            anyhow::bail!(
                "active_provider '{}' is not defined under providers",
                self.active_provider
            );
        }
        for (agent, provider) in &self.agent_providers {
            if !self.providers.contains_key(provider) {
                anyhow::bail!("agent_providers.{agent} references unknown provider '{provider}'");
            }
        }
        if !(0.0..=10.0).contains(&self.tumbler.quality_threshold) {
            anyhow::bail!("tumbler.quality_threshold must be within [0, 10]");
        }
        if self.tumbler.max_cost_per_project < 0.0 {
            anyhow::bail!("tumbler.max_cost_per_project must be non-negative");
        }
        Ok(())
    }

    /// Resolve which provider id an agent should use.
    ///
    /// Priority: per-project override > global agent assignment > active
    /// provider.
    pub fn resolve_agent_provider<'a>(
        &'a self,
        agent: &str,
        project_overrides: &'a HashMap<String, String>,
    ) -> &'a str {
        project_overrides
            .get(agent)
            .or_else(|| self.agent_providers.get(agent))
            .unwrap_or(&self.active_provider)
    }
}

/// Replace `${VAR}` sequences with environment values. Unset variables
/// become empty strings, matching shell semantics a deployer expects.
pub fn interpolate_env(raw: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    re.replace_all(raw, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

/// Parse a human byte size ("1g", "512m", "64k", "1024") into bytes.
pub fn parse_byte_size(s: &str) -> Option<i64> {
    let s = s.trim().to_lowercase();
    let (digits, multiplier) = match s.chars().last()? {
        'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        'm' => (&s[..s.len() - 1], 1024 * 1024),
        'k' => (&s[..s.len() - 1], 1024),
        _ => (s.as_str(), 1),
    };
    digits.parse::<i64>().ok().map(|n| n * multiplier)
}
