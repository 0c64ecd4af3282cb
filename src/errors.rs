use std::fmt;

/// Classified orchestration error — tells the caller *why* an operation
/// failed so it can pick the right recovery strategy.
#[derive(Debug)]
pub enum TumblerError {
    /// Bad inputs: name already exists, unknown project, malformed state.
    /// Recoverable by the caller.
    InvalidRequest(String),
    /// A path resolved outside the owning project root. Fatal to the
    /// operation; state is left untouched.
    PathEscape { path: String, root: String },
    /// Container proxy unreachable or image pull failed. Triggers
    /// code-review-only verification; not fatal to the project.
    SandboxUnavailable(String),
    /// A sandbox phase exceeded its timeout. Treated as a failed phase
    /// result, not a loop failure.
    SandboxTimeout { phase: String, timeout_secs: u64 },
    /// The LLM call failed or returned unparseable output.
    AgentError { agent: String, message: String, retryable: bool },
    /// Per-project cost cap hit.
    BudgetExceeded { spent: f64, cap: f64 },
    /// Max iterations reached without convergence.
    IterationCap { iterations: u32 },
    /// The running-project pool is full. Returned synchronously from start.
    AtCapacity { limit: usize },
    /// Anything unexpected.
    Internal(String),
}

impl TumblerError {
    /// Short machine-readable reason stored in `state.error` and carried by
    /// `project_failed` events.
    pub fn failure_reason(&self) -> String {
        match self {
            TumblerError::InvalidRequest(msg) => format!("invalid_request: {msg}"),
            TumblerError::PathEscape { path, root } => {
                format!("path_escape: '{path}' resolves outside '{root}'")
            }
            TumblerError::SandboxUnavailable(msg) => format!("sandbox_unavailable: {msg}"),
            TumblerError::SandboxTimeout { phase, timeout_secs } => {
                format!("sandbox_timeout: {phase} phase exceeded {timeout_secs}s")
            }
            TumblerError::AgentError { agent, message, .. } => {
                format!("agent_error: {agent}: {message}")
            }
            TumblerError::BudgetExceeded { spent, cap } => {
                format!("cost_cap: ${spent:.4} >= ${cap:.2}")
            }
            TumblerError::IterationCap { iterations } => {
                format!("iteration_cap: {iterations} iterations without convergence")
            }
            TumblerError::AtCapacity { limit } => {
                format!("at_capacity: {limit} projects already running")
            }
            TumblerError::Internal(msg) => format!("internal: {msg}"),
        }
    }

    /// Whether the feedback loop may retry the current iteration after this
    /// error. Only transient agent failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TumblerError::AgentError { retryable: true, .. })
    }

    pub fn agent_error(agent: impl Into<String>, message: impl fmt::Display, retryable: bool) -> Self {
        TumblerError::AgentError {
            agent: agent.into(),
            message: message.to_string(),
            retryable,
        }
    }
}

impl fmt::Display for TumblerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.failure_reason())
    }
}

impl std::error::Error for TumblerError {}

impl From<std::io::Error> for TumblerError {
    fn from(err: std::io::Error) -> Self {
        TumblerError::Internal(format!("io: {err}"))
    }
}
