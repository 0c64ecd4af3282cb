//! Progress events streamed to external consumers.
//!
//! Every state transition, stream chunk, and sandbox phase result is
//! published here. The envelope shape (`{type, timestamp, data}`) is also
//! the wire format when projected over SSE by an external façade.

mod bus;

pub use bus::{EventBus, SubscriptionFilter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PhaseChange,
    IterationUpdate,
    AgentThinking,
    ConversationChunk,
    ConversationUpdate,
    SandboxStart,
    SandboxPhase,
    ScoreUpdate,
    UsageUpdate,
    ProjectComplete,
    ProjectFailed,
    Log,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PhaseChange => "phase_change",
            EventType::IterationUpdate => "iteration_update",
            EventType::AgentThinking => "agent_thinking",
            EventType::ConversationChunk => "conversation_chunk",
            EventType::ConversationUpdate => "conversation_update",
            EventType::SandboxStart => "sandbox_start",
            EventType::SandboxPhase => "sandbox_phase",
            EventType::ScoreUpdate => "score_update",
            EventType::UsageUpdate => "usage_update",
            EventType::ProjectComplete => "project_complete",
            EventType::ProjectFailed => "project_failed",
            EventType::Log => "log",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "phase_change" => Some(EventType::PhaseChange),
            "iteration_update" => Some(EventType::IterationUpdate),
            "agent_thinking" => Some(EventType::AgentThinking),
            "conversation_chunk" => Some(EventType::ConversationChunk),
            "conversation_update" => Some(EventType::ConversationUpdate),
            "sandbox_start" => Some(EventType::SandboxStart),
            "sandbox_phase" => Some(EventType::SandboxPhase),
            "score_update" => Some(EventType::ScoreUpdate),
            "usage_update" => Some(EventType::UsageUpdate),
            "project_complete" => Some(EventType::ProjectComplete),
            "project_failed" => Some(EventType::ProjectFailed),
            "log" => Some(EventType::Log),
        _ => None,
        }
    }

    /// Terminal events carry loop-order guarantees: delivered in publish
    /// order per project, never silently dropped for a live subscriber.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::PhaseChange
                | EventType::ScoreUpdate
                | EventType::ProjectComplete
                | EventType::ProjectFailed
        )
    }

    /// High-frequency events that a slow subscriber may lose.
    pub fn is_lossy(&self) -> bool {
        matches!(self, EventType::ConversationChunk)
    }
}

/// Envelope published on the bus and projected to external consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: JsonValue,
}

impl Event {
    pub fn new<T: Serialize>(event_type: EventType, data: T) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data: serde_json::to_value(data).unwrap_or(JsonValue::Null),
        }
    }

    /// Project this event belongs to (all payloads carry one).
    pub fn project(&self) -> Option<&str> {
        self.data.get("project").and_then(|v| v.as_str())
    }
}

// --- Typed payloads ---------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseChangeData {
    pub project: String,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentThinkingData {
    pub project: String,
    pub agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationChunkData {
    pub project: String,
    pub agent: String,
    pub chunk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationUpdateData {
    pub project: String,
    pub agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPhaseData {
    pub project: String,
    pub iteration: u32,
    pub phase: String,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration_s: f64,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreUpdateData {
    pub project: String,
    pub iteration: u32,
    pub score: f64,
    pub phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageUpdateData {
    pub project: String,
    pub agent: String,
    pub iteration: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectCompleteData {
    pub project: String,
    pub score: f64,
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFailedData {
    pub project: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogData {
    pub project: String,
    pub message: String,
    pub level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip() {
        for event_type in [
            EventType::PhaseChange,
            EventType::ConversationChunk,
            EventType::SandboxPhase,
            EventType::ScoreUpdate,
            EventType::ProjectComplete,
            EventType::ProjectFailed,
            EventType::Log,
        ] {
            assert_eq!(EventType::from_str(event_type.as_str()), Some(event_type));
        }
        assert_eq!(EventType::from_str("nonsense"), None);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(EventType::PhaseChange.is_terminal());
        assert!(EventType::ScoreUpdate.is_terminal());
        assert!(EventType::ProjectComplete.is_terminal());
        assert!(EventType::ProjectFailed.is_terminal());
        assert!(!EventType::ConversationChunk.is_terminal());
        assert!(EventType::ConversationChunk.is_lossy());
        assert!(!EventType::Log.is_lossy());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let event = Event::new(
            EventType::ScoreUpdate,
            ScoreUpdateData {
                project: "demo".into(),
                iteration: 1,
                score: 8.5,
                phase: "verifying".into(),
            },
        );
        assert_eq!(event.project(), Some("demo"));
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "score_update");
        assert_eq!(wire["data"]["score"], 8.5);
        assert!(wire["timestamp"].is_string());
    }
}
