//! Shared streaming execution for all three agent roles.
//!
//! The runner owns the whole lifecycle of one LLM call: marker handling,
//! streaming with chunk batching into bus events, degenerate-output
//! detection, cooperative cancellation, and persistence of the final text
//! and usage record. Cancelled calls persist nothing.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::compression::{prepare_content, CompressionConfig, TextTransform};
use crate::errors::TumblerError;
use crate::events::{
    AgentThinkingData, ConversationChunkData, ConversationUpdateData, EventBus, EventType,
    UsageUpdateData,
};
use crate::providers::{ChatMessage, ChatOptions, ProviderHandle, StreamEvent, TokenUsage};
use crate::state::{ConversationMessage, StateStore, UsageRecord};

use super::AgentKind;

/// Flush the chunk buffer to the bus at whichever comes first.
const CHUNK_FLUSH_CHARS: usize = 200;
const CHUNK_FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Rolling tail window checked for repetitive garbage.
const DEGENERATE_TAIL_CHARS: usize = 400;
const DEGENERATE_CHECK_EVERY: usize = 200;

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub text: String,
    pub usage: TokenUsage,
    pub cost: f64,
}

pub struct AgentCall<'a> {
    pub agent: AgentKind,
    pub project: &'a str,
    pub project_root: &'a Path,
    pub iteration: u32,
    /// Conversation metadata label for the persisted output ("Architectural
    /// Plan", "Code Generation", ...).
    pub label: &'a str,
}

pub struct AgentRunner {
    bus: Arc<EventBus>,
    store: Arc<StateStore>,
    transform: Arc<dyn TextTransform>,
}

impl AgentRunner {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<StateStore>,
        transform: Arc<dyn TextTransform>,
    ) -> Self {
        Self { bus, store, transform }
    }

    /// Execute one streaming agent call to completion or cancellation.
    ///
    /// On success the full text is persisted as a ConversationMessage, a
    /// UsageRecord is appended, and `conversation_update` (which clears any
    /// thinking indicator) plus `usage_update` are published. On
    /// cancellation the partial output is discarded and nothing persists.
    pub async fn run(
        &self,
        call: &AgentCall<'_>,
        handle: &ProviderHandle,
        messages: Vec<ChatMessage>,
        compression: &CompressionConfig,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, TumblerError> {
        let agent = call.agent.as_str();

        // Marker handling happens here so role modules can build messages
        // with <compress> sections freely.
        let mut prepared = Vec::with_capacity(messages.len());
        let mut input_chars = 0usize;
        for msg in messages {
            let (content, _metrics) = prepare_content(&msg.content, compression, &*self.transform);
            input_chars += content.len();
            prepared.push(ChatMessage { role: msg.role, content });
        }

        let options = ChatOptions {
            temperature: Some(0.3),
            max_tokens: handle
                .settings
                .max_tokens
                .or(Some(call.agent.default_max_tokens())),
        };

        self.bus
            .publish(
                EventType::AgentThinking,
                AgentThinkingData { project: call.project.to_string(), agent: agent.to_string() },
            )
            .await;

        info!(project = call.project, agent, provider = %handle.id, "Agent call started");
        let mut stream = handle
            .provider
            .stream_chat(&prepared, &options)
            .await
            .map_err(|e| classify_provider_error(agent, e))?;

        let mut text = String::new();
        let mut usage = TokenUsage::default();
        let mut chunk_buf = String::new();
        let mut last_flush = Instant::now();
        let mut fragments = 0usize;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the stream aborts the HTTP request; partial
                    // output is deliberately not persisted.
                    info!(project = call.project, agent, "Agent call cancelled, discarding partial output");
                    return Err(TumblerError::Internal("cancelled".to_string()));
                }
                event = stream.next() => event,
            };
            match event {
                Some(Ok(StreamEvent::Content(fragment))) => {
                    text.push_str(&fragment);
                    chunk_buf.push_str(&fragment);
                    fragments += 1;

                    if chunk_buf.len() >= CHUNK_FLUSH_CHARS
                        || last_flush.elapsed() >= CHUNK_FLUSH_INTERVAL
                    {
                        self.flush_chunk(call.project, agent, &mut chunk_buf).await;
                        last_flush = Instant::now();
                    }

                    if fragments % DEGENERATE_CHECK_EVERY == 0
                        && text.len() > 500
                        && is_degenerate_tail(tail(&text, DEGENERATE_TAIL_CHARS))
                    {
                        warn!(
                            project = call.project,
                            agent,
                            chars = text.len(),
                            "Degenerate repetitive output detected, aborting generation"
                        );
                        return Err(TumblerError::agent_error(
                            agent,
                            format!(
                                "model output degenerated into a repeating pattern after {} chars",
                                text.len()
                            ),
                            true,
                        ));
                    }
                }
                Some(Ok(StreamEvent::Usage(frame))) => usage.merge(frame),
                Some(Err(e)) => return Err(classify_provider_error(agent, e)),
                None => break,
            }
        }
        self.flush_chunk(call.project, agent, &mut chunk_buf).await;

        let text = strip_eos_artifacts(&text);
        if usage == TokenUsage::default() {
            // Local servers often omit usage frames; a chars/4 estimate
            // keeps the cost ledger moving.
            usage = TokenUsage {
                input_tokens: (input_chars / 4) as u64,
                output_tokens: (text.len() / 4) as u64,
            };
        }
        let cost = handle.cost_for(&usage);

        self.store
            .append_conversation(
                call.project_root,
                &ConversationMessage::new(agent, "output", call.iteration, text.clone())
                    .with_metadata(serde_json::json!({"label": call.label})),
            )
            .map_err(|e| TumblerError::Internal(format!("conversation append: {e}")))?;
        let ledger = self
            .store
            .append_usage(
                call.project_root,
                UsageRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    project: call.project.to_string(),
                    agent: agent.to_string(),
                    iteration: call.iteration,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cost,
                    provider: handle.id.clone(),
                },
            )
            .map_err(|e| TumblerError::Internal(format!("usage append: {e}")))?;

        self.bus
            .publish(
                EventType::ConversationUpdate,
                ConversationUpdateData {
                    project: call.project.to_string(),
                    agent: agent.to_string(),
                },
            )
            .await;
        self.bus
            .publish(
                EventType::UsageUpdate,
                UsageUpdateData {
                    project: call.project.to_string(),
                    agent: agent.to_string(),
                    iteration: call.iteration,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cost,
                    total_cost: ledger.total_cost,
                },
            )
            .await;

        info!(
            project = call.project,
            agent,
            chars = text.len(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Agent call finished"
        );
        Ok(AgentOutcome { text, usage, cost })
    }

    async fn flush_chunk(&self, project: &str, agent: &str, buf: &mut String) {
        if buf.is_empty() {
            return;
        }
        let chunk = std::mem::take(buf);
        self.bus
            .publish(
                EventType::ConversationChunk,
                ConversationChunkData {
                    project: project.to_string(),
                    agent: agent.to_string(),
                    chunk,
                },
            )
            .await;
    }
}

fn classify_provider_error(agent: &str, err: anyhow::Error) -> TumblerError {
    let retryable = err
        .downcast_ref::<crate::providers::ProviderError>()
        .map(|p| p.is_retryable())
        .unwrap_or(false);
    TumblerError::agent_error(agent, err, retryable)
}

fn tail(s: &str, max_chars: usize) -> &str {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s;
    }
    let skip = char_count - max_chars;
    let byte_start = s.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &s[byte_start..]
}

/// Detects a short pattern (2–20 chars) repeated at least 10 times at the
/// end of the output, the signature of a model stuck in a loop.
fn is_degenerate_tail(tail: &str) -> bool {
    const REPEATS: usize = 10;
    for pattern_len in 2..=20 {
        let window = pattern_len * REPEATS;
        if tail.len() < window {
            break;
        }
        let Some(pattern_start) = tail.len().checked_sub(pattern_len) else { continue };
        if !tail.is_char_boundary(pattern_start) || !tail.is_char_boundary(tail.len() - window) {
            continue;
        }
        let pattern = &tail[pattern_start..];
        let segment = &tail[tail.len() - window..];
        if segment.as_bytes().chunks(pattern_len).all(|chunk| chunk == pattern.as_bytes()) {
            return true;
        }
    }
    false
}

/// Remove end-of-sequence artifacts some local models leak into the text.
fn strip_eos_artifacts(text: &str) -> String {
    let re = regex::Regex::new(r"(?s)<\|endoftext\|>.*|<\|im_end\|>.*|<\|eot_id\|>.*")
        .expect("static regex");
    re.replace(text, "").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_detection_catches_repetition() {
        let garbage = "intro text ".to_string() + &"gYGB".repeat(120);
        assert!(is_degenerate_tail(tail(&garbage, DEGENERATE_TAIL_CHARS)));
    }

    #[test]
    fn test_degenerate_detection_passes_real_code() {
        let code = r#"
def factorial(n):
    if n <= 1:
        return 1
    return n * factorial(n - 1)

def test_factorial():
    assert factorial(5) == 120
"#
        .repeat(4);
        assert!(!is_degenerate_tail(tail(&code, DEGENERATE_TAIL_CHARS)));
    }

    #[test]
    fn test_short_output_never_degenerate() {
        assert!(!is_degenerate_tail("abababab"));
    }

    #[test]
    fn test_eos_artifacts_stripped() {
        assert_eq!(strip_eos_artifacts("plan text<|im_end|>\ngarbage"), "plan text");
        assert_eq!(strip_eos_artifacts("done<|endoftext|>"), "done");
        assert_eq!(strip_eos_artifacts("clean output"), "clean output");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let s = "日".repeat(300);
        let t = tail(&s, 100);
        assert_eq!(t.chars().count(), 100);
    }
}
