//! Streaming chat providers.
//!
//! Each agent call goes through the [`ChatProvider`] trait: a finite lazy
//! stream of [`StreamEvent`]s with explicit end-of-stream. Three concrete
//! implementations cover the supported backends: OpenAI-compatible HTTP
//! (OpenAI, vLLM, Ollama, LM Studio and friends), Anthropic, and Gemini.

mod anthropic;
mod error;
mod google_genai;
mod openai_compatible;

pub use anthropic::AnthropicProvider;
pub use error::{ProviderError, ProviderErrorKind};
pub use google_genai::GoogleGenAiProvider;
pub use openai_compatible::OpenAiCompatibleProvider;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tracing::warn;

use crate::config::{ProviderKind, ProviderSettings};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Providers report usage piecewise over the stream (e.g. input counts
    /// at message start, output counts at message end); merge keeps the
    /// largest seen value per field.
    pub fn merge(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
    }
}

/// One element of a provider's output stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text fragment of the assistant response.
    Content(String),
    /// Token accounting, possibly partial; see [`TokenUsage::merge`].
    Usage(TokenUsage),
}

pub type EventStream = BoxStream<'static, anyhow::Result<StreamEvent>>;

/// A streaming chat backend. One instance per resolved provider id.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Open a streaming completion. The stream is finite; dropping it
    /// cancels the underlying request.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<EventStream>;
}

/// A built provider together with the settings it was built from (the
/// runner needs model name, costs, and capability flags).
#[derive(Clone)]
pub struct ProviderHandle {
    pub id: String,
    pub settings: ProviderSettings,
    pub provider: Arc<dyn ChatProvider>,
}

impl ProviderHandle {
    pub fn cost_for(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1000.0) * self.settings.cost_per_1k_input_tokens
            + (usage.output_tokens as f64 / 1000.0) * self.settings.cost_per_1k_output_tokens
    }
}

/// Builds providers on demand and caches them per id. The factory is the
/// only place that resolves API keys from the environment.
pub struct ProviderRegistry {
    settings: HashMap<String, ProviderSettings>,
    built: std::sync::Mutex<HashMap<String, ProviderHandle>>,
}

impl ProviderRegistry {
    pub fn new(settings: HashMap<String, ProviderSettings>) -> Self {
        Self { settings, built: std::sync::Mutex::new(HashMap::new()) }
    }

    /// Pre-seed a built provider, bypassing the factory. Tests use this to
    /// inject scripted providers.
    #[cfg(test)]
    pub fn insert_for_tests(&self, id: &str, handle: ProviderHandle) {
        self.built.lock().expect("registry lock").insert(id.to_string(), handle);
    }

    pub fn get(&self, id: &str) -> anyhow::Result<ProviderHandle> {
        if let Some(handle) = self.built.lock().expect("registry lock").get(id) {
            return Ok(handle.clone());
        }
        let settings = self
            .settings
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("unknown provider '{id}'"))?
            .clone();
        let provider = build_provider(&settings)?;
        let handle = ProviderHandle { id: id.to_string(), settings, provider };
        self.built
            .lock()
            .expect("registry lock")
            .insert(id.to_string(), handle.clone());
        Ok(handle)
    }
}

fn build_provider(settings: &ProviderSettings) -> anyhow::Result<Arc<dyn ChatProvider>> {
    let timeout = Duration::from_secs(settings.timeout_secs);
    let api_key = settings.resolve_api_key();
    Ok(match settings.kind {
        ProviderKind::Openai | ProviderKind::Vllm | ProviderKind::Ollama => {
            let base_url = settings
                .base_url
                .clone()
                .unwrap_or_else(|| default_base_url(settings.kind).to_string());
            Arc::new(OpenAiCompatibleProvider::new(
                &base_url,
                &api_key,
                &settings.model,
                timeout,
            )?)
        }
        ProviderKind::Anthropic => {
            Arc::new(AnthropicProvider::new(&api_key, &settings.model, settings.max_tokens, timeout))
        }
        ProviderKind::Gemini => {
            Arc::new(GoogleGenAiProvider::new(&api_key, &settings.model, timeout))
        }
    })
}

fn default_base_url(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Openai => "https://api.openai.com/v1",
        ProviderKind::Vllm => "http://localhost:8000/v1",
        ProviderKind::Ollama => "http://localhost:11434/v1",
        // Native-API providers carry their endpoint internally.
        ProviderKind::Anthropic | ProviderKind::Gemini => "",
    }
}

/// Validate a base URL before building a provider.
/// HTTPS is required for remote hosts so API keys are never sent in the
/// clear; plain HTTP is allowed only for localhost LLM servers.
pub(crate) fn validate_base_url(base_url: &str) -> anyhow::Result<()> {
    let parsed = reqwest::Url::parse(base_url)
        .map_err(|e| anyhow::anyhow!("invalid base_url '{base_url}': {e}"))?;
    let host = parsed.host_str().unwrap_or("");
    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let is_localhost =
                host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1";
            if is_localhost {
                warn!(base_url, "Using unencrypted HTTP for a local LLM server");
                Ok(())
            } else {
                anyhow::bail!(
                    "HTTP is only permitted for localhost (base_url: '{base_url}'); use HTTPS"
                )
            }
        }
        other => anyhow::bail!("unsupported URL scheme '{other}' in base_url '{base_url}'"),
    }
}

pub(crate) fn build_http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))
}

/// Outcome of parsing one SSE `data:` payload.
pub(crate) enum SseItem {
    Event(StreamEvent),
    Done,
}

/// Turn an SSE response body into a stream of [`StreamEvent`]s.
///
/// `parse` receives each `data:` payload; other SSE fields (`event:`,
/// comments, blank lines) are skipped. The stream ends at the provider's
/// done sentinel or at connection close.
pub(crate) fn sse_event_stream(
    response: reqwest::Response,
    parse: fn(&str) -> Option<SseItem>,
) -> EventStream {
    struct State {
        bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
        buf: String,
        pending: VecDeque<StreamEvent>,
        done: bool,
    }

    let state = State {
        bytes: response.bytes_stream().boxed(),
        buf: String::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    st.buf.push_str(&String::from_utf8_lossy(&chunk));
                    while let Some(pos) = st.buf.find('\n') {
                        let line: String = st.buf.drain(..=pos).collect();
                        let line = line.trim_end();
                        if let Some(payload) = line.strip_prefix("data:") {
                            match parse(payload.trim()) {
                                Some(SseItem::Done) => st.done = true,
                                Some(SseItem::Event(event)) => st.pending.push_back(event),
                                None => {}
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(ProviderError::network(&e).into()), st));
                }
                None => st.done = true,
            }
        }
    })
    .boxed()
}
