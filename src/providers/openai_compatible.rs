use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{error, info};

use super::{
    build_http_client, sse_event_stream, validate_base_url, ChatMessage, ChatOptions,
    ChatProvider, EventStream, ProviderError, SseItem, StreamEvent, TokenUsage,
};

/// Chat provider for any OpenAI-compatible `/chat/completions` endpoint:
/// OpenAI itself, vLLM, Ollama, LM Studio, llama.cpp server.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        validate_base_url(base_url)?;
        Ok(Self {
            client: build_http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn build_request_body(&self, messages: &[ChatMessage], options: &ChatOptions) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            // Ask for a final usage frame; servers that don't support the
            // option ignore it and the runner falls back to an estimate.
            "stream_options": {"include_usage": true},
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

fn parse_sse_payload(payload: &str) -> Option<SseItem> {
    if payload == "[DONE]" {
        return Some(SseItem::Done);
    }
    let data: Value = serde_json::from_str(payload).ok()?;
    if let Some(text) = data["choices"][0]["delta"]["content"].as_str() {
        if !text.is_empty() {
            return Some(SseItem::Event(StreamEvent::Content(text.to_string())));
        }
    }
    if let Some(usage) = data.get("usage").filter(|u| !u.is_null()) {
        return Some(SseItem::Event(StreamEvent::Usage(TokenUsage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        })));
    }
    None
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<EventStream> {
        let url = format!("{}/chat/completions", self.base_url);
        info!(model = %self.model, url = %url, "Opening streaming completion");

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&self.build_request_body(messages, options));
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let resp = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                error!("HTTP request failed: {}", e);
                return Err(ProviderError::network(&e).into());
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(status = %status, "Provider API error: {}", text);
            return Err(ProviderError::from_status(status.as_u16(), &text).into());
        }

        Ok(sse_event_stream(resp, parse_sse_payload))
    }
}
