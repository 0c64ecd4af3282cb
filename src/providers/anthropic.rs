use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{error, info};

use super::{
    build_http_client, sse_event_stream, ChatMessage, ChatOptions, ChatProvider, EventStream,
    ProviderError, SseItem, StreamEvent, TokenUsage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The Messages API requires an explicit output ceiling.
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    default_max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: &str, max_tokens: Option<u32>, timeout: Duration) -> Self {
        Self {
            client: build_http_client(timeout).expect("reqwest client with static config"),
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            default_max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        }
    }

    /// Anthropic takes the system prompt as a top-level field, not a message.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system: Option<String> = None;
        let mut converted = Vec::new();
        for msg in messages {
            match msg.role.as_str() {
                "system" => {
                    if let Some(ref mut existing) = system {
                        existing.push_str("\n\n");
                        existing.push_str(&msg.content);
                    } else {
                        system = Some(msg.content.clone());
                    }
                }
                role => converted.push(json!({"role": role, "content": msg.content})),
            }
        }
        (system, converted)
    }

    fn build_request_body(&self, messages: &[ChatMessage], options: &ChatOptions) -> Value {
        let (system, converted) = Self::convert_messages(messages);
        let mut body = json!({
            "model": self.model,
            "max_tokens": options.max_tokens.unwrap_or(self.default_max_tokens),
            "messages": converted,
            "stream": true,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

fn parse_sse_payload(payload: &str) -> Option<SseItem> {
    let data: Value = serde_json::from_str(payload).ok()?;
    match data["type"].as_str()? {
        "content_block_delta" => {
            let text = data["delta"]["text"].as_str()?;
            Some(SseItem::Event(StreamEvent::Content(text.to_string())))
        }
        // Input tokens arrive up front, output tokens at the end; the
        // runner merges the partial frames.
        "message_start" => Some(SseItem::Event(StreamEvent::Usage(TokenUsage {
            input_tokens: data["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: 0,
        }))),
        "message_delta" => Some(SseItem::Event(StreamEvent::Usage(TokenUsage {
            input_tokens: 0,
            output_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0),
        }))),
        "message_stop" => Some(SseItem::Done),
        _ => None,
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<EventStream> {
        let url = format!("{}/messages", self.base_url);
        info!(model = %self.model, "Opening Anthropic streaming completion");

        let resp = match self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&self.build_request_body(messages, options))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("Anthropic HTTP request failed: {}", e);
                return Err(ProviderError::network(&e).into());
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(status = %status, "Anthropic API error: {}", text);
            return Err(ProviderError::from_status(status.as_u16(), &text).into());
        }

        Ok(sse_event_stream(resp, parse_sse_payload))
    }
}
