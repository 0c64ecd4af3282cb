use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{error, info};

use super::{
    build_http_client, sse_event_stream, ChatMessage, ChatOptions, ChatProvider, EventStream,
    ProviderError, SseItem, StreamEvent, TokenUsage,
};

pub struct GoogleGenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GoogleGenAiProvider {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Self {
        Self {
            client: build_http_client(timeout).expect("reqwest client with static config"),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// Gemini wants `contents` with user/model roles and the system prompt
    /// as a separate `system_instruction`.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<Value>, Vec<Value>) {
        let mut system: Option<String> = None;
        let mut contents = Vec::new();
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
                "assistant" => contents.push(json!({
                    "role": "model",
                    "parts": [{"text": msg.content}]
                })),
                _ => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": msg.content}]
                })),
            }
        }
        let system_instruction = system.map(|text| json!({"parts": [{"text": text}]}));
        (system_instruction, contents)
    }

    fn build_request_body(&self, messages: &[ChatMessage], options: &ChatOptions) -> Value {
        let (system_instruction, contents) = Self::convert_messages(messages);
        let mut body = json!({"contents": contents});
        if let Some(system_instruction) = system_instruction {
            body["system_instruction"] = system_instruction;
        }
        let mut generation_config = serde_json::Map::new();
        if let Some(temperature) = options.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = options.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }
        body
    }
}

fn parse_sse_payload(payload: &str) -> Option<SseItem> {
    let data: Value = serde_json::from_str(payload).ok()?;
    if let Some(parts) = data["candidates"][0]["content"]["parts"].as_array() {
        let text: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect();
        if !text.is_empty() {
            return Some(SseItem::Event(StreamEvent::Content(text)));
        }
    }
    if let Some(usage) = data.get("usageMetadata") {
        return Some(SseItem::Event(StreamEvent::Usage(TokenUsage {
            input_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0),
            output_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0),
        })));
    }
    None
}

#[async_trait]
impl ChatProvider for GoogleGenAiProvider {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<EventStream> {
        // alt=sse turns the chunked-JSON response into standard SSE frames.
        // The key goes in a header, never the URL, so it cannot leak into
        // logs or proxies.
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        info!(model = %self.model, "Opening Gemini streaming completion");

        let resp = match self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&self.build_request_body(messages, options))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("Gemini HTTP request failed: {}", e);
                return Err(ProviderError::network(&e).into());
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(status = %status, "Gemini API error: {}", text);
            return Err(ProviderError::from_status(status.as_u16(), &text).into());
        }

        // Gemini has no done sentinel; the stream ends at connection close.
        Ok(sse_event_stream(resp, parse_sse_payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_mapped_to_gemini_shapes() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage { role: "assistant".to_string(), content: "hello".to_string() },
        ];
        let (system, contents) = GoogleGenAiProvider::convert_messages(&messages);
        assert_eq!(system.unwrap()["parts"][0]["text"], "sys");
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn test_generation_config_only_when_set() {
        let provider =
            GoogleGenAiProvider::new("key", "gemini-2.0-flash", Duration::from_secs(30));
        let bare = provider.build_request_body(&[ChatMessage::user("x")], &ChatOptions::default());
        assert!(bare.get("generationConfig").is_none());

        let tuned = provider.build_request_body(
            &[ChatMessage::user("x")],
            &ChatOptions { temperature: Some(0.3), max_tokens: Some(2048) },
        );
        assert_eq!(tuned["generationConfig"]["temperature"], 0.3);
        assert_eq!(tuned["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn test_parse_candidate_text() {
        let item = parse_sse_payload(
            r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}}]}"#,
        );
        match item {
            Some(SseItem::Event(StreamEvent::Content(text))) => assert_eq!(text, "ab"),
            _ => panic!("expected content"),
        }
    }

    #[test]
    fn test_parse_usage_metadata() {
        let item = parse_sse_payload(
            r#"{"candidates":[],"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":20}}"#,
        );
        match item {
            Some(SseItem::Event(StreamEvent::Usage(usage))) => {
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 20);
            }
            _ => panic!("expected usage"),
        }
    }
}
