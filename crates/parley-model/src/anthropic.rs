// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::{ProviderError, ResponseStream},
    ChatMessage, CompletionRequest, FinishReason, ResponseEvent, Role,
};

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredential("ANTHROPIC_API_KEY".into()))?;

        let (system_text, messages) = build_anthropic_messages(&req.messages);

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "temperature": req.temperature.unwrap_or(self.temperature),
            "stream": true,
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }

        debug!(model = %self.model, "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited,
                s => ProviderError::Upstream { status: s, body },
            });
        }

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward. Only complete lines (terminated by '\n') are
        // parsed; anything left over is prepended to the next chunk.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(ProviderError::Network(
                            e.to_string(),
                        ))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            events.push(Ok(parse_anthropic_event(&v)));
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

fn parse_anthropic_event(v: &Value) -> ResponseEvent {
    match v["type"].as_str().unwrap_or("") {
        "content_block_delta" => {
            let delta = &v["delta"];
            if delta["type"].as_str() == Some("text_delta") {
                ResponseEvent::TextDelta(delta["text"].as_str().unwrap_or("").to_string())
            } else {
                ResponseEvent::TextDelta(String::new())
            }
        }
        "message_start" => {
            let input = v["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
            ResponseEvent::Usage { input_tokens: input, output_tokens: 0 }
        }
        "message_delta" => {
            if v["delta"]["stop_reason"].as_str() == Some("max_tokens") {
                return ResponseEvent::Done(FinishReason::MaxTokens);
            }
            let output = v["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;
            ResponseEvent::Usage { input_tokens: 0, output_tokens: output }
        }
        "message_stop" => ResponseEvent::Done(FinishReason::Stop),
        "error" => ResponseEvent::Error(
            v["error"]["message"].as_str().unwrap_or("provider error").to_string(),
        ),
        _ => ResponseEvent::TextDelta(String::new()),
    }
}

/// Convert messages into the Anthropic wire format.
///
/// Returns `(system_text, conversation_messages)`. The system message is
/// separated out because Anthropic expects it as a top-level `system` field,
/// not as a conversation turn.
fn build_anthropic_messages(messages: &[ChatMessage]) -> (String, Vec<Value>) {
    let mut system = String::new();
    let mut wire = Vec::new();
    for m in messages {
        match m.role {
            Role::System => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&m.content);
            }
            Role::User => wire.push(json!({ "role": "user", "content": m.content })),
            Role::Assistant => wire.push(json!({ "role": "assistant", "content": m.content })),
        }
    }
    (system, wire)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_hoisted_out_of_the_turn_list() {
        let msgs = vec![
            ChatMessage::system("persona"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let (system, wire) = build_anthropic_messages(&msgs);
        assert_eq!(system, "persona");
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["role"], "user");
    }

    #[test]
    fn multiple_system_messages_concatenate() {
        let msgs = vec![ChatMessage::system("a"), ChatMessage::system("b")];
        let (system, wire) = build_anthropic_messages(&msgs);
        assert_eq!(system, "a\n\nb");
        assert!(wire.is_empty());
    }

    #[test]
    fn text_delta_event_parses() {
        let v: Value = serde_json::from_str(
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"hi"}}"#,
        )
        .unwrap();
        match parse_anthropic_event(&v) {
            ResponseEvent::TextDelta(t) => assert_eq!(t, "hi"),
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn message_start_carries_input_tokens() {
        let v: Value = serde_json::from_str(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":55}}}"#,
        )
        .unwrap();
        match parse_anthropic_event(&v) {
            ResponseEvent::Usage { input_tokens, output_tokens } => {
                assert_eq!(input_tokens, 55);
                assert_eq!(output_tokens, 0);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn max_tokens_stop_reason_maps_to_finish_reason() {
        let v: Value = serde_json::from_str(
            r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens"},"usage":{"output_tokens":10}}"#,
        )
        .unwrap();
        assert!(matches!(
            parse_anthropic_event(&v),
            ResponseEvent::Done(FinishReason::MaxTokens)
        ));
    }

    #[test]
    fn message_stop_is_done() {
        let v: Value = serde_json::from_str(r#"{"type":"message_stop"}"#).unwrap();
        assert!(matches!(parse_anthropic_event(&v), ResponseEvent::Done(FinishReason::Stop)));
    }
}
