// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI driver: streamed chat completions plus the embeddings endpoint.
//!
//! Also serves any OpenAI-compatible gateway (OpenRouter, Groq, …) — the
//! driver only varies in `base_url` and key, which come from the registry
//! defaults and config.
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::{EmbeddingBatch, ProviderError, ResponseStream},
    CompletionRequest, FinishReason, ResponseEvent, Role,
};

pub struct OpenAiProvider {
    driver_id: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    /// Reasoning models reject an explicit temperature; the catalog decides.
    supports_temperature: bool,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(
        driver_id: String,
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        let supports_temperature =
            crate::catalog::lookup_or_default("openai", &model).supports_temperature;
        Self {
            driver_id,
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            supports_temperature,
            client: reqwest::Client::new(),
        }
    }

    fn key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredential(format!("{} API key", self.driver_id)))
    }
}

#[async_trait]
impl crate::ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.driver_id
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ProviderError> {
        let key = self.key()?;

        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "stream": true,
            // Without this OpenAI omits the final usage chunk from streams.
            "stream_options": { "include_usage": true },
        });
        if self.supports_temperature {
            body["temperature"] = json!(req.temperature.unwrap_or(self.temperature));
        }

        debug!(driver = %self.driver_id, model = %self.model, "sending chat request");

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
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
                        let data = data.trim();
                        if data == "[DONE]" {
                            events.push(Ok(ResponseEvent::Done(FinishReason::Stop)));
                        } else if let Ok(v) = serde_json::from_str::<Value>(data) {
                            if let Some(ev) = parse_openai_chunk(&v) {
                                events.push(Ok(ev));
                            }
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

fn parse_openai_chunk(v: &Value) -> Option<ResponseEvent> {
    // The final usage chunk has an empty choices array.
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return Some(ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });
    }
    let choice = v["choices"].get(0)?;
    if choice["finish_reason"].as_str() == Some("length") {
        return Some(ResponseEvent::Done(FinishReason::MaxTokens));
    }
    let delta = choice["delta"]["content"].as_str()?;
    Some(ResponseEvent::TextDelta(delta.to_string()))
}

// ─── Embeddings ───────────────────────────────────────────────────────────────

pub struct OpenAiEmbedder {
    model: String,
    api_key: Option<String>,
    base_url: String,
    dimension: usize,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        dimension: usize,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            dimension,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredential("OPENAI_API_KEY".into()))?;

        let body = json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dimension,
        });

        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(key)
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

        let v: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("embedding response decode: {e}")))?;

        let mut vectors: Vec<(usize, Vec<f32>)> = Vec::new();
        for item in v["data"].as_array().into_iter().flatten() {
            let index = item["index"].as_u64().unwrap_or(0) as usize;
            let vec: Vec<f32> = item["embedding"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|x| x.as_f64().map(|f| f as f32))
                .collect();
            if vec.len() != self.dimension {
                return Err(ProviderError::Fatal(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimension,
                    vec.len()
                )));
            }
            vectors.push((index, vec));
        }
        // The API may return entries out of order; index restores input order.
        vectors.sort_by_key(|(i, _)| *i);
        if vectors.len() != texts.len() {
            return Err(ProviderError::Fatal(format!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                vectors.len()
            )));
        }

        Ok(EmbeddingBatch {
            vectors: vectors.into_iter().map(|(_, v)| v).collect(),
            input_tokens: v["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_chunk_parses_to_text() {
        let v: Value = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"hey"},"finish_reason":null}]}"#,
        )
        .unwrap();
        match parse_openai_chunk(&v) {
            Some(ResponseEvent::TextDelta(t)) => assert_eq!(t, "hey"),
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn usage_chunk_parses_to_usage() {
        let v: Value = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34}}"#,
        )
        .unwrap();
        match parse_openai_chunk(&v) {
            Some(ResponseEvent::Usage { input_tokens, output_tokens }) => {
                assert_eq!((input_tokens, output_tokens), (12, 34));
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn length_finish_reason_maps_to_max_tokens() {
        let v: Value = serde_json::from_str(
            r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            parse_openai_chunk(&v),
            Some(ResponseEvent::Done(FinishReason::MaxTokens))
        ));
    }

    #[test]
    fn empty_delta_yields_nothing() {
        let v: Value =
            serde_json::from_str(r#"{"choices":[{"delta":{},"finish_reason":null}]}"#).unwrap();
        assert!(parse_openai_chunk(&v).is_none());
    }
}
