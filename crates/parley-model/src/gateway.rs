// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use futures::StreamExt;
use tracing::info;

use crate::{
    anthropic::AnthropicProvider,
    catalog::{self, ModelCatalogEntry},
    mock::{MockChatProvider, MockEmbedder},
    openai::{OpenAiEmbedder, OpenAiProvider},
    provider::{ChatProvider, Embedder, ProviderError, ResponseStream},
    registry, retry, CompletionRequest, FinishReason, Metering, ResponseEvent, Usage,
};

/// One chat provider slot: the driver plus its catalog entry for billing.
struct ChatSlot {
    provider: Arc<dyn ChatProvider>,
    entry: &'static ModelCatalogEntry,
}

/// Uniform interface over every configured text-generation and embedding
/// provider, addressed by stable model tags.
pub struct ModelGateway {
    chat: HashMap<String, ChatSlot>,
    embedder: Arc<dyn Embedder>,
    embed_entry: &'static ModelCatalogEntry,
}

/// A fully drained (non-streamed) chat call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub finish: FinishReason,
    pub metering: Metering,
}

/// An embedding call with its metering record.
#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    pub vectors: Vec<Vec<f32>>,
    pub metering: Metering,
}

impl ModelGateway {
    /// Build the gateway from startup configuration, resolving API keys from
    /// the environment variables the config names.
    pub fn from_config(cfg: &parley_config::Config) -> anyhow::Result<Self> {
        let mut chat = HashMap::new();
        for m in &cfg.models {
            let driver = registry::get_driver(&m.provider)
                .with_context(|| format!("unknown model provider '{}'", m.provider))?;
            let api_key = m
                .api_key_env
                .as_deref()
                .or(driver.default_api_key_env)
                .and_then(|env| std::env::var(env).ok());
            if driver.requires_api_key && api_key.is_none() {
                anyhow::bail!(
                    "model '{}' requires an API key ({} unset)",
                    m.tag,
                    m.api_key_env.as_deref().or(driver.default_api_key_env).unwrap_or("?")
                );
            }
            let base_url = m.base_url.clone().or_else(|| driver.default_base_url.map(String::from));
            let provider: Arc<dyn ChatProvider> = match driver.id {
                "anthropic" => Arc::new(AnthropicProvider::new(
                    m.model.clone(),
                    api_key,
                    base_url,
                    m.max_tokens,
                    m.temperature,
                )),
                "mock" => Arc::new(MockChatProvider),
                // Everything else speaks the OpenAI wire format.
                _ => Arc::new(OpenAiProvider::new(
                    driver.id.to_string(),
                    m.model.clone(),
                    api_key,
                    base_url,
                    m.max_tokens,
                    m.temperature,
                )),
            };
            let entry = catalog::lookup_or_default(driver.id, &m.model);
            info!(tag = %m.tag, driver = driver.id, model = %m.model, "registered model");
            chat.insert(m.tag.clone(), ChatSlot { provider, entry });
        }

        let e = &cfg.embedding;
        let embed_key = e.api_key_env.as_deref().and_then(|env| std::env::var(env).ok());
        let embedder: Arc<dyn Embedder> = match e.provider.as_str() {
            "mock" => Arc::new(MockEmbedder::new(e.dimension)),
            _ => Arc::new(OpenAiEmbedder::new(
                e.model.clone(),
                embed_key,
                e.base_url.clone(),
                e.dimension,
            )),
        };
        let embed_entry = catalog::lookup_or_default(&e.provider, &e.model);

        Ok(Self { chat, embedder, embed_entry })
    }

    /// Test constructor with explicit providers.
    pub fn with_providers(
        chat: Vec<(String, Arc<dyn ChatProvider>)>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let chat = chat
            .into_iter()
            .map(|(tag, provider)| {
                let entry = catalog::lookup_or_default(provider.name(), provider.model_name());
                (tag, ChatSlot { provider, entry })
            })
            .collect();
        Self { chat, embedder, embed_entry: catalog::lookup_or_default("mock", "mock-model") }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.chat.contains_key(tag)
    }

    /// Catalog entry for a tag (conservative default for unknown tags).
    pub fn entry(&self, tag: &str) -> &'static ModelCatalogEntry {
        self.chat
            .get(tag)
            .map(|s| s.entry)
            .unwrap_or_else(|| catalog::lookup_or_default("", ""))
    }

    pub fn embedding_dimension(&self) -> usize {
        self.embedder.dimension()
    }

    /// Open a streamed completion. Connection-level failures are retried
    /// with backoff; once the stream is open, mid-stream errors surface to
    /// the consumer unretried (the turn is no longer idempotent).
    pub async fn stream_chat(
        &self,
        tag: &str,
        req: CompletionRequest,
    ) -> Result<ResponseStream, ProviderError> {
        let slot = self
            .chat
            .get(tag)
            .ok_or_else(|| ProviderError::Fatal(format!("unknown model tag '{tag}'")))?;
        let provider = Arc::clone(&slot.provider);
        retry::with_backoff("chat", || {
            let provider = Arc::clone(&provider);
            let req = req.clone();
            async move { provider.complete(req).await }
        })
        .await
    }

    /// Run a completion to the end and return the accumulated text plus
    /// metering. Used by the sub-agents that need a whole answer (SQL
    /// generation, research drafting) rather than a forwarded stream.
    pub async fn chat(
        &self,
        tag: &str,
        req: CompletionRequest,
    ) -> Result<ChatOutcome, ProviderError> {
        let started = Instant::now();
        let mut stream = self.stream_chat(tag, req).await?;
        let mut text = String::new();
        let mut usage = Usage::default();
        let mut finish = FinishReason::Stop;
        while let Some(ev) = stream.next().await {
            match ev? {
                ResponseEvent::TextDelta(t) => text.push_str(&t),
                ResponseEvent::Usage { input_tokens, output_tokens } => {
                    usage.fold(input_tokens, output_tokens);
                }
                ResponseEvent::Done(f) => {
                    finish = f;
                    break;
                }
                ResponseEvent::Error(e) => return Err(ProviderError::Fatal(e)),
            }
        }
        let metering = self.meter(tag, usage, started.elapsed().as_millis() as u64);
        Ok(ChatOutcome { text, finish, metering })
    }

    /// Embed a batch with retry and metering.
    pub async fn embed(&self, texts: &[String]) -> Result<EmbedOutcome, ProviderError> {
        if texts.is_empty() {
            return Ok(EmbedOutcome {
                vectors: Vec::new(),
                metering: Metering {
                    model_tag: self.embedder.model_name().to_string(),
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_minor: 0,
                    wall_ms: 0,
                },
            });
        }
        let started = Instant::now();
        let embedder = Arc::clone(&self.embedder);
        let batch = retry::with_backoff("embed", || {
            let embedder = Arc::clone(&embedder);
            let texts = texts.to_vec();
            async move { embedder.embed(&texts).await }
        })
        .await?;
        let cost = catalog::cost_minor(self.embed_entry, batch.input_tokens, 0);
        Ok(EmbedOutcome {
            vectors: batch.vectors,
            metering: Metering {
                model_tag: self.embedder.model_name().to_string(),
                input_tokens: batch.input_tokens,
                output_tokens: 0,
                cost_minor: cost,
                wall_ms: started.elapsed().as_millis() as u64,
            },
        })
    }

    /// Pre-flight token count for cost estimation.
    pub fn count_tokens(&self, text: &str, _tag: &str) -> usize {
        catalog::approx_tokens(text)
    }

    /// Pre-flight cost estimate in minor units.
    pub fn estimate_cost(&self, tag: &str, input_tokens: u32, assumed_output_tokens: u32) -> i64 {
        catalog::cost_minor(self.entry(tag), input_tokens, assumed_output_tokens)
    }

    /// Build the metering record for a finished call.
    pub fn meter(&self, tag: &str, usage: Usage, wall_ms: u64) -> Metering {
        Metering {
            model_tag: tag.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_minor: catalog::cost_minor(self.entry(tag), usage.input_tokens, usage.output_tokens),
            wall_ms,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;

    fn mock_gateway() -> ModelGateway {
        ModelGateway::with_providers(
            vec![("default".into(), Arc::new(MockChatProvider) as Arc<dyn ChatProvider>)],
            Arc::new(MockEmbedder::new(64)),
        )
    }

    #[tokio::test]
    async fn chat_drains_stream_and_meters() {
        let gw = mock_gateway();
        let out = gw
            .chat(
                "default",
                CompletionRequest {
                    messages: vec![ChatMessage::user("hello")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(out.text, "MOCK: hello");
        assert_eq!(out.metering.input_tokens, 10);
        assert_eq!(out.metering.output_tokens, 10);
        assert!(out.metering.cost_minor > 0);
    }

    #[tokio::test]
    async fn unknown_tag_is_fatal() {
        let gw = mock_gateway();
        let err = gw.chat("nope", CompletionRequest::default()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn embed_returns_vectors_and_cost() {
        let gw = mock_gateway();
        let out = gw.embed(&["abc".into(), "def".into()]).await.unwrap();
        assert_eq!(out.vectors.len(), 2);
        assert_eq!(out.vectors[0].len(), 64);
        assert!(out.metering.cost_minor >= 1);
    }

    #[tokio::test]
    async fn embed_empty_batch_is_free() {
        let gw = mock_gateway();
        let out = gw.embed(&[]).await.unwrap();
        assert!(out.vectors.is_empty());
        assert_eq!(out.metering.cost_minor, 0);
    }

    #[test]
    fn estimate_cost_uses_catalog_pricing() {
        let gw = mock_gateway();
        // mock-model: 1000 minor per Mtok each side.
        assert_eq!(gw.estimate_cost("default", 1_000_000, 0), 1_000);
    }
}
