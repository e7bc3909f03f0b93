// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

use crate::{CompletionRequest, ResponseEvent};

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<ResponseEvent, ProviderError>> + Send>>;

/// Errors surfaced by providers. The gateway retries only the variants that
/// are idempotent to repeat: the request never reached the model, or the
/// provider explicitly asked for a retry.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("{0}")]
    Fatal(String),
}

impl ProviderError {
    /// Whether repeating the request is safe and potentially useful.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited => true,
            Self::Upstream { status, .. } => *status >= 500,
            Self::MissingCredential(_) | Self::Fatal(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// A text-generation provider addressed by a stable model tag.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Driver id for status display (`"anthropic"`, `"openai"`, `"mock"`).
    fn name(&self) -> &str;

    /// Provider-side model identifier.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ProviderError>;
}

/// One embedding batch: vectors in input order plus the billed token count.
#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub input_tokens: u32,
}

/// An embedding provider. The dimension is fixed per model and is an
/// invariant of the corpus; the store rejects mismatched vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Embedding dimension produced by this model.
    fn dimension(&self) -> usize;

    /// Embed a batch of texts. Vectors are returned in input order.
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, ProviderError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_rate_limit_are_retryable() {
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(ProviderError::RateLimited.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        assert!(ProviderError::Upstream { status: 503, body: String::new() }.is_retryable());
        assert!(!ProviderError::Upstream { status: 400, body: String::new() }.is_retryable());
    }

    #[test]
    fn fatal_and_credential_errors_are_terminal() {
        assert!(!ProviderError::Fatal("bad request".into()).is_retryable());
        assert!(!ProviderError::MissingCredential("KEY".into()).is_retryable());
    }
}
