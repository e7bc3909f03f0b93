// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! External reranker client.
//!
//! Speaks the rerank API shape used by Cohere-style endpoints: the query and
//! candidate documents go in, `{index, relevance_score}` pairs in `[0,1]`
//! come out. The searcher treats any failure here as non-fatal and falls
//! back to RRF ordering.
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use parley_model::ProviderError;

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// Relevance scores in `[0,1]`, one per input document, input order.
    async fn rerank(&self, query: &str, documents: &[String])
        -> Result<Vec<f64>, ProviderError>;
}

pub struct HttpReranker {
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn from_config(cfg: &parley_config::RerankerConfig) -> Self {
        let api_key = cfg.api_key_env.as_deref().and_then(|env| std::env::var(env).ok());
        Self {
            base_url: cfg.base_url.clone(),
            model: cfg.model.clone(),
            api_key,
            timeout: Duration::from_millis(cfg.timeout_ms),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        "http"
    }

    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<f64>, ProviderError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.model,
            "query": query,
            "documents": documents,
        });
        let mut req = self
            .client
            .post(format!("{}/v1/rerank", self.base_url))
            .timeout(self.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
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
            .map_err(|e| ProviderError::Fatal(format!("rerank response decode: {e}")))?;

        let mut scores = vec![0.0f64; documents.len()];
        for item in v["results"].as_array().into_iter().flatten() {
            let index = item["index"].as_u64().unwrap_or(u64::MAX) as usize;
            let score = item["relevance_score"].as_f64().unwrap_or(0.0);
            if index < scores.len() {
                scores[index] = score.clamp(0.0, 1.0);
            }
        }
        Ok(scores)
    }
}

/// Fixed-score reranker for tests: looks scores up by substring match.
pub struct StaticReranker {
    rules: Vec<(String, f64)>,
    /// Score for documents matching no rule.
    pub default_score: f64,
    /// When set, every call fails (exercises the RRF fallback path).
    pub fail: bool,
}

impl StaticReranker {
    pub fn new(rules: Vec<(&str, f64)>) -> Self {
        Self {
            rules: rules.into_iter().map(|(s, f)| (s.to_string(), f)).collect(),
            default_score: 0.0,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self { rules: Vec::new(), default_score: 0.0, fail: true }
    }
}

#[async_trait]
impl Reranker for StaticReranker {
    fn name(&self) -> &str {
        "static"
    }

    async fn rerank(
        &self,
        _query: &str,
        documents: &[String],
    ) -> Result<Vec<f64>, ProviderError> {
        if self.fail {
            return Err(ProviderError::Upstream { status: 503, body: "down".into() });
        }
        Ok(documents
            .iter()
            .map(|d| {
                self.rules
                    .iter()
                    .find(|(needle, _)| d.contains(needle))
                    .map(|(_, score)| *score)
                    .unwrap_or(self.default_score)
            })
            .collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_reranker_scores_by_substring() {
        let r = StaticReranker::new(vec![("balk", 0.9)]);
        let scores = r
            .rerank("q", &["the balk rule".into(), "unrelated".into()])
            .await
            .unwrap();
        assert_eq!(scores, vec![0.9, 0.0]);
    }

    #[tokio::test]
    async fn failing_reranker_reports_upstream_error() {
        let r = StaticReranker::failing();
        assert!(r.rerank("q", &["a".into()]).await.is_err());
    }
}
