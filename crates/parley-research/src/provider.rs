// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Search provider seam for the research coordinator.
//!
//! Providers present one small contract; adding one is a registration step.
//! The coordinator fans out across all registered providers and tolerates
//! individual failures.
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use parley_model::ProviderError;

/// One raw hit from a search provider, before credibility scoring.
#[derive(Debug, Clone)]
pub struct SourceHit {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub published_year: Option<i32>,
    pub citation_count: Option<u32>,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SourceHit>, ProviderError>;
}

/// Generic JSON search API client: `POST {base_url}/search` with
/// `{query, limit}`, hits under `results[]`.
pub struct HttpSearchProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpSearchProvider {
    pub fn from_config(cfg: &parley_config::ResearchProviderConfig) -> Self {
        let api_key = cfg.api_key_env.as_deref().and_then(|env| std::env::var(env).ok());
        Self {
            name: cfg.name.clone(),
            base_url: cfg.base_url.clone(),
            api_key,
            timeout: Duration::from_millis(cfg.timeout_ms),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SourceHit>, ProviderError> {
        let mut req = self
            .client
            .post(format!("{}/search", self.base_url))
            .timeout(self.timeout)
            .json(&json!({ "query": query, "limit": limit }));
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
            .map_err(|e| ProviderError::Fatal(format!("search response decode: {e}")))?;
        let mut hits = Vec::new();
        for item in v["results"].as_array().into_iter().flatten() {
            let Some(url) = item["url"].as_str() else { continue };
            hits.push(SourceHit {
                url: url.to_string(),
                title: item["title"].as_str().map(String::from),
                snippet: item["snippet"].as_str().map(String::from),
                published_year: item["year"].as_i64().map(|y| y as i32),
                citation_count: item["citations"].as_u64().map(|c| c as u32),
            });
        }
        Ok(hits)
    }
}

/// Scripted provider for tests.
pub struct MockSearchProvider {
    name: String,
    pub hits: Vec<SourceHit>,
    pub fail: bool,
}

impl MockSearchProvider {
    pub fn new(name: &str, hits: Vec<SourceHit>) -> Self {
        Self { name: name.to_string(), hits, fail: false }
    }

    pub fn failing(name: &str) -> Self {
        Self { name: name.to_string(), hits: Vec::new(), fail: true }
    }
}

#[async_trait]
impl SearchProvider for MockSearchProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<SourceHit>, ProviderError> {
        if self.fail {
            return Err(ProviderError::Upstream { status: 502, body: "down".into() });
        }
        Ok(self.hits.iter().take(limit).cloned().collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_provider_caps_at_limit() {
        let hits = (0..5)
            .map(|i| SourceHit {
                url: format!("https://example.org/{i}"),
                title: None,
                snippet: None,
                published_year: None,
                citation_count: None,
            })
            .collect();
        let p = MockSearchProvider::new("m", hits);
        assert_eq!(p.search("q", 3).await.unwrap().len(), 3);
    }
}
