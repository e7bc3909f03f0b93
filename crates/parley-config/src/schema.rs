// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Top-level configuration.
///
/// Every section has serde defaults so a minimal config file (or none at all,
/// for `show-config`) deserializes cleanly. [`Config::validate`] decides which
/// omissions are fatal at startup and which merely disable a feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub identity: IdentityConfig,
    /// Text-generation providers, keyed by their `tag`.
    pub models: Vec<ModelProviderConfig>,
    pub default_model_tag: Option<String>,
    pub embedding: EmbeddingConfig,
    /// Optional reranker. Absent → retrieval falls back to RRF ordering.
    pub reranker: Option<RerankerConfig>,
    /// Research search providers. Empty → research jobs are disabled.
    pub research: Vec<ResearchProviderConfig>,
    pub retrieval: RetrievalConfig,
    pub budget: BudgetConfig,
    pub limits: LimitsConfig,
    /// Environment variable holding the 32-byte (hex) master key used to
    /// encrypt tabular binding credentials at rest.
    pub master_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1".into(), port: 8432 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database file. `:memory:` is accepted for tests.
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: "parley.db".into() }
    }
}

/// Identity authority used to validate bearer credentials on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Verification endpoint (`GET {url}` with `Authorization: Bearer …`
    /// returning `{user_id}`). Required unless `static_tokens` is used.
    pub url: Option<String>,
    /// Static `token → user_id` pairs for development and tests.
    pub static_tokens: Vec<StaticToken>,
    /// Verification timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { url: None, static_tokens: Vec::new(), timeout_ms: 3_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub user_id: String,
}

/// One text-generation provider entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProviderConfig {
    /// Stable tag the rest of the system routes on (e.g. `"claude-fast"`).
    pub tag: String,
    /// Driver id from the registry (`anthropic`, `openai`, `mock`, …).
    pub provider: String,
    /// Provider-side model identifier.
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    /// Embedding dimension — an invariant of the corpus. Mixing dimensions
    /// is rejected by the store.
    pub dimension: usize,
    /// Batch size for ingestion-time embedding calls.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "text-embedding-3-small".into(),
            api_key_env: Some("OPENAI_API_KEY".into()),
            base_url: None,
            dimension: 1536,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_rerank_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_rerank_timeout_ms() -> u64 {
    4_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchProviderConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_search_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_search_timeout_ms() -> u64 {
    10_000
}

/// Post-rerank relevance policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisciplineLevel {
    Strict,
    Moderate,
    Exploration,
}

impl DisciplineLevel {
    /// Score threshold applied after reranking (RRF-normalised on fallback).
    pub fn threshold(self) -> f64 {
        match self {
            Self::Strict => 0.5,
            Self::Moderate => 0.2,
            Self::Exploration => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Dense k-NN candidate count.
    pub dense_candidates: usize,
    /// Lexical candidate count.
    pub lexical_candidates: usize,
    /// Candidates passed to the reranker.
    pub rerank_candidates: usize,
    /// Results returned to the orchestrator.
    pub top_k: usize,
    pub discipline: DisciplineLevel,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dense_candidates: 40,
            lexical_candidates: 40,
            rerank_candidates: 20,
            top_k: 5,
            discipline: DisciplineLevel::Moderate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Default monthly cap in minor units (ten-thousandths of a dollar)
    /// for users with no explicit settings row.
    pub default_monthly_cap: i64,
    /// Fraction of the cap at which admission switches to `Warn`.
    pub warn_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { default_monthly_cap: 200_000, warn_fraction: 0.8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Inbound frames per second per session.
    pub frames_per_second: u32,
    /// Turns per minute per user.
    pub turns_per_minute: u32,
    /// Bound of the per-session outbound frame queue.
    pub outbound_queue: usize,
    /// Maximum accepted upload size in bytes.
    pub max_upload_bytes: usize,
    /// Tabular statement timeout in milliseconds.
    pub tabular_timeout_ms: u64,
    /// Tabular row cap (enforced by LIMIT injection).
    pub tabular_row_cap: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            frames_per_second: 10,
            turns_per_minute: 100,
            outbound_queue: 64,
            max_upload_bytes: 20 * 1024 * 1024,
            tabular_timeout_ms: 5_000,
            tabular_row_cap: 1_000,
        }
    }
}

/// Research depth presets with their total wall-clock budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchDepth {
    Quick,
    Standard,
    Deep,
}

impl ResearchDepth {
    pub fn budget(self) -> std::time::Duration {
        match self {
            Self::Quick => std::time::Duration::from_secs(120),
            Self::Standard => std::time::Duration::from_secs(300),
            Self::Deep => std::time::Duration::from_secs(600),
        }
    }

    /// Subtopic count planned for this depth.
    pub fn subtopics(self) -> usize {
        match self {
            Self::Quick => 3,
            Self::Standard => 5,
            Self::Deep => 8,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            identity: IdentityConfig::default(),
            models: Vec::new(),
            default_model_tag: None,
            embedding: EmbeddingConfig::default(),
            reranker: None,
            research: Vec::new(),
            retrieval: RetrievalConfig::default(),
            budget: BudgetConfig::default(),
            limits: LimitsConfig::default(),
            master_key_env: "PARLEY_MASTER_KEY".into(),
        }
    }
}

impl Config {
    /// Startup validation. Errors here map to exit code 1 (misconfiguration).
    ///
    /// Missing *optional* providers (reranker, research) are not errors —
    /// the corresponding features are disabled with a logged warning.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.models.is_empty() {
            anyhow::bail!("no text-generation providers configured (models: [])");
        }
        let default_tag = self
            .default_model_tag
            .as_deref()
            .unwrap_or_else(|| self.models[0].tag.as_str());
        if !self.models.iter().any(|m| m.tag == default_tag) {
            anyhow::bail!("default_model_tag '{default_tag}' does not match any configured model");
        }
        let mut seen = std::collections::HashSet::new();
        for m in &self.models {
            if !seen.insert(m.tag.as_str()) {
                anyhow::bail!("duplicate model tag '{}'", m.tag);
            }
        }
        if self.identity.url.is_none() && self.identity.static_tokens.is_empty() {
            anyhow::bail!("identity authority not configured (identity.url or static_tokens)");
        }
        if self.embedding.dimension == 0 {
            anyhow::bail!("embedding.dimension must be non-zero");
        }
        Ok(())
    }

    /// The model tag used when a user has no per-user default.
    pub fn default_tag(&self) -> &str {
        self.default_model_tag
            .as_deref()
            .unwrap_or_else(|| self.models[0].tag.as_str())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
