// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Static model catalog: context windows, output limits, pricing.
//!
//! Prices are stored in minor units (ten-thousandths of a dollar) per one
//! million tokens so that cost arithmetic stays in integers end to end.
//! The catalog is the single source the gateway consults for pre-flight
//! estimates and post-flight billing; unknown models fall back to the
//! per-provider default entry.

/// Catalog entry for one provider/model combination.
#[derive(Debug, Clone)]
pub struct ModelCatalogEntry {
    pub provider: &'static str,
    pub id: &'static str,
    pub context_window: u32,
    pub max_output_tokens: u32,
    /// Minor units per 1M input tokens.
    pub input_price: i64,
    /// Minor units per 1M output tokens.
    pub output_price: i64,
    /// Some reasoning models pin temperature server-side.
    pub supports_temperature: bool,
}

static CATALOG: &[ModelCatalogEntry] = &[
    // ── Anthropic ─────────────────────────────────────────────────────────────
    ModelCatalogEntry {
        provider: "anthropic",
        id: "claude-sonnet-4-20250514",
        context_window: 200_000,
        max_output_tokens: 64_000,
        input_price: 30_000,
        output_price: 150_000,
        supports_temperature: true,
    },
    ModelCatalogEntry {
        provider: "anthropic",
        id: "claude-3-5-haiku-20241022",
        context_window: 200_000,
        max_output_tokens: 8_192,
        input_price: 8_000,
        output_price: 40_000,
        supports_temperature: true,
    },
    // ── OpenAI ────────────────────────────────────────────────────────────────
    ModelCatalogEntry {
        provider: "openai",
        id: "gpt-4o",
        context_window: 128_000,
        max_output_tokens: 16_384,
        input_price: 25_000,
        output_price: 100_000,
        supports_temperature: true,
    },
    ModelCatalogEntry {
        provider: "openai",
        id: "gpt-4o-mini",
        context_window: 128_000,
        max_output_tokens: 16_384,
        input_price: 1_500,
        output_price: 6_000,
        supports_temperature: true,
    },
    ModelCatalogEntry {
        provider: "openai",
        id: "o4-mini",
        context_window: 200_000,
        max_output_tokens: 100_000,
        input_price: 11_000,
        output_price: 44_000,
        supports_temperature: false,
    },
    ModelCatalogEntry {
        provider: "openai",
        id: "text-embedding-3-small",
        context_window: 8_191,
        max_output_tokens: 0,
        input_price: 200,
        output_price: 0,
        supports_temperature: false,
    },
    ModelCatalogEntry {
        provider: "openai",
        id: "text-embedding-3-large",
        context_window: 8_191,
        max_output_tokens: 0,
        input_price: 1_300,
        output_price: 0,
        supports_temperature: false,
    },
    // ── Testing ───────────────────────────────────────────────────────────────
    ModelCatalogEntry {
        provider: "mock",
        id: "mock-model",
        context_window: 32_768,
        max_output_tokens: 4_096,
        input_price: 1_000,
        output_price: 1_000,
        supports_temperature: true,
    },
];

/// Conservative fallback used when a model is not in the catalog.
static UNKNOWN: ModelCatalogEntry = ModelCatalogEntry {
    provider: "",
    id: "",
    context_window: 32_768,
    max_output_tokens: 4_096,
    input_price: 30_000,
    output_price: 150_000,
    supports_temperature: true,
};

/// All catalog entries in declaration order.
pub fn static_catalog() -> &'static [ModelCatalogEntry] {
    CATALOG
}

/// Look up an exact provider/model pair.
pub fn lookup(provider: &str, id: &str) -> Option<&'static ModelCatalogEntry> {
    CATALOG.iter().find(|e| e.provider == provider && e.id == id)
}

/// Like [`lookup`] but falls back to the conservative unknown-model entry.
pub fn lookup_or_default(provider: &str, id: &str) -> &'static ModelCatalogEntry {
    lookup(provider, id).unwrap_or(&UNKNOWN)
}

/// Cost in minor units for a token count against an entry.
///
/// Rounds up so fractional-token costs are never billed as zero.
pub fn cost_minor(entry: &ModelCatalogEntry, input_tokens: u32, output_tokens: u32) -> i64 {
    let input = i64::from(input_tokens) * entry.input_price;
    let output = i64::from(output_tokens) * entry.output_price;
    let total = input + output;
    let q = total / 1_000_000;
    let r = total % 1_000_000;
    if r > 0 { q + 1 } else { q }
}

/// Pre-flight token estimate for a text (4 chars per token, floor 1).
pub fn approx_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
