// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Long-running research jobs: plan, fan out over search providers, score
//! and dedup sources, draft sections progressively, resolve citations, and
//! ingest the finished report back into the user's corpus.

pub mod coordinator;
pub mod credibility;
pub mod provider;

use thiserror::Error;

pub use coordinator::{CitationStyle, ResearchCoordinator, ResearchEvent, ResearchOutcome};
pub use provider::{HttpSearchProvider, MockSearchProvider, SearchProvider, SourceHit};

#[derive(Debug, Error)]
pub enum ResearchError {
    /// No search providers are configured; the feature is disabled.
    #[error("no research providers configured")]
    NoProviders,

    #[error("model call failed: {0}")]
    Model(String),

    #[error(transparent)]
    Store(#[from] parley_store::StoreError),
}
