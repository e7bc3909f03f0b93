// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Startup configuration for the parley server.
//!
//! Configuration is read **once** at startup by layer-merging YAML files
//! (system → home → workspace → explicit `--config` path). Secrets are never
//! stored in the files themselves — config fields name the environment
//! variables that hold them, and the bootstrap resolves those at startup.

mod loader;
mod schema;

pub use loader::load;
pub use schema::{
    BudgetConfig, Config, DisciplineLevel, EmbeddingConfig, IdentityConfig, LimitsConfig,
    ModelProviderConfig, RerankerConfig, ResearchDepth, ResearchProviderConfig, RetrievalConfig,
    ServerConfig, StaticToken, StoreConfig,
};
