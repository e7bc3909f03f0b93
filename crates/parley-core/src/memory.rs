// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Memory recall for the orchestrator's prompt.
//!
//! Top three facts with cosine similarity ≥ 0.82 against the query, grouped
//! by kind in the rendered block. Recall is advisory context only — an empty
//! block is simply omitted from the prompt.
use std::sync::Arc;

use parley_model::{Metering, ModelGateway, ProviderError};
use parley_store::{MemoryFact, MemoryKind, Store, StoreError};

pub const RECALL_TOP_N: usize = 3;
pub const RECALL_MIN_SIMILARITY: f64 = 0.82;

pub struct MemoryRecall {
    store: Store,
    gateway: Arc<ModelGateway>,
}

#[derive(Debug, Default)]
pub struct RecallOutcome {
    pub facts: Vec<(MemoryFact, f64)>,
    pub metering: Option<Metering>,
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("embedding failed: {0}")]
    Embedding(ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MemoryRecall {
    pub fn new(store: Store, gateway: Arc<ModelGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn recall(&self, user_id: &str, query: &str) -> Result<RecallOutcome, MemoryError> {
        let embed = self
            .gateway
            .embed(&[query.to_string()])
            .await
            .map_err(MemoryError::Embedding)?;
        let facts = self
            .store
            .similar_memories(user_id, &embed.vectors[0], RECALL_TOP_N, RECALL_MIN_SIMILARITY)
            .await?;
        Ok(RecallOutcome { facts, metering: Some(embed.metering) })
    }

    /// Store a new fact, embedding it first.
    pub async fn remember(
        &self,
        user_id: &str,
        kind: MemoryKind,
        content: &str,
    ) -> Result<Option<Metering>, MemoryError> {
        let embed = self
            .gateway
            .embed(&[content.to_string()])
            .await
            .map_err(MemoryError::Embedding)?;
        self.store.add_memory_fact(user_id, kind, content, &embed.vectors[0]).await?;
        Ok(Some(embed.metering))
    }
}

/// Render recalled facts grouped by kind. Empty input renders empty.
pub fn memory_block(facts: &[(MemoryFact, f64)]) -> String {
    if facts.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for kind in [MemoryKind::Fact, MemoryKind::Preference, MemoryKind::Insight, MemoryKind::Event]
    {
        let group: Vec<&MemoryFact> =
            facts.iter().filter(|(f, _)| f.kind == kind).map(|(f, _)| f).collect();
        if group.is_empty() {
            continue;
        }
        out.push_str(&format!("{}:\n", kind.as_str()));
        for f in group {
            out.push_str(&format!("- {}\n", f.content));
        }
    }
    out.trim_end().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_model::mock::{MockChatProvider, MockEmbedder};
    use parley_model::ChatProvider;

    const DIM: usize = 64;

    fn recaller() -> (Store, MemoryRecall) {
        let store = Store::in_memory(DIM).unwrap();
        let gateway = Arc::new(ModelGateway::with_providers(
            vec![("default".into(), Arc::new(MockChatProvider) as Arc<dyn ChatProvider>)],
            Arc::new(MockEmbedder::new(DIM)),
        ));
        (store.clone(), MemoryRecall::new(store, gateway))
    }

    #[tokio::test]
    async fn identical_text_recalls_itself() {
        let (_, recall) = recaller();
        recall
            .remember("alice", MemoryKind::Preference, "prefers metric units")
            .await
            .unwrap();
        let out = recall.recall("alice", "prefers metric units").await.unwrap();
        assert_eq!(out.facts.len(), 1);
        assert!(out.facts[0].1 > 0.99);
    }

    #[tokio::test]
    async fn unrelated_text_falls_below_threshold() {
        let (_, recall) = recaller();
        recall
            .remember("alice", MemoryKind::Fact, "works in municipal water treatment")
            .await
            .unwrap();
        let out = recall
            .recall("alice", "completely disjoint wording about sailing regattas")
            .await
            .unwrap();
        assert!(out.facts.is_empty());
    }

    #[test]
    fn block_groups_by_kind_and_omits_empty_groups() {
        let fact = |kind, text: &str| {
            (
                MemoryFact {
                    id: uuid::Uuid::new_v4(),
                    user_id: "u".into(),
                    kind,
                    content: text.into(),
                    embedding: vec![],
                    created_at: chrono::Utc::now(),
                },
                0.9,
            )
        };
        let block = memory_block(&[
            fact(MemoryKind::Preference, "short answers"),
            fact(MemoryKind::Fact, "lives in Lund"),
        ]);
        assert!(block.starts_with("fact:"));
        assert!(block.contains("preference:"));
        assert!(!block.contains("insight:"));
        assert_eq!(memory_block(&[]), "");
    }
}
