// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Hybrid retrieval pipeline: ingestion (chunk → embed → atomic write),
//! query-time dense + lexical fusion with optional reranking, and citation
//! packaging. Everything is scoped to one user through the storage gateway.

pub mod chunker;
pub mod ingest;
pub mod rerank;
pub mod search;

use thiserror::Error;

pub use chunker::{ChunkSpan, Chunker};
pub use ingest::{IngestOutcome, Ingestor};
pub use rerank::{HttpReranker, Reranker, StaticReranker};
pub use search::{package_citations, Citation, HybridSearcher, RetrievedChunk, SearchOutcome};

#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Extracted text was empty; the upload is rejected.
    #[error("document has no extractable text")]
    EmptyDocument,

    #[error("embedding failed: {0}")]
    Embedding(parley_model::ProviderError),

    #[error(transparent)]
    Store(#[from] parley_store::StoreError),
}

// ─── Integration tests over the full pipeline ────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_config::{DisciplineLevel, RetrievalConfig};
    use parley_model::mock::{MockChatProvider, MockEmbedder};
    use parley_model::{ChatProvider, ModelGateway};
    use parley_store::Store;
    use std::sync::Arc;

    const DIM: usize = 128;

    fn gateway() -> Arc<ModelGateway> {
        Arc::new(ModelGateway::with_providers(
            vec![("default".into(), Arc::new(MockChatProvider) as Arc<dyn ChatProvider>)],
            Arc::new(MockEmbedder::new(DIM)),
        ))
    }

    fn searcher(store: &Store, reranker: Option<Arc<dyn Reranker>>) -> HybridSearcher {
        HybridSearcher::new(store.clone(), gateway(), reranker, RetrievalConfig::default())
    }

    async fn seed(store: &Store) {
        let ingestor = Ingestor::new(store.clone(), gateway(), 8);
        ingestor
            .ingest_text(
                "alice",
                "baseball.txt",
                "The pitcher's balk occurs when the pitching motion stops midway. \
                 Balk rules award bases to the runners.",
            )
            .await
            .unwrap();
        ingestor
            .ingest_text(
                "alice",
                "other.txt",
                "An unrelated topic of roughly the same length, discussing the \
                 quarterly migration patterns of seabirds instead.",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_corpus_returns_empty_not_error() {
        let store = Store::in_memory(DIM).unwrap();
        let out = searcher(&store, None)
            .search("alice", "anything at all", DisciplineLevel::Moderate)
            .await
            .unwrap();
        assert!(out.results.is_empty());
        assert!(out.metering.is_none(), "no embedding call for an empty corpus");
    }

    #[tokio::test]
    async fn relevant_chunk_ranks_first_at_every_discipline() {
        let store = Store::in_memory(DIM).unwrap();
        seed(&store).await;
        for discipline in
            [DisciplineLevel::Strict, DisciplineLevel::Moderate, DisciplineLevel::Exploration]
        {
            let reranker: Arc<dyn Reranker> =
                Arc::new(StaticReranker::new(vec![("balk", 0.9), ("seabirds", 0.1)]));
            let out = searcher(&store, Some(reranker))
                .search("alice", "balk rules", discipline)
                .await
                .unwrap();
            assert!(!out.results.is_empty(), "no results at {discipline:?}");
            assert!(
                out.results[0].text.contains("balk"),
                "wrong top result at {discipline:?}"
            );
        }
    }

    #[tokio::test]
    async fn strict_filters_what_exploration_keeps() {
        let store = Store::in_memory(DIM).unwrap();
        seed(&store).await;
        let rules = vec![("balk", 0.9), ("seabirds", 0.1)];

        let reranker: Arc<dyn Reranker> = Arc::new(StaticReranker::new(rules.clone()));
        let strict = searcher(&store, Some(reranker))
            .search("alice", "balk rules", DisciplineLevel::Strict)
            .await
            .unwrap();
        assert_eq!(strict.results.len(), 1, "0.1-scored chunk filtered at strict");

        let reranker: Arc<dyn Reranker> = Arc::new(StaticReranker::new(rules));
        let exploration = searcher(&store, Some(reranker))
            .search("alice", "balk rules", DisciplineLevel::Exploration)
            .await
            .unwrap();
        assert!(exploration.results.len() >= 2);
        assert!(exploration.results[0].text.contains("balk"));
    }

    #[tokio::test]
    async fn reranker_failure_degrades_to_rrf() {
        let store = Store::in_memory(DIM).unwrap();
        seed(&store).await;
        let reranker: Arc<dyn Reranker> = Arc::new(StaticReranker::failing());
        let out = searcher(&store, Some(reranker))
            .search("alice", "balk rules", DisciplineLevel::Moderate)
            .await
            .unwrap();
        assert!(out.rerank_degraded);
        assert!(!out.results.is_empty());
        assert!(out.results[0].text.contains("balk"));
    }

    #[tokio::test]
    async fn all_below_threshold_returns_empty() {
        let store = Store::in_memory(DIM).unwrap();
        seed(&store).await;
        let reranker: Arc<dyn Reranker> = Arc::new(StaticReranker::new(vec![]));
        let out = searcher(&store, Some(reranker))
            .search("alice", "balk rules", DisciplineLevel::Strict)
            .await
            .unwrap();
        assert!(out.results.is_empty());
    }

    #[tokio::test]
    async fn results_are_scoped_to_the_querying_user() {
        let store = Store::in_memory(DIM).unwrap();
        seed(&store).await;
        let out = searcher(&store, None)
            .search("bob", "balk rules", DisciplineLevel::Exploration)
            .await
            .unwrap();
        assert!(out.results.is_empty(), "bob has no corpus");
    }
}
