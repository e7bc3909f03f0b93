// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Document ingestion: hash, dedup, chunk, embed, atomic write.
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use parley_model::{Metering, ModelGateway};
use parley_store::{Document, DocumentStatus, NewChunk, Store};

use crate::{chunker::Chunker, RetrievalError};

/// Result of an upload: the (possibly pre-existing) document plus billing.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub document: Document,
    /// The bytes matched an existing ready document; nothing was written.
    pub deduplicated: bool,
    pub meterings: Vec<Metering>,
}

pub struct Ingestor {
    store: Store,
    gateway: Arc<ModelGateway>,
    chunker: Chunker,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(store: Store, gateway: Arc<ModelGateway>, batch_size: usize) -> Self {
        Self { store, gateway, chunker: Chunker::default(), batch_size: batch_size.max(1) }
    }

    #[cfg(test)]
    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    /// Ingest raw upload bytes. Format-specific parsing is out of scope;
    /// bytes are decoded as UTF-8 (lossy) and must yield non-empty text.
    pub async fn ingest_bytes(
        &self,
        user_id: &str,
        display_name: &str,
        bytes: &[u8],
    ) -> Result<IngestOutcome, RetrievalError> {
        let text = String::from_utf8_lossy(bytes);
        self.ingest_text(user_id, display_name, &text).await
    }

    /// Ingest plain text (also used for completed research reports).
    pub async fn ingest_text(
        &self,
        user_id: &str,
        display_name: &str,
        text: &str,
    ) -> Result<IngestOutcome, RetrievalError> {
        if text.trim().is_empty() {
            return Err(RetrievalError::EmptyDocument);
        }

        let content_hash = hex::encode(Sha256::digest(text.as_bytes()));

        // Per-user dedup: identical bytes return the existing ready document.
        if let Some(existing) = self.store.find_document_by_hash(user_id, &content_hash).await? {
            if existing.status == DocumentStatus::Ready {
                info!(user = %user_id, document = %existing.id, "dedup hit, reusing document");
                return Ok(IngestOutcome {
                    document: existing,
                    deduplicated: true,
                    meterings: Vec::new(),
                });
            }
            // A previous attempt left a non-ready row; retry in place.
            warn!(user = %user_id, document = %existing.id, "reprocessing failed upload");
            return self.process(user_id, existing, text).await;
        }

        let document = self
            .store
            .create_document(
                user_id,
                display_name,
                mime_tag_for(display_name),
                text.len() as i64,
                &content_hash,
            )
            .await?;
        self.process(user_id, document, text).await
    }

    async fn process(
        &self,
        user_id: &str,
        document: Document,
        text: &str,
    ) -> Result<IngestOutcome, RetrievalError> {
        self.store
            .set_document_status(user_id, document.id, DocumentStatus::Processing, None)
            .await?;

        let spans = self.chunker.chunk(text);
        if spans.is_empty() {
            self.store
                .set_document_status(user_id, document.id, DocumentStatus::Failed, Some("empty content"))
                .await?;
            return Err(RetrievalError::EmptyDocument);
        }

        // All chunks of a document embed successfully or the document fails;
        // partially embedded documents are never written.
        let mut meterings = Vec::new();
        let mut chunks: Vec<NewChunk> = Vec::with_capacity(spans.len());
        for batch in spans.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|s| s.text.clone()).collect();
            let embedded = match self.gateway.embed(&texts).await {
                Ok(e) => e,
                Err(e) => {
                    self.store
                        .set_document_status(
                            user_id,
                            document.id,
                            DocumentStatus::Failed,
                            Some("embedding failed"),
                        )
                        .await?;
                    return Err(RetrievalError::Embedding(e));
                }
            };
            meterings.push(embedded.metering);
            for (span, vector) in batch.iter().zip(embedded.vectors) {
                chunks.push(NewChunk {
                    ordinal: span.ordinal,
                    content: span.text.clone(),
                    embedding: vector,
                    token_count: span.token_count,
                    page: None,
                    offset_start: span.offset_start,
                    offset_end: span.offset_end,
                });
            }
        }

        self.store.insert_chunks_atomic(user_id, document.id, &chunks).await?;
        let document = self.store.get_document(user_id, document.id).await?;
        info!(
            user = %user_id,
            document = %document.id,
            chunks = document.chunk_count,
            "document ready",
        );
        Ok(IngestOutcome { document, deduplicated: false, meterings })
    }
}

/// MIME tag from the file name alone; content sniffing is out of scope.
fn mime_tag_for(name: &str) -> &'static str {
    match name.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("csv") => "text/csv",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_model::mock::{MockChatProvider, MockEmbedder};
    use parley_model::ChatProvider;

    const DIM: usize = 32;

    fn harness() -> (Store, Ingestor) {
        let store = Store::in_memory(DIM).unwrap();
        let gateway = Arc::new(ModelGateway::with_providers(
            vec![("default".into(), Arc::new(MockChatProvider) as Arc<dyn ChatProvider>)],
            Arc::new(MockEmbedder::new(DIM)),
        ));
        let ingestor = Ingestor::new(store.clone(), gateway, 8);
        (store, ingestor)
    }

    #[tokio::test]
    async fn ingest_produces_ready_document_with_chunks() {
        let (store, ingestor) = harness();
        let out = ingestor
            .ingest_bytes("alice", "a.txt", b"a perfectly reasonable document body")
            .await
            .unwrap();
        assert!(!out.deduplicated);
        assert_eq!(out.document.status, DocumentStatus::Ready);
        assert_eq!(out.document.chunk_count, 1);
        assert!(!out.meterings.is_empty());
        let chunks = store.chunks_for_document("alice", out.document.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let (_, ingestor) = harness();
        let err = ingestor.ingest_bytes("alice", "a.txt", b"   ").await.unwrap_err();
        assert!(matches!(err, RetrievalError::EmptyDocument));
    }

    #[tokio::test]
    async fn same_bytes_twice_dedup_to_one_document() {
        let (store, ingestor) = harness();
        let body = b"identical bytes uploaded under two names";
        let first = ingestor.ingest_bytes("alice", "a.txt", body).await.unwrap();
        let second = ingestor.ingest_bytes("alice", "b.txt", body).await.unwrap();
        assert_eq!(first.document.id, second.document.id);
        assert!(second.deduplicated);
        assert_eq!(store.list_documents("alice").await.unwrap().len(), 1);
        assert_eq!(second.document.chunk_count, first.document.chunk_count);
    }

    #[tokio::test]
    async fn dedup_is_per_user() {
        let (store, ingestor) = harness();
        let body = b"shared bytes between two different users";
        ingestor.ingest_bytes("alice", "a.txt", body).await.unwrap();
        let bob = ingestor.ingest_bytes("bob", "a.txt", body).await.unwrap();
        assert!(!bob.deduplicated);
        assert_eq!(store.list_documents("bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn long_document_chunks_contiguously() {
        let (store, ingestor) = harness();
        let body = "A sentence with a bit of real content in it. ".repeat(800);
        let out = ingestor.ingest_text("alice", "long.txt", &body).await.unwrap();
        assert!(out.document.chunk_count > 1);
        let chunks = store.chunks_for_document("alice", out.document.id).await.unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i as i64);
        }
        assert_eq!(chunks.len() as i64, out.document.chunk_count);
    }

    #[test]
    fn mime_tags_from_extension() {
        assert_eq!(mime_tag_for("notes.txt"), "text/plain");
        assert_eq!(mime_tag_for("Report.MD"), "text/markdown");
        assert_eq!(mime_tag_for("blob"), "application/octet-stream");
    }
}
