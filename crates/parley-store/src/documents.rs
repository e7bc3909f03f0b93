// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Document and chunk operations, including the two retrieval scans.
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::{
    cosine, decode_embedding, encode_embedding, ChunkRecord, Document, DocumentStatus, NewChunk,
    Result, ScoredChunk, Store, StoreError,
};

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Fatal(format!("bad timestamp '{s}': {e}")))
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<DocRow> {
    Ok(DocRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        display_name: row.get(2)?,
        mime_tag: row.get(3)?,
        size_bytes: row.get(4)?,
        content_hash: row.get(5)?,
        status: row.get(6)?,
        chunk_count: row.get(7)?,
        created_at: row.get(8)?,
        processed_at: row.get(9)?,
        error: row.get(10)?,
    })
}

struct DocRow {
    id: String,
    user_id: String,
    display_name: String,
    mime_tag: String,
    size_bytes: i64,
    content_hash: String,
    status: String,
    chunk_count: i64,
    created_at: String,
    processed_at: Option<String>,
    error: Option<String>,
}

const DOC_COLUMNS: &str = "id, user_id, display_name, mime_tag, size_bytes, content_hash, \
                           status, chunk_count, created_at, processed_at, error";

fn build_document(r: DocRow) -> Result<Document> {
    Ok(Document {
        id: Uuid::parse_str(&r.id).map_err(|e| StoreError::Fatal(e.to_string()))?,
        user_id: r.user_id,
        display_name: r.display_name,
        mime_tag: r.mime_tag,
        size_bytes: r.size_bytes,
        content_hash: r.content_hash,
        status: DocumentStatus::parse(&r.status)
            .ok_or_else(|| StoreError::Fatal(format!("bad status '{}'", r.status)))?,
        chunk_count: r.chunk_count,
        created_at: parse_ts(&r.created_at)?,
        processed_at: r.processed_at.as_deref().map(parse_ts).transpose()?,
        error: r.error,
    })
}

impl Store {
    /// Look up a ready document with this content hash (per-user dedup).
    pub async fn find_document_by_hash(
        &self,
        user_id: &str,
        content_hash: &str,
    ) -> Result<Option<Document>> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOC_COLUMNS} FROM documents WHERE user_id = ?1 AND content_hash = ?2"
        ))?;
        let mut rows = stmt.query_map(params![user_id, content_hash], document_from_row)?;
        match rows.next() {
            Some(raw) => Ok(Some(build_document(raw?)?)),
            None => Ok(None),
        }
    }

    pub async fn create_document(
        &self,
        user_id: &str,
        display_name: &str,
        mime_tag: &str,
        size_bytes: i64,
        content_hash: &str,
    ) -> Result<Document> {
        Self::require_scope(user_id)?;
        let now = Utc::now();
        let doc = Document {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            mime_tag: mime_tag.to_string(),
            size_bytes,
            content_hash: content_hash.to_string(),
            status: DocumentStatus::Pending,
            chunk_count: 0,
            created_at: now,
            processed_at: None,
            error: None,
        };
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO documents (id, user_id, display_name, mime_tag, size_bytes,
                                    content_hash, status, chunk_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7)",
            params![
                doc.id.to_string(),
                user_id,
                display_name,
                mime_tag,
                size_bytes,
                content_hash,
                ts(now)
            ],
        )?;
        Ok(doc)
    }

    pub async fn get_document(&self, user_id: &str, id: Uuid) -> Result<Document> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let raw = conn.query_row(
            &format!("SELECT {DOC_COLUMNS} FROM documents WHERE id = ?1 AND user_id = ?2"),
            params![id.to_string(), user_id],
            document_from_row,
        )?;
        build_document(raw)
    }

    pub async fn list_documents(&self, user_id: &str) -> Result<Vec<Document>> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOC_COLUMNS} FROM documents WHERE user_id = ?1 ORDER BY created_at DESC, id"
        ))?;
        let rows = stmt.query_map(params![user_id], document_from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(build_document(raw?)?);
        }
        Ok(out)
    }

    /// Mark a document `processing` or `failed`. `ready` is only reachable
    /// through [`Store::insert_chunks_atomic`].
    pub async fn set_document_status(
        &self,
        user_id: &str,
        id: Uuid,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        Self::require_scope(user_id)?;
        if status == DocumentStatus::Ready {
            return Err(StoreError::Fatal(
                "ready is set atomically with chunk insertion".into(),
            ));
        }
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE documents SET status = ?3, error = ?4 WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id, status.as_str(), error],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn delete_document(&self, user_id: &str, id: Uuid) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let n = conn.execute(
            "DELETE FROM documents WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Insert all chunks of a document and mark it `ready` in one
    /// transaction. Ordinals must be contiguous from zero; embeddings must
    /// match the corpus dimension. On any error nothing is written.
    pub async fn insert_chunks_atomic(
        &self,
        user_id: &str,
        document_id: Uuid,
        chunks: &[NewChunk],
    ) -> Result<()> {
        Self::require_scope(user_id)?;
        for (i, c) in chunks.iter().enumerate() {
            self.check_dimension(&c.embedding)?;
            if c.ordinal != i as i64 {
                return Err(StoreError::Fatal(format!(
                    "non-contiguous chunk ordinal {} at position {i}",
                    c.ordinal
                )));
            }
        }
        let now = Utc::now();
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        let owned: i64 = tx.query_row(
            "SELECT COUNT(*) FROM documents WHERE id = ?1 AND user_id = ?2",
            params![document_id.to_string(), user_id],
            |row| row.get(0),
        )?;
        if owned == 0 {
            return Err(StoreError::NotFound);
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (document_id, user_id, ordinal, content, embedding,
                                     token_count, page, offset_start, offset_end)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for c in chunks {
                stmt.execute(params![
                    document_id.to_string(),
                    user_id,
                    c.ordinal,
                    c.content,
                    encode_embedding(&c.embedding),
                    c.token_count,
                    c.page,
                    c.offset_start,
                    c.offset_end,
                ])?;
            }
        }
        tx.execute(
            "UPDATE documents SET status = 'ready', chunk_count = ?3, processed_at = ?4, error = NULL
             WHERE id = ?1 AND user_id = ?2",
            params![document_id.to_string(), user_id, chunks.len() as i64, ts(now)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All chunks of a document in ordinal order. A document without chunks
    /// yields `NotFound` — callers must not observe a chunk-less `ready`.
    pub async fn chunks_for_document(
        &self,
        user_id: &str,
        document_id: Uuid,
    ) -> Result<Vec<ChunkRecord>> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, ordinal, content, embedding, token_count, page,
                    offset_start, offset_end
             FROM chunks WHERE document_id = ?1 AND user_id = ?2 ORDER BY ordinal",
        )?;
        let rows = stmt.query_map(params![document_id.to_string(), user_id], chunk_from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(build_chunk(raw?, user_id)?);
        }
        if out.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(out)
    }

    /// Fetch specific chunks by id, still user-scoped.
    pub async fn chunks_by_ids(&self, user_id: &str, ids: &[i64]) -> Result<Vec<ChunkRecord>> {
        Self::require_scope(user_id)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock().await;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, document_id, ordinal, content, embedding, token_count, page,
                    offset_start, offset_end
             FROM chunks WHERE user_id = ? AND id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];
        for id in ids {
            params_vec.push(Box::new(*id));
        }
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
            chunk_from_row,
        )?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(build_chunk(raw?, user_id)?);
        }
        // Preserve the requested order.
        out.sort_by_key(|c| ids.iter().position(|id| *id == c.id).unwrap_or(usize::MAX));
        Ok(out)
    }

    /// Dense k-NN: cosine similarity over the user's ready chunks.
    ///
    /// Brute force over the scoped corpus; candidates are bounded by the
    /// user's document set, and only `top_n` survive.
    pub async fn dense_candidates(
        &self,
        user_id: &str,
        query: &[f32],
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>> {
        Self::require_scope(user_id)?;
        self.check_dimension(query)?;
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.ordinal, c.embedding
             FROM chunks c JOIN documents d ON d.id = c.document_id
             WHERE c.user_id = ?1 AND d.status = 'ready'",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, Vec<u8>>(2)?))
        })?;
        let mut scored = Vec::new();
        for raw in rows {
            let (id, ordinal, blob) = raw?;
            let emb = decode_embedding(&blob);
            scored.push(ScoredChunk { chunk_id: id, ordinal, score: cosine(query, &emb) });
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(top_n);
        Ok(scored)
    }

    /// Lexical candidates: BM25 over the FTS5 index, restricted to the
    /// user's ready chunks. Returns an empty list when the query has no
    /// indexable tokens.
    pub async fn lexical_candidates(
        &self,
        user_id: &str,
        query_text: &str,
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>> {
        Self::require_scope(user_id)?;
        let Some(match_expr) = fts_query(query_text) else {
            return Ok(Vec::new());
        };
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.ordinal, bm25(chunks_fts) AS rank
             FROM chunks_fts
             JOIN chunks c ON c.id = chunks_fts.rowid
             JOIN documents d ON d.id = c.document_id
             WHERE chunks_fts MATCH ?1 AND c.user_id = ?2 AND d.status = 'ready'
             ORDER BY rank
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![match_expr, user_id, top_n as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, f64>(2)?))
        })?;
        let mut out = Vec::new();
        for raw in rows {
            let (id, ordinal, rank) = raw?;
            // bm25() is negative with better matches more negative; flip it
            // so higher means more relevant like the dense score.
            out.push(ScoredChunk { chunk_id: id, ordinal, score: -rank });
        }
        Ok(out)
    }

    /// Total chunk row count (test support for the ingestion invariant).
    pub async fn chunk_row_count(&self) -> Result<i64> {
        let conn = self.lock().await;
        Ok(conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?)
    }
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<ChunkRaw> {
    Ok(ChunkRaw {
        id: row.get(0)?,
        document_id: row.get(1)?,
        ordinal: row.get(2)?,
        content: row.get(3)?,
        embedding: row.get(4)?,
        token_count: row.get(5)?,
        page: row.get(6)?,
        offset_start: row.get(7)?,
        offset_end: row.get(8)?,
    })
}

struct ChunkRaw {
    id: i64,
    document_id: String,
    ordinal: i64,
    content: String,
    embedding: Vec<u8>,
    token_count: i64,
    page: Option<i64>,
    offset_start: i64,
    offset_end: i64,
}

fn build_chunk(r: ChunkRaw, user_id: &str) -> Result<ChunkRecord> {
    Ok(ChunkRecord {
        id: r.id,
        document_id: Uuid::parse_str(&r.document_id)
            .map_err(|e| StoreError::Fatal(e.to_string()))?,
        user_id: user_id.to_string(),
        ordinal: r.ordinal,
        content: r.content,
        embedding: decode_embedding(&r.embedding),
        token_count: r.token_count,
        page: r.page,
        offset_start: r.offset_start,
        offset_end: r.offset_end,
    })
}

/// Build an FTS5 MATCH expression from free text: alphanumeric tokens,
/// quoted, OR-joined. `None` when nothing indexable remains.
fn fts_query(text: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 4;

    fn store() -> Store {
        Store::in_memory(DIM).unwrap()
    }

    fn chunk(ordinal: i64, content: &str, embedding: [f32; DIM]) -> NewChunk {
        NewChunk {
            ordinal,
            content: content.into(),
            embedding: embedding.to_vec(),
            token_count: (content.len() / 4).max(1) as i64,
            page: None,
            offset_start: 0,
            offset_end: content.len() as i64,
        }
    }

    async fn ready_doc(s: &Store, user: &str, name: &str, chunks: Vec<NewChunk>) -> Document {
        let doc = s.create_document(user, name, "text/plain", 10, name).await.unwrap();
        s.insert_chunks_atomic(user, doc.id, &chunks).await.unwrap();
        s.get_document(user, doc.id).await.unwrap()
    }

    #[tokio::test]
    async fn chunk_insert_marks_ready_and_counts() {
        let s = store();
        let doc = ready_doc(
            &s,
            "alice",
            "a.txt",
            vec![chunk(0, "first", [1.0, 0.0, 0.0, 0.0]), chunk(1, "second", [0.0, 1.0, 0.0, 0.0])],
        )
        .await;
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert_eq!(doc.chunk_count, 2);
        let chunks = s.chunks_for_document("alice", doc.id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].ordinal, 0);
    }

    #[tokio::test]
    async fn wrong_dimension_fails_fast_and_writes_nothing() {
        let s = store();
        let doc = s.create_document("alice", "a.txt", "text/plain", 10, "h").await.unwrap();
        let bad = NewChunk {
            ordinal: 0,
            content: "x".into(),
            embedding: vec![1.0; DIM + 1],
            token_count: 1,
            page: None,
            offset_start: 0,
            offset_end: 1,
        };
        assert!(s.insert_chunks_atomic("alice", doc.id, &[bad]).await.is_err());
        let doc = s.get_document("alice", doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(doc.chunk_count, 0);
    }

    #[tokio::test]
    async fn non_contiguous_ordinals_rejected() {
        let s = store();
        let doc = s.create_document("alice", "a.txt", "text/plain", 10, "h").await.unwrap();
        let err = s
            .insert_chunks_atomic(
                "alice",
                doc.id,
                &[chunk(0, "a", [1.0, 0.0, 0.0, 0.0]), chunk(2, "b", [0.0, 1.0, 0.0, 0.0])],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_)));
    }

    #[tokio::test]
    async fn chunkless_document_yields_not_found() {
        let s = store();
        let doc = s.create_document("alice", "a.txt", "text/plain", 10, "h").await.unwrap();
        let err = s.chunks_for_document("alice", doc.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn dedup_lookup_finds_same_hash_same_user_only() {
        let s = store();
        ready_doc(&s, "alice", "hash-1", vec![chunk(0, "text", [1.0, 0.0, 0.0, 0.0])]).await;
        assert!(s.find_document_by_hash("alice", "hash-1").await.unwrap().is_some());
        assert!(s.find_document_by_hash("bob", "hash-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dense_search_is_scoped_and_ranked() {
        let s = store();
        ready_doc(&s, "alice", "a", vec![
            chunk(0, "close", [1.0, 0.0, 0.0, 0.0]),
            chunk(1, "far", [0.0, 1.0, 0.0, 0.0]),
        ])
        .await;
        ready_doc(&s, "bob", "b", vec![chunk(0, "other user", [1.0, 0.0, 0.0, 0.0])]).await;

        let hits = s.dense_candidates("alice", &[1.0, 0.0, 0.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 2, "bob's chunk must not appear");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn lexical_search_matches_content_and_respects_scope() {
        let s = store();
        ready_doc(&s, "alice", "a", vec![
            chunk(0, "the pitcher's balk occurs when the motion stops", [1.0, 0.0, 0.0, 0.0]),
            chunk(1, "an unrelated topic of the same length entirely", [0.0, 1.0, 0.0, 0.0]),
        ])
        .await;
        let hits = s.lexical_candidates("alice", "balk rules", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        let hits = s.lexical_candidates("bob", "balk rules", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn lexical_search_with_no_tokens_is_empty() {
        let s = store();
        let hits = s.lexical_candidates("alice", "!!! ...", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_document_cascades_chunks_and_fts() {
        let s = store();
        let doc =
            ready_doc(&s, "alice", "a", vec![chunk(0, "searchable words", [1.0, 0.0, 0.0, 0.0])])
                .await;
        s.delete_document("alice", doc.id).await.unwrap();
        assert_eq!(s.chunk_row_count().await.unwrap(), 0);
        let hits = s.lexical_candidates("alice", "searchable", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn fts_query_quotes_and_joins() {
        assert_eq!(fts_query("balk rules"), Some("\"balk\" OR \"rules\"".into()));
        assert_eq!(fts_query("...!!!"), None);
    }
}
