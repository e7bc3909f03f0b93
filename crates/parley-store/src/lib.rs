// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Storage gateway — the single entry point for persistent reads and writes.
//!
//! Every operation takes an explicit `user_id` and every SQL statement the
//! gateway runs carries a `user_id = ?` predicate, so no cross-user read is
//! expressible. Operations with an empty user scope are rejected outright
//! with [`StoreError::ScopeViolation`].
//!
//! Backed by SQLite (WAL, foreign keys, FTS5 for the lexical chunk index).
//! The connection is owned behind an async mutex; every public method is a
//! suspension point for the caller.

mod accounts;
mod conversations;
mod documents;
mod error;
mod research;
pub mod schema;
mod types;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::error;

pub use error::{Result, StoreError};
pub use types::*;

/// The storage gateway. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    /// Embedding dimension accepted by the chunk and memory tables.
    dimension: usize,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::Fatal(format!("opening database: {e}")))?;
        Self::from_connection(conn, dimension)
    }

    /// In-memory store for tests.
    pub fn in_memory(dimension: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Fatal(format!("opening in-memory database: {e}")))?;
        Self::from_connection(conn, dimension)
    }

    fn from_connection(conn: Connection, dimension: usize) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        let _: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;

        let initialized: i64 = conn.query_row(schema::CHECK_SCHEMA_SQL, [], |row| row.get(0))?;
        if initialized == 0 {
            conn.execute_batch(schema::SCHEMA_SQL)?;
            conn.execute(
                schema::SET_VERSION_SQL,
                rusqlite::params![schema::CURRENT_SCHEMA_VERSION.to_string()],
            )?;
        } else {
            let version: Option<String> = conn
                .query_row(schema::GET_VERSION_SQL, [], |row| row.get(0))
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            let current: u32 = version.and_then(|v| v.parse().ok()).unwrap_or(0);
            if current < schema::CURRENT_SCHEMA_VERSION {
                for m in schema::migrations_from(current) {
                    conn.execute_batch(m.sql)?;
                }
                conn.execute(
                    schema::SET_VERSION_SQL,
                    rusqlite::params![schema::CURRENT_SCHEMA_VERSION.to_string()],
                )?;
            }
        }

        Ok(Self { conn: Arc::new(Mutex::new(conn)), dimension })
    }

    /// Embedding dimension this corpus was opened with.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Reject operations that arrive without a user scope.
    pub(crate) fn require_scope(user_id: &str) -> Result<()> {
        if user_id.trim().is_empty() {
            error!("storage operation rejected: missing user scope");
            return Err(StoreError::ScopeViolation);
        }
        Ok(())
    }

    pub(crate) fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(StoreError::Fatal(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }
        Ok(())
    }

    /// Remove every row owned by `user_id` (account deletion cascade).
    pub async fn delete_user_data(&self, user_id: &str) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        for sql in [
            "DELETE FROM conversations WHERE user_id = ?1",
            "DELETE FROM documents WHERE user_id = ?1",
            "DELETE FROM bindings WHERE user_id = ?1",
            "DELETE FROM research_jobs WHERE user_id = ?1",
            "DELETE FROM sources WHERE user_id = ?1",
            "DELETE FROM usage_records WHERE user_id = ?1",
            "DELETE FROM user_settings WHERE user_id = ?1",
            "DELETE FROM memory_facts WHERE user_id = ?1",
            "DELETE FROM tabular_history WHERE user_id = ?1",
        ] {
            conn.execute(sql, rusqlite::params![user_id])?;
        }
        Ok(())
    }
}

/// Encode an embedding as a little-endian f32 blob.
pub(crate) fn encode_embedding(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Decode a little-endian f32 blob.
pub(crate) fn decode_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity between two equal-length vectors.
pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        na += f64::from(*x) * f64::from(*x);
        nb += f64::from(*y) * f64::from(*y);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_blob_round_trips() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)), v);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn empty_user_scope_is_rejected() {
        let store = Store::in_memory(4).unwrap();
        let err = store.delete_user_data("").await.unwrap_err();
        assert!(matches!(err, StoreError::ScopeViolation));
    }

    #[tokio::test]
    async fn open_is_idempotent_on_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.db");
        drop(Store::open(&path, 4).unwrap());
        // Reopening must not re-run the schema or lose the version.
        let s = Store::open(&path, 4).unwrap();
        assert_eq!(s.dimension(), 4);
    }
}
