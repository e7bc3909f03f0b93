// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SQLite schema and migrations.
//!
//! Every table that holds user data carries a `user_id` column; the store
//! layer adds a `user_id = ?` predicate to every statement it runs. Chunks
//! get an FTS5 shadow table kept in sync by triggers, queried with BM25
//! ranking for the lexical half of hybrid retrieval.

/// Current schema version. Bump together with a migration entry.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub const CHECK_SCHEMA_SQL: &str =
    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_meta'";

pub const GET_VERSION_SQL: &str = "SELECT value FROM schema_meta WHERE key = 'version'";

pub const SET_VERSION_SQL: &str =
    "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('version', ?1)";

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id         TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    title      TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations (user_id, updated_at);

CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
    user_id         TEXT NOT NULL,
    role            TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content         TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    agent_tag       TEXT,
    model_tag       TEXT,
    input_tokens    INTEGER,
    output_tokens   INTEGER,
    latency_ms      INTEGER,
    citations       TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id, created_at, id);

CREATE TABLE IF NOT EXISTS documents (
    id           TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL,
    display_name TEXT NOT NULL,
    mime_tag     TEXT NOT NULL,
    size_bytes   INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    status       TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'ready', 'failed')),
    chunk_count  INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    processed_at TEXT,
    error        TEXT
);
CREATE INDEX IF NOT EXISTS idx_documents_user ON documents (user_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_dedup ON documents (user_id, content_hash);

CREATE TABLE IF NOT EXISTS chunks (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id  TEXT NOT NULL REFERENCES documents (id) ON DELETE CASCADE,
    user_id      TEXT NOT NULL,
    ordinal      INTEGER NOT NULL,
    content      TEXT NOT NULL,
    embedding    BLOB NOT NULL,
    token_count  INTEGER NOT NULL,
    page         INTEGER,
    offset_start INTEGER NOT NULL,
    offset_end   INTEGER NOT NULL,
    UNIQUE (document_id, ordinal)
);
CREATE INDEX IF NOT EXISTS idx_chunks_user ON chunks (user_id);

-- FTS5 shadow table for BM25 lexical retrieval, kept in sync by triggers.
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    content,
    content = 'chunks',
    content_rowid = 'id'
);

CREATE TRIGGER IF NOT EXISTS chunks_fts_insert AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts (rowid, content) VALUES (new.id, new.content);
END;

CREATE TRIGGER IF NOT EXISTS chunks_fts_delete AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts (chunks_fts, rowid, content) VALUES ('delete', old.id, old.content);
END;

CREATE TRIGGER IF NOT EXISTS chunks_fts_update AFTER UPDATE ON chunks BEGIN
    INSERT INTO chunks_fts (chunks_fts, rowid, content) VALUES ('delete', old.id, old.content);
    INSERT INTO chunks_fts (rowid, content) VALUES (new.id, new.content);
END;

CREATE TABLE IF NOT EXISTS bindings (
    id                TEXT PRIMARY KEY,
    user_id           TEXT NOT NULL,
    display_name      TEXT NOT NULL,
    engine_tag        TEXT NOT NULL,
    credential_blob   BLOB NOT NULL,
    status            TEXT NOT NULL CHECK (status IN ('validating', 'active', 'failed')),
    schema_snapshot   TEXT NOT NULL DEFAULT '{}',
    last_validated_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_bindings_user ON bindings (user_id);

CREATE TABLE IF NOT EXISTS research_jobs (
    id               TEXT PRIMARY KEY,
    user_id          TEXT NOT NULL,
    topic            TEXT NOT NULL,
    depth            TEXT NOT NULL CHECK (depth IN ('quick', 'standard', 'deep')),
    status           TEXT NOT NULL CHECK (status IN ('pending', 'running', 'complete', 'failed')),
    progress_percent INTEGER NOT NULL DEFAULT 0,
    plan_outline     TEXT,
    word_count       INTEGER,
    final_artifact   TEXT,
    error            TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_research_jobs_user ON research_jobs (user_id, created_at);

CREATE TABLE IF NOT EXISTS research_sections (
    job_id  TEXT NOT NULL REFERENCES research_jobs (id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    heading TEXT NOT NULL,
    content TEXT NOT NULL,
    PRIMARY KEY (job_id, ordinal)
);

-- A source row is referenced by either a job or a message; when the referrer
-- is deleted the cascade removes the orphan.
CREATE TABLE IF NOT EXISTS sources (
    id                TEXT PRIMARY KEY,
    user_id           TEXT NOT NULL,
    job_id            TEXT REFERENCES research_jobs (id) ON DELETE CASCADE,
    message_id        TEXT REFERENCES messages (id) ON DELETE CASCADE,
    url               TEXT NOT NULL,
    title             TEXT,
    snippet           TEXT,
    credibility_score INTEGER NOT NULL,
    publisher_tag     TEXT NOT NULL,
    retrieved_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sources_job ON sources (job_id);

CREATE TABLE IF NOT EXISTS usage_records (
    user_id    TEXT NOT NULL,
    yyyy_mm    TEXT NOT NULL,
    total_cost INTEGER NOT NULL DEFAULT 0,
    by_model   TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, yyyy_mm)
);

CREATE TABLE IF NOT EXISTS user_settings (
    user_id             TEXT PRIMARY KEY,
    default_model_tag   TEXT,
    per_agent_overrides TEXT NOT NULL DEFAULT '{}',
    monthly_budget      INTEGER
);

CREATE TABLE IF NOT EXISTS memory_facts (
    id         TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    kind       TEXT NOT NULL CHECK (kind IN ('fact', 'preference', 'insight', 'event')),
    content    TEXT NOT NULL,
    embedding  BLOB NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memory_user ON memory_facts (user_id);

CREATE TABLE IF NOT EXISTS tabular_history (
    id            TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    binding_id    TEXT NOT NULL,
    question      TEXT NOT NULL,
    generated_sql TEXT,
    row_count     INTEGER,
    wall_ms       INTEGER,
    error         TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tabular_history_user ON tabular_history (user_id, created_at);
"#;

/// A schema migration step.
pub struct Migration {
    pub version: u32,
    pub sql: &'static str,
}

/// Migrations to run when opening a store whose version is older than
/// [`CURRENT_SCHEMA_VERSION`]. Empty at version 1.
pub fn migrations_from(_current: u32) -> &'static [Migration] {
    &[]
}
