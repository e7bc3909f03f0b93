// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The seam to the user's external database.
//!
//! Concrete engines live outside the core; the planner only needs schema
//! introspection and bounded read-only execution. Engines register by tag
//! and every query runs with a statement timeout on its own connection, so
//! one slow query never holds another turn's work.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::TabularError;

/// Opaque structured summary of the bound database's schema, captured at
/// validation time and embedded into generation prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub columns: Vec<String>,
}

impl SchemaSnapshot {
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    /// Compact one-line-per-table rendering for generation prompts.
    pub fn prompt_block(&self) -> String {
        self.tables
            .iter()
            .map(|t| format!("{}({})", t.name, t.columns.join(", ")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Result set from a bounded execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// One external database engine (`postgres`, `mysql`, …).
#[async_trait]
pub trait ExternalDatabase: Send + Sync {
    fn engine_tag(&self) -> &str;

    /// Connect with the given credential and capture a schema snapshot.
    async fn introspect(&self, credential: &str) -> Result<SchemaSnapshot, TabularError>;

    /// Execute a validated read-only statement with a server-side statement
    /// timeout. The row cap has already been injected as a `LIMIT`.
    async fn execute(
        &self,
        credential: &str,
        sql: &str,
        timeout: Duration,
    ) -> Result<TableRows, TabularError>;
}

/// Registry of available engines, keyed by `engine_tag`.
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn ExternalDatabase>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Arc<dyn ExternalDatabase>) {
        self.engines.insert(engine.engine_tag().to_string(), engine);
    }

    pub fn get(&self, engine_tag: &str) -> Result<Arc<dyn ExternalDatabase>, TabularError> {
        self.engines
            .get(engine_tag)
            .cloned()
            .ok_or_else(|| TabularError::Connection(format!("unknown engine '{engine_tag}'")))
    }
}

/// In-memory engine for tests: a fixed snapshot and scripted responses.
pub struct MockDatabase {
    snapshot: SchemaSnapshot,
    /// Rows returned for any executed statement.
    pub rows: TableRows,
    /// Simulate a statement that outlives its timeout.
    pub hang: bool,
    /// Simulate an execution failure.
    pub fail_execution: Option<String>,
    /// Record of every statement that reached the engine.
    pub executed: std::sync::Mutex<Vec<String>>,
}

impl MockDatabase {
    pub fn new(snapshot: SchemaSnapshot) -> Self {
        Self {
            snapshot,
            rows: TableRows {
                columns: vec!["count".into()],
                rows: vec![vec![serde_json::json!(42)]],
            },
            hang: false,
            fail_execution: None,
            executed: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ExternalDatabase for MockDatabase {
    fn engine_tag(&self) -> &str {
        "mock"
    }

    async fn introspect(&self, _credential: &str) -> Result<SchemaSnapshot, TabularError> {
        Ok(self.snapshot.clone())
    }

    async fn execute(
        &self,
        _credential: &str,
        sql: &str,
        timeout: Duration,
    ) -> Result<TableRows, TabularError> {
        self.executed.lock().unwrap().push(sql.to_string());
        if self.hang {
            tokio::time::sleep(timeout).await;
            return Err(TabularError::ExecutionTimeout);
        }
        if let Some(msg) = &self.fail_execution {
            return Err(TabularError::Execution(msg.clone()));
        }
        Ok(self.rows.clone())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_by_tag() {
        let mut reg = EngineRegistry::new();
        reg.register(Arc::new(MockDatabase::new(SchemaSnapshot::default())));
        assert!(reg.get("mock").is_ok());
        assert!(reg.get("postgres").is_err());
    }

    #[test]
    fn snapshot_prompt_block_is_one_line_per_table() {
        let snap = SchemaSnapshot {
            tables: vec![TableSummary {
                name: "orders".into(),
                columns: vec!["id".into(), "total".into()],
            }],
        };
        assert_eq!(snap.prompt_block(), "orders(id, total)");
    }
}
