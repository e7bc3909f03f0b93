// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Usage accounting, settings, memory facts, bindings and tabular history.
use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::{
    cosine, decode_embedding, encode_embedding, Binding, BindingStatus, MemoryFact, MemoryKind,
    ModelUsage, Result, Store, StoreError, TabularHistoryEntry, UsageRecord, UserSettings,
};

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Fatal(format!("bad timestamp '{s}': {e}")))
}

impl Store {
    // ── Usage ─────────────────────────────────────────────────────────────────

    pub async fn usage_record(&self, user_id: &str, yyyy_mm: &str) -> Result<Option<UsageRecord>> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let row = conn
            .query_row(
                "SELECT total_cost, by_model, updated_at FROM usage_records
                 WHERE user_id = ?1 AND yyyy_mm = ?2",
                params![user_id, yyyy_mm],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::from(other)),
            })?;
        match row {
            None => Ok(None),
            Some((total, by_model, updated)) => Ok(Some(UsageRecord {
                user_id: user_id.to_string(),
                yyyy_mm: yyyy_mm.to_string(),
                total_cost: total,
                by_model: serde_json::from_str(&by_model)
                    .map_err(|e| StoreError::Fatal(format!("bad by_model json: {e}")))?,
                updated_at: parse_ts(&updated)?,
            })),
        }
    }

    /// Atomic read-modify-write of the `(user_id, yyyy_mm)` usage row.
    ///
    /// There is exactly one row per pair; the first write creates it. The
    /// whole fold happens inside one transaction while the connection lock
    /// is held, so concurrent calls serialize.
    pub async fn record_usage(
        &self,
        user_id: &str,
        yyyy_mm: &str,
        cost_minor: i64,
        model_tag: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<UsageRecord> {
        Self::require_scope(user_id)?;
        let now = Utc::now();
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT total_cost, by_model FROM usage_records
                 WHERE user_id = ?1 AND yyyy_mm = ?2",
                params![user_id, yyyy_mm],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::from(other)),
            })?;

        let (mut total, mut by_model): (i64, BTreeMap<String, ModelUsage>) = match existing {
            Some((t, j)) => (
                t,
                serde_json::from_str(&j)
                    .map_err(|e| StoreError::Fatal(format!("bad by_model json: {e}")))?,
            ),
            None => (0, BTreeMap::new()),
        };
        total += cost_minor;
        let entry = by_model.entry(model_tag.to_string()).or_default();
        entry.input_tokens += input_tokens;
        entry.output_tokens += output_tokens;
        entry.cost += cost_minor;

        let json = serde_json::to_string(&by_model)
            .map_err(|e| StoreError::Fatal(format!("encoding by_model: {e}")))?;
        tx.execute(
            "INSERT INTO usage_records (user_id, yyyy_mm, total_cost, by_model, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (user_id, yyyy_mm)
             DO UPDATE SET total_cost = ?3, by_model = ?4, updated_at = ?5",
            params![user_id, yyyy_mm, total, json, ts(now)],
        )?;
        tx.commit()?;
        Ok(UsageRecord {
            user_id: user_id.to_string(),
            yyyy_mm: yyyy_mm.to_string(),
            total_cost: total,
            by_model,
            updated_at: now,
        })
    }

    // ── Settings ──────────────────────────────────────────────────────────────

    /// Settings for a user; absent rows imply defaults.
    pub async fn get_settings(&self, user_id: &str) -> Result<UserSettings> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let row = conn
            .query_row(
                "SELECT default_model_tag, per_agent_overrides, monthly_budget
                 FROM user_settings WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::from(other)),
            })?;
        match row {
            None => Ok(UserSettings {
                user_id: user_id.to_string(),
                default_model_tag: None,
                per_agent_overrides: serde_json::json!({}),
                monthly_budget: None,
            }),
            Some((tag, overrides, budget)) => Ok(UserSettings {
                user_id: user_id.to_string(),
                default_model_tag: tag,
                per_agent_overrides: serde_json::from_str(&overrides)
                    .unwrap_or_else(|_| serde_json::json!({})),
                monthly_budget: budget,
            }),
        }
    }

    pub async fn update_settings(&self, user_id: &str, settings: &UserSettings) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO user_settings (user_id, default_model_tag, per_agent_overrides, monthly_budget)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id)
             DO UPDATE SET default_model_tag = ?2, per_agent_overrides = ?3, monthly_budget = ?4",
            params![
                user_id,
                settings.default_model_tag,
                settings.per_agent_overrides.to_string(),
                settings.monthly_budget,
            ],
        )?;
        Ok(())
    }

    // ── Memory facts ──────────────────────────────────────────────────────────

    pub async fn add_memory_fact(
        &self,
        user_id: &str,
        kind: MemoryKind,
        content: &str,
        embedding: &[f32],
    ) -> Result<MemoryFact> {
        Self::require_scope(user_id)?;
        self.check_dimension(embedding)?;
        let now = Utc::now();
        let fact = MemoryFact {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            kind,
            content: content.to_string(),
            embedding: embedding.to_vec(),
            created_at: now,
        };
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO memory_facts (id, user_id, kind, content, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                fact.id.to_string(),
                user_id,
                kind.as_str(),
                content,
                encode_embedding(embedding),
                ts(now)
            ],
        )?;
        Ok(fact)
    }

    /// The user's memory facts most similar to the query embedding, highest
    /// similarity first, filtered by `min_similarity`.
    pub async fn similar_memories(
        &self,
        user_id: &str,
        query: &[f32],
        top_n: usize,
        min_similarity: f64,
    ) -> Result<Vec<(MemoryFact, f64)>> {
        Self::require_scope(user_id)?;
        self.check_dimension(query)?;
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, kind, content, embedding, created_at
             FROM memory_facts WHERE user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut scored = Vec::new();
        for raw in rows {
            let (id, kind, content, blob, created) = raw?;
            let embedding = decode_embedding(&blob);
            let sim = cosine(query, &embedding);
            if sim < min_similarity {
                continue;
            }
            scored.push((
                MemoryFact {
                    id: Uuid::parse_str(&id).map_err(|e| StoreError::Fatal(e.to_string()))?,
                    user_id: user_id.to_string(),
                    kind: MemoryKind::parse(&kind)
                        .ok_or_else(|| StoreError::Fatal(format!("bad kind '{kind}'")))?,
                    content,
                    embedding,
                    created_at: parse_ts(&created)?,
                },
                sim,
            ));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_n);
        Ok(scored)
    }

    // ── Tabular bindings ──────────────────────────────────────────────────────

    pub async fn create_binding(
        &self,
        user_id: &str,
        display_name: &str,
        engine_tag: &str,
        credential_blob: &[u8],
    ) -> Result<Binding> {
        Self::require_scope(user_id)?;
        let binding = Binding {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            engine_tag: engine_tag.to_string(),
            credential_blob: credential_blob.to_vec(),
            status: BindingStatus::Validating,
            schema_snapshot: serde_json::json!({}),
            last_validated_at: None,
        };
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO bindings (id, user_id, display_name, engine_tag, credential_blob, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'validating')",
            params![binding.id.to_string(), user_id, display_name, engine_tag, credential_blob],
        )?;
        Ok(binding)
    }

    pub async fn get_binding(&self, user_id: &str, id: Uuid) -> Result<Binding> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let raw = conn.query_row(
            "SELECT id, display_name, engine_tag, credential_blob, status, schema_snapshot,
                    last_validated_at
             FROM bindings WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )?;
        let (id, name, engine, blob, status, snapshot, validated) = raw;
        Ok(Binding {
            id: Uuid::parse_str(&id).map_err(|e| StoreError::Fatal(e.to_string()))?,
            user_id: user_id.to_string(),
            display_name: name,
            engine_tag: engine,
            credential_blob: blob,
            status: BindingStatus::parse(&status)
                .ok_or_else(|| StoreError::Fatal(format!("bad status '{status}'")))?,
            schema_snapshot: serde_json::from_str(&snapshot)
                .unwrap_or_else(|_| serde_json::json!({})),
            last_validated_at: validated.as_deref().map(parse_ts).transpose()?,
        })
    }

    pub async fn list_bindings(&self, user_id: &str) -> Result<Vec<Binding>> {
        Self::require_scope(user_id)?;
        let ids: Vec<Uuid> = {
            let conn = self.lock().await;
            let mut stmt =
                conn.prepare("SELECT id FROM bindings WHERE user_id = ?1 ORDER BY display_name")?;
            let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for raw in rows {
                ids.push(
                    Uuid::parse_str(&raw?).map_err(|e| StoreError::Fatal(e.to_string()))?,
                );
            }
            ids
        };
        let mut out = Vec::new();
        for id in ids {
            out.push(self.get_binding(user_id, id).await?);
        }
        Ok(out)
    }

    pub async fn set_binding_status(
        &self,
        user_id: &str,
        id: Uuid,
        status: BindingStatus,
        schema_snapshot: Option<&serde_json::Value>,
    ) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE bindings
             SET status = ?3,
                 schema_snapshot = COALESCE(?4, schema_snapshot),
                 last_validated_at = ?5
             WHERE id = ?1 AND user_id = ?2",
            params![
                id.to_string(),
                user_id,
                status.as_str(),
                schema_snapshot.map(|s| s.to_string()),
                ts(Utc::now()),
            ],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn delete_binding(&self, user_id: &str, id: Uuid) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let n = conn.execute(
            "DELETE FROM bindings WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ── Tabular history ───────────────────────────────────────────────────────

    pub async fn append_tabular_history(
        &self,
        user_id: &str,
        entry: &TabularHistoryEntry,
    ) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO tabular_history (id, user_id, binding_id, question, generated_sql,
                                          row_count, wall_ms, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id.to_string(),
                user_id,
                entry.binding_id.to_string(),
                entry.question,
                entry.generated_sql,
                entry.row_count,
                entry.wall_ms.map(|v| v as i64),
                entry.error,
                ts(entry.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn tabular_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<TabularHistoryEntry>> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, binding_id, question, generated_sql, row_count, wall_ms, error, created_at
             FROM tabular_history WHERE user_id = ?1
             ORDER BY created_at DESC, id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for raw in rows {
            let (id, binding, question, sql, rows_n, wall, error, created) = raw?;
            out.push(TabularHistoryEntry {
                id: Uuid::parse_str(&id).map_err(|e| StoreError::Fatal(e.to_string()))?,
                user_id: user_id.to_string(),
                binding_id: Uuid::parse_str(&binding)
                    .map_err(|e| StoreError::Fatal(e.to_string()))?,
                question,
                generated_sql: sql,
                row_count: rows_n,
                wall_ms: wall.map(|v| v as u64),
                error,
                created_at: parse_ts(&created)?,
            });
        }
        Ok(out)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::in_memory(4).unwrap()
    }

    #[tokio::test]
    async fn usage_row_is_created_then_folded() {
        let s = store();
        let r = s.record_usage("alice", "2026-08", 50, "m1", 100, 200).await.unwrap();
        assert_eq!(r.total_cost, 50);
        let r = s.record_usage("alice", "2026-08", 25, "m1", 10, 20).await.unwrap();
        assert_eq!(r.total_cost, 75);
        let m = &r.by_model["m1"];
        assert_eq!(m.input_tokens, 110);
        assert_eq!(m.output_tokens, 220);
        assert_eq!(m.cost, 75);
    }

    #[tokio::test]
    async fn one_row_per_user_month() {
        let s = store();
        s.record_usage("alice", "2026-08", 1, "m", 1, 1).await.unwrap();
        s.record_usage("alice", "2026-08", 1, "m", 1, 1).await.unwrap();
        s.record_usage("alice", "2026-07", 1, "m", 1, 1).await.unwrap();
        assert_eq!(s.usage_record("alice", "2026-08").await.unwrap().unwrap().total_cost, 2);
        assert_eq!(s.usage_record("alice", "2026-07").await.unwrap().unwrap().total_cost, 1);
        assert!(s.usage_record("alice", "2026-06").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_is_user_scoped() {
        let s = store();
        s.record_usage("alice", "2026-08", 9, "m", 1, 1).await.unwrap();
        assert!(s.usage_record("bob", "2026-08").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn absent_settings_imply_defaults() {
        let s = store();
        let settings = s.get_settings("alice").await.unwrap();
        assert!(settings.default_model_tag.is_none());
        assert!(settings.monthly_budget.is_none());
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let s = store();
        let mut settings = s.get_settings("alice").await.unwrap();
        settings.default_model_tag = Some("fast".into());
        settings.monthly_budget = Some(100);
        s.update_settings("alice", &settings).await.unwrap();
        let got = s.get_settings("alice").await.unwrap();
        assert_eq!(got.default_model_tag.as_deref(), Some("fast"));
        assert_eq!(got.monthly_budget, Some(100));
    }

    #[tokio::test]
    async fn memory_similarity_filters_and_ranks() {
        let s = store();
        s.add_memory_fact("alice", MemoryKind::Preference, "likes brevity", &[1.0, 0.0, 0.0, 0.0])
            .await
            .unwrap();
        s.add_memory_fact("alice", MemoryKind::Fact, "works in finance", &[0.0, 1.0, 0.0, 0.0])
            .await
            .unwrap();
        let hits = s
            .similar_memories("alice", &[1.0, 0.0, 0.0, 0.0], 3, 0.82)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.content, "likes brevity");
    }

    #[tokio::test]
    async fn memory_is_user_scoped() {
        let s = store();
        s.add_memory_fact("alice", MemoryKind::Fact, "secret", &[1.0, 0.0, 0.0, 0.0])
            .await
            .unwrap();
        let hits = s.similar_memories("bob", &[1.0, 0.0, 0.0, 0.0], 3, 0.0).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn binding_lifecycle() {
        let s = store();
        let b = s.create_binding("alice", "warehouse", "postgres", b"cipher").await.unwrap();
        assert_eq!(b.status, BindingStatus::Validating);
        let snapshot = serde_json::json!({ "tables": ["orders"] });
        s.set_binding_status("alice", b.id, BindingStatus::Active, Some(&snapshot))
            .await
            .unwrap();
        let got = s.get_binding("alice", b.id).await.unwrap();
        assert_eq!(got.status, BindingStatus::Active);
        assert_eq!(got.schema_snapshot["tables"][0], "orders");
        assert_eq!(got.credential_blob, b"cipher");
        s.delete_binding("alice", b.id).await.unwrap();
        assert!(s.get_binding("alice", b.id).await.is_err());
    }

    #[tokio::test]
    async fn tabular_history_appends_and_lists() {
        let s = store();
        let entry = TabularHistoryEntry {
            id: Uuid::new_v4(),
            user_id: "alice".into(),
            binding_id: Uuid::new_v4(),
            question: "how many orders?".into(),
            generated_sql: Some("SELECT COUNT(*) FROM orders".into()),
            row_count: Some(1),
            wall_ms: Some(12),
            error: None,
            created_at: Utc::now(),
        };
        s.append_tabular_history("alice", &entry).await.unwrap();
        let listed = s.tabular_history("alice", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].question, "how many orders?");
        assert!(s.tabular_history("bob", 10).await.unwrap().is_empty());
    }
}
