// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation and message operations.
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::{
    BucketedConversation, Conversation, ConversationBucket, MessageRecord, MessageRole,
    NewMessage, Result, Store, StoreError,
};

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Fatal(format!("bad timestamp '{s}': {e}")))
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, Option<String>, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn build_conversation(
    (id, user_id, title, created, updated): (String, String, Option<String>, String, String),
) -> Result<Conversation> {
    Ok(Conversation {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Fatal(e.to_string()))?,
        user_id,
        title,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

impl Store {
    pub async fn create_conversation(
        &self,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<Conversation> {
        Self::require_scope(user_id)?;
        let now = Utc::now();
        let conv = Conversation {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            title: title.map(String::from),
            created_at: now,
            updated_at: now,
        };
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![conv.id.to_string(), conv.user_id, conv.title, ts(now), ts(now)],
        )?;
        Ok(conv)
    }

    pub async fn get_conversation(&self, user_id: &str, id: Uuid) -> Result<Conversation> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let raw = conn.query_row(
            "SELECT id, user_id, title, created_at, updated_at
             FROM conversations WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id],
            conversation_from_row,
        )?;
        build_conversation(raw)
    }

    /// List conversations newest-first, each annotated with its age bucket
    /// relative to `now` — the **caller's** wall clock, so repeated calls
    /// with the same `now` paginate deterministically.
    pub async fn list_conversations(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<BucketedConversation>> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, created_at, updated_at
             FROM conversations WHERE user_id = ?1
             ORDER BY updated_at DESC, id",
        )?;
        let rows = stmt.query_map(params![user_id], conversation_from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            let conv = build_conversation(raw?)?;
            let bucket = bucket_for(conv.updated_at, now);
            out.push(BucketedConversation { bucket, conversation: conv });
        }
        Ok(out)
    }

    /// Set the title once; an already-assigned title is never overwritten.
    pub async fn set_title_if_absent(&self, user_id: &str, id: Uuid, title: &str) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        conn.execute(
            "UPDATE conversations SET title = ?3
             WHERE id = ?1 AND user_id = ?2 AND title IS NULL",
            params![id.to_string(), user_id, title],
        )?;
        Ok(())
    }

    /// Hard delete: messages cascade, and source rows referencing them go
    /// with them.
    pub async fn delete_conversation(&self, user_id: &str, id: Uuid) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let n = conn.execute(
            "DELETE FROM conversations WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Append a message and bump the conversation's `updated_at`.
    pub async fn append_message(
        &self,
        user_id: &str,
        conversation_id: Uuid,
        msg: NewMessage,
    ) -> Result<MessageRecord> {
        Self::require_scope(user_id)?;
        let now = Utc::now();
        let record = MessageRecord {
            id: Uuid::new_v4(),
            conversation_id,
            user_id: user_id.to_string(),
            role: msg.role,
            content: msg.content,
            created_at: now,
            agent_tag: msg.agent_tag,
            model_tag: msg.model_tag,
            input_tokens: msg.input_tokens,
            output_tokens: msg.output_tokens,
            latency_ms: msg.latency_ms,
            citations: msg.citations,
        };
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        let owned: i64 = tx.query_row(
            "SELECT COUNT(*) FROM conversations WHERE id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), user_id],
            |row| row.get(0),
        )?;
        if owned == 0 {
            return Err(StoreError::NotFound);
        }
        tx.execute(
            "INSERT INTO messages (id, conversation_id, user_id, role, content, created_at,
                                   agent_tag, model_tag, input_tokens, output_tokens,
                                   latency_ms, citations)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id.to_string(),
                conversation_id.to_string(),
                user_id,
                record.role.as_str(),
                record.content,
                ts(now),
                record.agent_tag,
                record.model_tag,
                record.input_tokens,
                record.output_tokens,
                record.latency_ms.map(|v| v as i64),
                record.citations.as_ref().map(|c| c.to_string()),
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET updated_at = ?3 WHERE id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), user_id, ts(now)],
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Last `k` messages of a conversation in chronological order.
    /// Ordering is total: `created_at` then message id (lexicographic).
    pub async fn last_messages(
        &self,
        user_id: &str,
        conversation_id: Uuid,
        k: usize,
    ) -> Result<Vec<MessageRecord>> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at, agent_tag, model_tag,
                    input_tokens, output_tokens, latency_ms, citations
             FROM messages
             WHERE conversation_id = ?1 AND user_id = ?2
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![conversation_id.to_string(), user_id, k as i64],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<u32>>(7)?,
                    row.get::<_, Option<u32>>(8)?,
                    row.get::<_, Option<i64>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            },
        )?;
        let mut out = Vec::new();
        for raw in rows {
            let (id, conv, role, content, created, agent, model, inp, outp, lat, cits) = raw?;
            out.push(MessageRecord {
                id: Uuid::parse_str(&id).map_err(|e| StoreError::Fatal(e.to_string()))?,
                conversation_id: Uuid::parse_str(&conv)
                    .map_err(|e| StoreError::Fatal(e.to_string()))?,
                user_id: user_id.to_string(),
                role: MessageRole::parse(&role)
                    .ok_or_else(|| StoreError::Fatal(format!("bad role '{role}'")))?,
                content,
                created_at: parse_ts(&created)?,
                agent_tag: agent,
                model_tag: model,
                input_tokens: inp,
                output_tokens: outp,
                latency_ms: lat.map(|v| v as u64),
                citations: cits.and_then(|c| serde_json::from_str(&c).ok()),
            });
        }
        out.reverse();
        Ok(out)
    }
}

/// Bucket a conversation's last activity relative to the caller's `now`.
fn bucket_for(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> ConversationBucket {
    let today = now.date_naive();
    let date = updated_at.date_naive();
    if date == today {
        ConversationBucket::Today
    } else if date == today - Duration::days(1) {
        ConversationBucket::Yesterday
    } else if date > today - Duration::days(7) {
        ConversationBucket::PriorWeek
    } else {
        ConversationBucket::Older
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::in_memory(4).unwrap()
    }

    fn user_msg(content: &str) -> NewMessage {
        NewMessage {
            role: MessageRole::User,
            content: content.into(),
            agent_tag: None,
            model_tag: None,
            input_tokens: None,
            output_tokens: None,
            latency_ms: None,
            citations: None,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let s = store();
        let c = s.create_conversation("alice", Some("Title")).await.unwrap();
        let got = s.get_conversation("alice", c.id).await.unwrap();
        assert_eq!(got.id, c.id);
        assert_eq!(got.title.as_deref(), Some("Title"));
    }

    #[tokio::test]
    async fn other_user_cannot_see_conversation() {
        let s = store();
        let c = s.create_conversation("alice", None).await.unwrap();
        let err = s.get_conversation("bob", c.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn title_is_set_once_and_never_replaced() {
        let s = store();
        let c = s.create_conversation("alice", None).await.unwrap();
        s.set_title_if_absent("alice", c.id, "first").await.unwrap();
        s.set_title_if_absent("alice", c.id, "second").await.unwrap();
        let got = s.get_conversation("alice", c.id).await.unwrap();
        assert_eq!(got.title.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn append_and_read_back_in_order() {
        let s = store();
        let c = s.create_conversation("alice", None).await.unwrap();
        for i in 0..5 {
            s.append_message("alice", c.id, user_msg(&format!("m{i}"))).await.unwrap();
        }
        let msgs = s.last_messages("alice", c.id, 3).await.unwrap();
        let contents: Vec<_> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn append_to_foreign_conversation_is_not_found() {
        let s = store();
        let c = s.create_conversation("alice", None).await.unwrap();
        let err = s.append_message("bob", c.id, user_msg("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn delete_cascades_messages() {
        let s = store();
        let c = s.create_conversation("alice", None).await.unwrap();
        s.append_message("alice", c.id, user_msg("hello")).await.unwrap();
        s.delete_conversation("alice", c.id).await.unwrap();
        let msgs = s.last_messages("alice", c.id, 10).await.unwrap();
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn listing_buckets_by_caller_clock() {
        let s = store();
        s.create_conversation("alice", Some("today")).await.unwrap();
        let listed = s.list_conversations("alice", Utc::now()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].bucket, ConversationBucket::Today);
        // Same rows viewed from eight days in the future land in Older.
        let future = Utc::now() + Duration::days(8);
        let listed = s.list_conversations("alice", future).await.unwrap();
        assert_eq!(listed[0].bucket, ConversationBucket::Older);
    }

    #[test]
    fn bucket_boundaries() {
        let now = Utc::now();
        assert_eq!(bucket_for(now, now), ConversationBucket::Today);
        assert_eq!(bucket_for(now - Duration::days(1), now), ConversationBucket::Yesterday);
        assert_eq!(bucket_for(now - Duration::days(3), now), ConversationBucket::PriorWeek);
        assert_eq!(bucket_for(now - Duration::days(30), now), ConversationBucket::Older);
    }
}
