// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Age bucket for conversation listing, computed against the caller's wall
/// clock so pagination stays deterministic for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationBucket {
    Today,
    Yesterday,
    PriorWeek,
    Older,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketedConversation {
    pub bucket: ConversationBucket,
    #[serde(flatten)]
    pub conversation: Conversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub agent_tag: Option<String>,
    pub model_tag: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: Option<u64>,
    /// Citation list as stored (JSON array), opaque to the store.
    pub citations: Option<serde_json::Value>,
}

/// Input for [`crate::Store::append_message`]; server-assigned fields are
/// filled by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub agent_tag: Option<String>,
    pub model_tag: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: Option<u64>,
    pub citations: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub user_id: String,
    pub display_name: String,
    pub mime_tag: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub status: DocumentStatus,
    pub chunk_count: i64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: i64,
    pub document_id: Uuid,
    pub user_id: String,
    pub ordinal: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub token_count: i64,
    pub page: Option<i64>,
    pub offset_start: i64,
    pub offset_end: i64,
}

/// Chunk input for the atomic bulk insert; ordinals must be contiguous from
/// zero within the document.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub ordinal: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub token_count: i64,
    pub page: Option<i64>,
    pub offset_start: i64,
    pub offset_end: i64,
}

/// A dense or lexical candidate: chunk id plus the branch score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: i64,
    /// Position within its document; the final fusion tie-break key.
    pub ordinal: i64,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingStatus {
    Validating,
    Active,
    Failed,
}

impl BindingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validating" => Some(Self::Validating),
            "active" => Some(Self::Active),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub id: Uuid,
    pub user_id: String,
    pub display_name: String,
    pub engine_tag: String,
    /// AES-256-GCM ciphertext; plaintext never enters the store.
    #[serde(skip_serializing)]
    pub credential_blob: Vec<u8>,
    pub status: BindingStatus,
    pub schema_snapshot: serde_json::Value,
    pub last_validated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Status ordering used to enforce monotone transitions
    /// (`pending → running → complete/failed`).
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Complete | Self::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchJob {
    pub id: Uuid,
    pub user_id: String,
    pub topic: String,
    pub depth: String,
    pub status: JobStatus,
    pub progress_percent: i64,
    pub plan_outline: Option<String>,
    pub word_count: Option<i64>,
    pub final_artifact: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSection {
    pub job_id: Uuid,
    pub ordinal: i64,
    pub heading: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: Uuid,
    pub user_id: String,
    pub job_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub credibility_score: i64,
    pub publisher_tag: String,
    pub retrieved_at: DateTime<Utc>,
}

/// Per-model token/cost split inside a usage record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub yyyy_mm: String,
    /// Minor units (ten-thousandths of a dollar).
    pub total_cost: i64,
    pub by_model: std::collections::BTreeMap<String, ModelUsage>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: String,
    pub default_model_tag: Option<String>,
    pub per_agent_overrides: serde_json::Value,
    /// `None` → the configured default cap applies.
    pub monthly_budget: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Fact,
    Preference,
    Insight,
    Event,
}

impl MemoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Insight => "insight",
            Self::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fact" => Some(Self::Fact),
            "preference" => Some(Self::Preference),
            "insight" => Some(Self::Insight),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryFact {
    pub id: Uuid,
    pub user_id: String,
    pub kind: MemoryKind,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabularHistoryEntry {
    pub id: Uuid,
    pub user_id: String,
    pub binding_id: Uuid,
    pub question: String,
    pub generated_sql: Option<String>,
    pub row_count: Option<i64>,
    pub wall_ms: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
