// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between clients and the server.
//!
//! Frames are self-contained JSON objects discriminated by a `kind` field,
//! sent as WebSocket text frames.
//!
//! # Typical turn flow
//!
//! ```text
//! Client                               Server
//!   │                                    │
//!   │── chat {conversation_id, text} ───►│
//!   │◄─ turn_started {turn_id, agent} ───│
//!   │◄─ text_delta × N ──────────────────│
//!   │◄─ citations {list} ────────────────│   (when retrieval ran)
//!   │◄─ turn_ended {stats} ──────────────│
//!   │                                    │
//!   │── cancel {turn_id} ───────────────►│   (any time mid-turn)
//!   │◄─ turn_ended {cancelled: true} ────│
//! ```
//!
//! Delivery guarantees per turn: frames arrive in emission order,
//! `turn_started` first, `turn_ended` last and exactly once, and no frame
//! of a turn follows its `turn_ended`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parley_core::{ErrorCode, ToolResultKind, TurnOptions, TurnStats};
use parley_retrieval::Citation;

/// Frames sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Submit one user message to a conversation.
    Chat {
        conversation_id: Uuid,
        content: String,
        #[serde(default)]
        options: TurnOptions,
    },
    /// Cancel the identified in-flight turn.
    Cancel { turn_id: Uuid },
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    TurnStarted {
        turn_id: Uuid,
        agent_tag: String,
    },
    TextDelta {
        turn_id: Uuid,
        text: String,
    },
    Citations {
        turn_id: Uuid,
        list: Vec<Citation>,
    },
    Progress {
        turn_id: Uuid,
        percent: i64,
        note: String,
    },
    ToolResult {
        turn_id: Uuid,
        #[serde(rename = "tool_kind")]
        kind: ToolResultKind,
        payload: serde_json::Value,
    },
    /// Not turn-scoped; may precede `turn_started`.
    BudgetWarning {
        percent_used: u8,
        cap: i64,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        turn_id: Option<Uuid>,
        code: ErrorCode,
        message: String,
    },
    TurnEnded {
        turn_id: Uuid,
        stats: TurnStats,
        cancelled: bool,
    },
}

impl ServerFrame {
    /// Map an orchestrator event into its wire frame.
    pub fn from_event(turn_id: Uuid, ev: parley_core::TurnEvent) -> Self {
        use parley_core::TurnEvent;
        match ev {
            TurnEvent::Started { agent_tag } => {
                Self::TurnStarted { turn_id, agent_tag: agent_tag.to_string() }
            }
            TurnEvent::TextDelta(text) => Self::TextDelta { turn_id, text },
            TurnEvent::Citations(list) => Self::Citations { turn_id, list },
            TurnEvent::Progress { percent, note } => Self::Progress { turn_id, percent, note },
            TurnEvent::ToolResult { kind, payload } => {
                Self::ToolResult { turn_id, kind, payload }
            }
            TurnEvent::BudgetWarning { percent_used, cap_minor } => {
                Self::BudgetWarning { percent_used, cap: cap_minor }
            }
            TurnEvent::Error { code, message } => {
                Self::Error { turn_id: Some(turn_id), code, message }
            }
            TurnEvent::Ended { stats, cancelled } => {
                Self::TurnEnded { turn_id, stats, cancelled }
            }
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
