// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use parley_retrieval::Citation;

/// Stable error codes exposed to clients. A closed set; the session layer
/// serializes these verbatim into `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    RateLimited,
    BudgetExceeded,
    Validation,
    NotFound,
    Conflict,
    UpstreamUnavailable,
    TabularUnsafe,
    TabularExecution,
    Internal,
}

/// Payload kind of a `tool_result` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultKind {
    Sql,
    Retrieval,
    Research,
}

/// Terminal statistics for a turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnStats {
    pub model_tag: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub cost_minor: i64,
}

/// Events emitted by the orchestrator during a single turn. The session
/// layer maps these one-to-one onto wire frames, preserving order.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// The turn has been admitted and planned.
    Started { agent_tag: &'static str },
    /// A text chunk streamed from the model.
    TextDelta(String),
    /// Ordered citation list for the streamed answer.
    Citations(Vec<Citation>),
    /// Sub-agent progress (research subtopics, ingestion, …).
    Progress { percent: i64, note: String },
    /// A sub-agent produced a structured result.
    ToolResult { kind: ToolResultKind, payload: serde_json::Value },
    /// Month-to-date spend crossed the warning fraction.
    BudgetWarning { percent_used: u8, cap_minor: i64 },
    /// A recoverable or terminal error; terminal ones are followed by `Ended`.
    Error { code: ErrorCode, message: String },
    /// The turn is over. Exactly one per started turn.
    Ended { stats: TurnStats, cancelled: bool },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::BudgetExceeded).unwrap(),
            "\"budget_exceeded\""
        );
        assert_eq!(serde_json::to_string(&ErrorCode::TabularUnsafe).unwrap(), "\"tabular_unsafe\"");
    }

    #[test]
    fn tool_result_kinds_serialize_snake_case() {
        assert_eq!(serde_json::to_string(&ToolResultKind::Sql).unwrap(), "\"sql\"");
    }
}
