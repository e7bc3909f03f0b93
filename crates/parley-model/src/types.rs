// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// A single message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: text.into() }
    }

    /// Approximate token count (4-chars-per-token heuristic).
    pub fn approx_tokens(&self) -> usize {
        (self.content.len() / 4).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Request sent to a chat provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// `None` keeps the provider default.
    pub max_tokens: Option<u32>,
    /// Ignored for models whose catalog entry says temperature is fixed.
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn approx_input_tokens(&self) -> usize {
        self.messages.iter().map(ChatMessage::approx_tokens).sum()
    }
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    MaxTokens,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text delta streamed from the model.
    TextDelta(String),
    /// Final token counts. Providers may report input and output tokens in
    /// separate events; consumers fold them together.
    Usage { input_tokens: u32, output_tokens: u32 },
    /// The stream finished.
    Done(FinishReason),
    /// A recoverable mid-stream error (the stream continues or ends early).
    Error(String),
}

/// Token usage for one completed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn fold(&mut self, input: u32, output: u32) {
        if input > 0 {
            self.input_tokens = input;
        }
        if output > 0 {
            self.output_tokens = output;
        }
    }
}

/// Per-invocation metering record reported upstream to the budget governor.
#[derive(Debug, Clone)]
pub struct Metering {
    pub model_tag: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Cost in minor units (ten-thousandths of a dollar).
    pub cost_minor: i64,
    pub wall_ms: u64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::user("u").role, Role::User);
        assert_eq!(ChatMessage::assistant("a").role, Role::Assistant);
    }

    #[test]
    fn approx_tokens_divides_by_four_with_floor_of_one() {
        assert_eq!(ChatMessage::user("12345678").approx_tokens(), 2);
        assert_eq!(ChatMessage::user("x").approx_tokens(), 1);
    }

    #[test]
    fn request_input_tokens_sums_messages() {
        let req = CompletionRequest {
            messages: vec![ChatMessage::system("12345678"), ChatMessage::user("abcd")],
            ..Default::default()
        };
        assert_eq!(req.approx_input_tokens(), 3);
    }

    #[test]
    fn usage_fold_keeps_nonzero_halves() {
        let mut u = Usage::default();
        u.fold(100, 0);
        u.fold(0, 42);
        assert_eq!(u, Usage { input_tokens: 100, output_tokens: 42 });
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }
}
