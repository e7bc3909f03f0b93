// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Conversation service helpers: history windowing and title derivation.

/// Messages loaded into the prompt per turn.
pub const HISTORY_WINDOW: usize = 20;

const TITLE_MAX_CHARS: usize = 60;

/// Derive a conversation title from the first user turn: whitespace
/// collapsed, cut at a word boundary, ellipsis when truncated. Assigned once
/// and never silently changed afterwards.
pub fn derive_title(first_user_text: &str) -> String {
    let collapsed: String = first_user_text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return "New conversation".to_string();
    }
    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(TITLE_MAX_CHARS).collect();
    let trimmed = match cut.rfind(' ') {
        Some(pos) if pos > TITLE_MAX_CHARS / 2 => &cut[..pos],
        _ => cut.as_str(),
    };
    format!("{}…", trimmed.trim_end_matches([',', '.', ';', ':']))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
