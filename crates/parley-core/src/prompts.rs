// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Prompt assembly.
//!
//! The system prompt has a strict section order: persona, temporal context,
//! document inventory, memory (only when non-empty), approach rules, data
//! accuracy rules (strict form under rag-only), then retrieved context and
//! tabular results. Order is part of the behavioural contract and is pinned
//! by tests.

pub const PERSONA: &str = "You are a careful, direct assistant. You answer from the material \
you are given and you say plainly when you do not know.";

const APPROACH_RULES: &str = "Approach:\n\
- Lead with the answer, then supporting detail.\n\
- Challenge vague or ambiguous requests, except when the user is emotionally \
processing, stating a preference, stating identity, or setting boundaries.\n\
- Only surface remembered facts when directly relevant.\n\
- Cite sources only when the user asks for citations, using [n] markers that \
match the citation list exactly.";

const ACCURACY_RULES: &str = "Data accuracy:\n\
- Never invent numbers, quotes, or citations.\n\
- Distinguish clearly between retrieved material and general knowledge.";

const ACCURACY_RULES_STRICT: &str = "Data accuracy (strict):\n\
- Answer ONLY from the retrieved context below.\n\
- If the retrieved context does not contain the answer, say so; do not fall \
back to general knowledge.\n\
- Never invent numbers, quotes, or citations.";

/// Inputs for one turn's system prompt.
#[derive(Debug, Default)]
pub struct PromptInputs {
    pub temporal_block: String,
    /// One line per ready document, or empty when the user has none.
    pub document_inventory: String,
    pub memory_block: String,
    pub rag_only: bool,
    pub retrieved_context: String,
    pub tabular_block: String,
}

pub fn build_system_prompt(inputs: &PromptInputs) -> String {
    let mut out = String::from(PERSONA);

    // Rag-only nulls out the non-retrieval context to reduce leakage; the
    // model is still not trusted, the instruction is advisory.
    if !inputs.rag_only && !inputs.temporal_block.is_empty() {
        out.push_str("\n\n");
        out.push_str(&inputs.temporal_block);
    }

    if !inputs.document_inventory.is_empty() {
        out.push_str("\n\nThe user's documents:\n");
        out.push_str(&inputs.document_inventory);
    }

    if !inputs.rag_only && !inputs.memory_block.is_empty() {
        out.push_str("\n\nRemembered about this user:\n");
        out.push_str(&inputs.memory_block);
    }

    out.push_str("\n\n");
    out.push_str(APPROACH_RULES);

    out.push_str("\n\n");
    out.push_str(if inputs.rag_only { ACCURACY_RULES_STRICT } else { ACCURACY_RULES });

    if !inputs.retrieved_context.is_empty() {
        out.push_str("\n\nRetrieved context:\n");
        out.push_str(&inputs.retrieved_context);
    }

    if !inputs.tabular_block.is_empty() {
        out.push_str("\n\nQuery results from the user's database:\n");
        out.push_str(&inputs.tabular_block);
    }

    out
}

/// Render retrieved chunks with their citation numbers.
pub fn retrieved_context_block(results: &[parley_retrieval::RetrievedChunk]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[{}] ({}) {}", i + 1, r.document_name, r.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn full_inputs() -> PromptInputs {
        PromptInputs {
            temporal_block: "Current time: afternoon.".into(),
            document_inventory: "- a.txt (ready)".into(),
            memory_block: "preference:\n- short answers".into(),
            rag_only: false,
            retrieved_context: "[1] (a.txt) the balk rule".into(),
            tabular_block: "count: 42".into(),
        }
    }

    #[test]
    fn sections_appear_in_contract_order() {
        let prompt = build_system_prompt(&full_inputs());
        let positions: Vec<usize> = [
            "careful, direct assistant",
            "Current time",
            "The user's documents",
            "Remembered about this user",
            "Approach:",
            "Data accuracy:",
            "Retrieved context:",
            "Query results",
        ]
        .iter()
        .map(|needle| prompt.find(needle).unwrap_or_else(|| panic!("missing {needle}")))
        .collect();
        for pair in positions.windows(2) {
            assert!(pair[0] < pair[1], "section order violated");
        }
    }

    #[test]
    fn empty_memory_block_is_omitted() {
        let mut inputs = full_inputs();
        inputs.memory_block.clear();
        let prompt = build_system_prompt(&inputs);
        assert!(!prompt.contains("Remembered about this user"));
    }

    #[test]
    fn rag_only_uses_strict_rules_and_drops_ambient_context() {
        let mut inputs = full_inputs();
        inputs.rag_only = true;
        let prompt = build_system_prompt(&inputs);
        assert!(prompt.contains("Data accuracy (strict)"));
        assert!(!prompt.contains("Current time"));
        assert!(!prompt.contains("Remembered about this user"));
        assert!(prompt.contains("Retrieved context:"), "retrieval context is kept");
    }
}
