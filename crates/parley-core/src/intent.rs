// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Plan decision for a user turn.
//!
//! A keyword heuristic, not a classifier call: it completes in microseconds
//! and always fits the orchestrator deadlines. Tie-break order: tabular when
//! a binding exists and the question smells of aggregation (or follows a
//! tabular turn), else retrieval when documents exist, else direct.

/// The per-turn plan tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Plan {
    pub use_retrieval: bool,
    pub use_tabular: bool,
    pub use_research: bool,
}

/// Everything the heuristic may consult besides the text itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanInputs {
    pub has_ready_documents: bool,
    pub has_active_binding: bool,
    pub research_available: bool,
    /// The previous assistant turn came from the tabular branch.
    pub last_turn_was_tabular: bool,
}

const AGGREGATION_KEYWORDS: &[&str] = &[
    "how many",
    "count",
    "average",
    "avg",
    "sum of",
    "total",
    "maximum",
    "minimum",
    "highest",
    "lowest",
    "top ",
    "group by",
    "per month",
    "per year",
    "per customer",
    "percentage",
    "trend",
];

const RESEARCH_KEYWORDS: &[&str] = &[
    "research",
    "write a report",
    "deep dive",
    "literature review",
    "investigate",
    "comprehensive overview",
];

pub fn classify(text: &str, inputs: PlanInputs) -> Plan {
    let lower = text.to_lowercase();

    if inputs.research_available && RESEARCH_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Plan { use_research: true, ..Default::default() };
    }

    let tabular_signal = AGGREGATION_KEYWORDS.iter().any(|k| lower.contains(k))
        || inputs.last_turn_was_tabular;
    if inputs.has_active_binding && tabular_signal {
        return Plan { use_tabular: true, ..Default::default() };
    }

    if inputs.has_ready_documents {
        return Plan { use_retrieval: true, ..Default::default() };
    }

    Plan::default()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_question_with_no_assets_is_direct() {
        let plan = classify("what's a balk?", PlanInputs::default());
        assert_eq!(plan, Plan::default());
    }

    #[test]
    fn documents_pull_toward_retrieval() {
        let plan = classify(
            "what's a balk?",
            PlanInputs { has_ready_documents: true, ..Default::default() },
        );
        assert!(plan.use_retrieval);
        assert!(!plan.use_tabular);
    }

    #[test]
    fn aggregation_with_binding_prefers_tabular_over_retrieval() {
        let plan = classify(
            "how many orders did we get last month?",
            PlanInputs {
                has_ready_documents: true,
                has_active_binding: true,
                ..Default::default()
            },
        );
        assert!(plan.use_tabular);
        assert!(!plan.use_retrieval);
    }

    #[test]
    fn aggregation_without_binding_falls_back_to_retrieval() {
        let plan = classify(
            "how many orders did we get last month?",
            PlanInputs { has_ready_documents: true, ..Default::default() },
        );
        assert!(plan.use_retrieval);
        assert!(!plan.use_tabular);
    }

    #[test]
    fn tabular_follow_up_stays_tabular() {
        let plan = classify(
            "and broken down by region?",
            PlanInputs {
                has_active_binding: true,
                last_turn_was_tabular: true,
                ..Default::default()
            },
        );
        assert!(plan.use_tabular);
    }

    #[test]
    fn research_keywords_win_when_available() {
        let plan = classify(
            "please research the history of the balk rule",
            PlanInputs {
                has_ready_documents: true,
                has_active_binding: true,
                research_available: true,
                ..Default::default()
            },
        );
        assert!(plan.use_research);
        assert!(!plan.use_tabular);
    }

    #[test]
    fn research_keywords_ignored_when_feature_disabled() {
        let plan = classify(
            "please research the history of the balk rule",
            PlanInputs { has_ready_documents: true, ..Default::default() },
        );
        assert!(!plan.use_research);
        assert!(plan.use_retrieval);
    }
}
