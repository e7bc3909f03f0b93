// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static safety validation for generated SQL.
//!
//! The planner never interprets SQL semantically; it enforces three things
//! before anything reaches the external database:
//!   1. exactly one statement, and it is a `SELECT` (CTE prefixes allowed),
//!   2. no write/DDL/privilege keyword anywhere outside string literals,
//!   3. every referenced table exists in the binding's schema snapshot.
//!
//! The scan is a single bounded pass over the token stream — no parser
//! construction, no recursion.

use crate::executor::SchemaSnapshot;

/// Keywords that reject a statement outright wherever they appear.
const FORBIDDEN: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
    "COPY", "MERGE", "REPLACE", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "EXEC", "EXECUTE",
    "CALL", "INTO",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlToken {
    Word(String),
    Punct(char),
}

/// Tokenize SQL, skipping string literals, quoted identifiers and comments.
/// Returns `Err` for unterminated literals/comments (the statement does not
/// parse cleanly).
pub fn tokenize(sql: &str) -> Result<Vec<SqlToken>, String> {
    let mut tokens = Vec::new();
    let mut chars = sql.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        match c {
            '\'' => {
                // String literal with '' escaping.
                let mut closed = false;
                while let Some((_, c2)) = chars.next() {
                    if c2 == '\'' {
                        if matches!(chars.peek(), Some((_, '\''))) {
                            chars.next();
                        } else {
                            closed = true;
                            break;
                        }
                    }
                }
                if !closed {
                    return Err("unterminated string literal".into());
                }
            }
            '"' => {
                // Quoted identifier: keep it as a word token.
                let mut ident = String::new();
                let mut closed = false;
                for (_, c2) in chars.by_ref() {
                    if c2 == '"' {
                        closed = true;
                        break;
                    }
                    ident.push(c2);
                }
                if !closed {
                    return Err("unterminated quoted identifier".into());
                }
                tokens.push(SqlToken::Word(ident));
            }
            '-' if matches!(chars.peek(), Some((_, '-'))) => {
                for (_, c2) in chars.by_ref() {
                    if c2 == '\n' {
                        break;
                    }
                }
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut closed = false;
                while let Some((_, c2)) = chars.next() {
                    if c2 == '*' && matches!(chars.peek(), Some((_, '/'))) {
                        chars.next();
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err("unterminated comment".into());
                }
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::new();
                word.push(c);
                while let Some((_, c2)) = chars.peek() {
                    if c2.is_alphanumeric() || *c2 == '_' {
                        word.push(*c2);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(SqlToken::Word(word));
            }
            c if c.is_whitespace() => {}
            c => tokens.push(SqlToken::Punct(c)),
        }
    }
    Ok(tokens)
}

/// Validate a candidate statement against the binding's schema snapshot.
/// Returns the reason on rejection.
pub fn validate_select(sql: &str, snapshot: &SchemaSnapshot) -> Result<(), String> {
    let tokens = tokenize(sql)?;
    if tokens.is_empty() {
        return Err("empty statement".into());
    }

    // Single statement: a trailing semicolon is tolerated, an interior one
    // is a multi-statement payload.
    let semis: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| matches!(t, SqlToken::Punct(';')))
        .map(|(i, _)| i)
        .collect();
    if semis.iter().any(|i| *i != tokens.len() - 1) {
        return Err("multiple statements are not allowed".into());
    }

    let first = match &tokens[0] {
        SqlToken::Word(w) => w.to_uppercase(),
        SqlToken::Punct(c) => return Err(format!("statement starts with '{c}'")),
    };
    if first != "SELECT" && first != "WITH" {
        return Err(format!("only SELECT statements are allowed, found {first}"));
    }

    for t in &tokens {
        if let SqlToken::Word(w) = t {
            let upper = w.to_uppercase();
            if FORBIDDEN.contains(&upper.as_str()) {
                return Err(format!("forbidden keyword {upper}"));
            }
        }
    }

    let known: Vec<String> = snapshot.table_names().map(str::to_lowercase).collect();
    for table in referenced_tables(&tokens) {
        if !known.contains(&table.to_lowercase()) {
            return Err(format!("unknown table '{table}'"));
        }
    }
    Ok(())
}

/// Tables named after FROM/JOIN, skipping subqueries and CTE names.
fn referenced_tables(tokens: &[SqlToken]) -> Vec<String> {
    // CTE names defined in a WITH prefix are legal reference targets.
    let mut cte_names: Vec<String> = Vec::new();
    if matches!(tokens.first(), Some(SqlToken::Word(w)) if w.eq_ignore_ascii_case("with")) {
        let mut i = 1;
        while i < tokens.len() {
            if let SqlToken::Word(name) = &tokens[i] {
                if name.eq_ignore_ascii_case("recursive") {
                    i += 1;
                    continue;
                }
                cte_names.push(name.to_lowercase());
                // Skip to the matching AS ( ... ) and look for a comma that
                // introduces the next CTE.
                let mut depth = 0i32;
                let mut j = i + 1;
                while j < tokens.len() {
                    match &tokens[j] {
                        SqlToken::Punct('(') => depth += 1,
                        SqlToken::Punct(')') => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    j += 1;
                }
                if matches!(tokens.get(j + 1), Some(SqlToken::Punct(','))) {
                    i = j + 2;
                    continue;
                }
                break;
            }
            i += 1;
        }
    }

    let mut out = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let is_source_kw = matches!(
            &tokens[i],
            SqlToken::Word(w) if w.eq_ignore_ascii_case("from") || w.eq_ignore_ascii_case("join")
        );
        if is_source_kw {
            let mut j = i + 1;
            loop {
                match tokens.get(j) {
                    // Subquery: its own FROM clauses are caught by this same
                    // linear scan, nothing to do here.
                    Some(SqlToken::Punct('(')) => break,
                    Some(SqlToken::Word(name)) => {
                        // schema-qualified names count as their last segment
                        let mut full = name.clone();
                        while matches!(tokens.get(j + 1), Some(SqlToken::Punct('.'))) {
                            if let Some(SqlToken::Word(seg)) = tokens.get(j + 2) {
                                full = seg.clone();
                                j += 2;
                            } else {
                                break;
                            }
                        }
                        if !cte_names.contains(&full.to_lowercase()) {
                            out.push(full);
                        }
                        // Comma-separated FROM list: continue collecting.
                        let mut k = j + 1;
                        // Skip an alias token if present.
                        if let Some(SqlToken::Word(w)) = tokens.get(k) {
                            if !w.eq_ignore_ascii_case("on") && !is_clause_keyword(w) {
                                k += 1;
                            }
                        }
                        if matches!(tokens.get(k), Some(SqlToken::Punct(','))) {
                            j = k + 1;
                            continue;
                        }
                        break;
                    }
                    _ => break,
                }
            }
        }
        i += 1;
    }
    out
}

fn is_clause_keyword(w: &str) -> bool {
    matches!(
        w.to_uppercase().as_str(),
        "WHERE" | "GROUP" | "ORDER" | "HAVING" | "LIMIT" | "OFFSET" | "UNION" | "JOIN" | "INNER"
            | "LEFT" | "RIGHT" | "FULL" | "CROSS" | "ON" | "AS"
    )
}

/// Statement starters recognised when locating SQL in a model response.
/// Non-SELECT starters are kept so the validator rejects them explicitly
/// instead of extraction silently skipping past a destructive prefix.
const STARTERS: &[&str] = &[
    "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE",
    "GRANT", "REVOKE", "COPY",
];

/// Extract the first SQL statement from a model response, stripping markdown
/// code fences and leading prose. Returns `None` when the response contains
/// no SQL at all.
pub fn extract_select(response: &str) -> Option<String> {
    let mut text = response.trim();
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("sql").unwrap_or(after);
        let end = after.find("```").unwrap_or(after.len());
        text = after[..end].trim();
    }
    let upper = text.to_uppercase();
    let (pos, starter) = STARTERS
        .iter()
        .filter_map(|s| upper.find(s).map(|p| (p, *s)))
        .min_by_key(|(p, _)| *p)?;
    let candidate = text[pos..].trim();
    if starter == "SELECT" || starter == "WITH" {
        // Cut at the first statement terminator, keeping it single-statement.
        let end = candidate.find(';').map(|i| i + 1).unwrap_or(candidate.len());
        Some(candidate[..end].trim().to_string())
    } else {
        // A destructive statement leads; hand it to the validator verbatim.
        Some(candidate.to_string())
    }
}

/// Append a `LIMIT` when the statement has none, enforcing the row cap.
pub fn inject_limit(sql: &str, cap: u64) -> String {
    let has_limit = tokenize(sql)
        .map(|tokens| {
            tokens.iter().any(
                |t| matches!(t, SqlToken::Word(w) if w.eq_ignore_ascii_case("limit")),
            )
        })
        .unwrap_or(false);
    if has_limit {
        sql.to_string()
    } else {
        let trimmed = sql.trim_end().trim_end_matches(';');
        format!("{trimmed} LIMIT {cap}")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{SchemaSnapshot, TableSummary};

    fn snapshot() -> SchemaSnapshot {
        SchemaSnapshot {
            tables: vec![
                TableSummary {
                    name: "orders".into(),
                    columns: vec!["id".into(), "total".into(), "customer_id".into()],
                },
                TableSummary { name: "customers".into(), columns: vec!["id".into(), "name".into()] },
            ],
        }
    }

    #[test]
    fn plain_select_passes() {
        validate_select("SELECT id, total FROM orders WHERE total > 10", &snapshot()).unwrap();
    }

    #[test]
    fn join_passes_with_known_tables() {
        validate_select(
            "SELECT c.name, SUM(o.total) FROM orders o JOIN customers c ON c.id = o.customer_id \
             GROUP BY c.name",
            &snapshot(),
        )
        .unwrap();
    }

    #[test]
    fn drop_is_rejected() {
        let err = validate_select("DROP TABLE orders", &snapshot()).unwrap_err();
        assert!(err.contains("forbidden") || err.contains("SELECT"), "{err}");
    }

    #[test]
    fn multi_statement_is_rejected() {
        let err =
            validate_select("SELECT 1 FROM orders; DELETE FROM orders", &snapshot()).unwrap_err();
        assert!(err.contains("statements"), "{err}");
    }

    #[test]
    fn trailing_semicolon_is_tolerated() {
        validate_select("SELECT id FROM orders;", &snapshot()).unwrap();
    }

    #[test]
    fn forbidden_keyword_inside_select_is_rejected() {
        let err = validate_select("SELECT id FROM orders UNION DELETE FROM x", &snapshot())
            .unwrap_err();
        assert!(err.contains("DELETE"), "{err}");
    }

    #[test]
    fn forbidden_word_inside_string_literal_is_fine() {
        validate_select("SELECT id FROM orders WHERE note = 'please DROP this'", &snapshot())
            .unwrap();
    }

    #[test]
    fn unknown_table_is_rejected() {
        let err = validate_select("SELECT * FROM payments", &snapshot()).unwrap_err();
        assert!(err.contains("payments"), "{err}");
    }

    #[test]
    fn unknown_join_target_is_rejected() {
        let err = validate_select(
            "SELECT * FROM orders JOIN payments ON payments.order_id = orders.id",
            &snapshot(),
        )
        .unwrap_err();
        assert!(err.contains("payments"), "{err}");
    }

    #[test]
    fn comma_separated_from_list_checks_every_table() {
        let err =
            validate_select("SELECT * FROM orders, payments", &snapshot()).unwrap_err();
        assert!(err.contains("payments"), "{err}");
    }

    #[test]
    fn cte_names_are_legal_sources() {
        validate_select(
            "WITH big AS (SELECT * FROM orders WHERE total > 100) SELECT COUNT(*) FROM big",
            &snapshot(),
        )
        .unwrap();
    }

    #[test]
    fn schema_qualified_names_use_last_segment() {
        validate_select("SELECT * FROM public.orders", &snapshot()).unwrap();
    }

    #[test]
    fn unterminated_literal_fails_parse() {
        assert!(validate_select("SELECT 'oops FROM orders", &snapshot()).is_err());
    }

    #[test]
    fn extract_strips_fences_and_prose() {
        let resp = "Here is the query:\n```sql\nSELECT id FROM orders\n```\nhope that helps";
        assert_eq!(extract_select(resp).unwrap(), "SELECT id FROM orders");
    }

    #[test]
    fn extract_finds_bare_select() {
        assert_eq!(extract_select("SELECT 1").unwrap(), "SELECT 1");
    }

    #[test]
    fn extract_returns_none_without_select() {
        assert!(extract_select("I cannot produce a query for that.").is_none());
    }

    #[test]
    fn extract_keeps_leading_destructive_statement_for_rejection() {
        let resp = "DROP TABLE orders; SELECT * FROM customers";
        let sql = extract_select(resp).unwrap();
        assert!(sql.starts_with("DROP"));
        assert!(validate_select(&sql, &snapshot()).is_err());
    }

    #[test]
    fn extract_cuts_at_first_terminator() {
        let resp = "SELECT id FROM orders; DROP TABLE orders;";
        assert_eq!(extract_select(resp).unwrap(), "SELECT id FROM orders;");
    }

    #[test]
    fn limit_is_injected_when_absent() {
        assert_eq!(inject_limit("SELECT id FROM orders", 1000), "SELECT id FROM orders LIMIT 1000");
    }

    #[test]
    fn existing_limit_is_preserved() {
        assert_eq!(inject_limit("SELECT id FROM orders LIMIT 5", 1000), "SELECT id FROM orders LIMIT 5");
    }

    #[test]
    fn limit_in_string_literal_does_not_count() {
        let sql = "SELECT id FROM orders WHERE note = 'no limit'";
        assert!(inject_limit(sql, 10).ends_with("LIMIT 10"));
    }
}
