// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fixed credibility rubric for collected sources.
//!
//! Scores in 0–100 from three signals: domain class, recency, and citation
//! count where the provider reports one. The rubric is deliberately static —
//! no learned weights, no per-user tuning — so scores are reproducible.
use chrono::Datelike;

use crate::provider::SourceHit;

/// Well-known high-signal publishers scored above their TLD class.
const REPUTABLE_HOSTS: &[&str] = &[
    "arxiv.org",
    "nature.com",
    "science.org",
    "acm.org",
    "ieee.org",
    "nih.gov",
    "pubmed.ncbi.nlm.nih.gov",
];

/// Score one hit. `now_year` is passed in so the rubric stays deterministic
/// under test.
pub fn score(hit: &SourceHit, now_year: i32) -> i64 {
    let host = host_of(&hit.url);
    let mut score: i64 = domain_class(&host);

    if let Some(year) = hit.published_year {
        let age = (now_year - year).max(0);
        if age <= 2 {
            score += 5;
        } else if age > 10 {
            score -= 10;
        }
    }

    if let Some(citations) = hit.citation_count {
        score += i64::from(citations / 100).min(10);
    }

    score.clamp(0, 100)
}

fn domain_class(host: &str) -> i64 {
    if REPUTABLE_HOSTS.iter().any(|h| host == *h || host.ends_with(&format!(".{h}"))) {
        return 85;
    }
    if host.ends_with(".gov") || host.ends_with(".edu") {
        90
    } else if host.ends_with(".org") {
        75
    } else if host.ends_with(".com") {
        60
    } else {
        50
    }
}

/// Publisher tag: the bare host.
pub fn publisher_tag(url: &str) -> String {
    host_of(url)
}

/// Dedup key: origin + path, query and fragment stripped.
pub fn dedup_key(url: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed.trim_end_matches('/').to_lowercase()
}

fn host_of(url: &str) -> String {
    let after_scheme = url.split("://").nth(1).unwrap_or(url);
    let host = after_scheme.split(['/', '?', '#']).next().unwrap_or(after_scheme);
    host.trim_start_matches("www.").to_lowercase()
}

pub fn current_year() -> i32 {
    chrono::Utc::now().year()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(url: &str, year: Option<i32>, citations: Option<u32>) -> SourceHit {
        SourceHit {
            url: url.into(),
            title: None,
            snippet: None,
            published_year: year,
            citation_count: citations,
        }
    }

    #[test]
    fn domain_classes_rank_as_expected() {
        let gov = score(&hit("https://www.census.gov/data", None, None), 2026);
        let org = score(&hit("https://example.org/page", None, None), 2026);
        let com = score(&hit("https://blog.example.com/post", None, None), 2026);
        assert!(gov > org && org > com);
    }

    #[test]
    fn reputable_hosts_beat_plain_org() {
        let arxiv = score(&hit("https://arxiv.org/abs/1234.5678", None, None), 2026);
        let org = score(&hit("https://something.org/a", None, None), 2026);
        assert!(arxiv > org);
    }

    #[test]
    fn recent_publication_gains_old_loses() {
        let fresh = score(&hit("https://example.com/a", Some(2026), None), 2026);
        let stale = score(&hit("https://example.com/a", Some(2010), None), 2026);
        assert!(fresh > stale);
    }

    #[test]
    fn citation_bonus_is_capped() {
        let heavy = score(&hit("https://example.com/a", None, Some(1_000_000)), 2026);
        let some = score(&hit("https://example.com/a", None, Some(1_000)), 2026);
        assert_eq!(heavy, some, "both hit the +10 cap");
    }

    #[test]
    fn score_stays_in_bounds() {
        let s = score(&hit("https://nih.gov/a", Some(2026), Some(100_000)), 2026);
        assert!(s <= 100);
    }

    #[test]
    fn dedup_key_strips_query_fragment_and_case() {
        assert_eq!(
            dedup_key("https://Example.org/Path/?utm=1#frag"),
            "https://example.org/path"
        );
        assert_eq!(dedup_key("https://example.org/path"), dedup_key("https://example.org/path/"));
    }

    #[test]
    fn publisher_tag_is_bare_host() {
        assert_eq!(publisher_tag("https://www.nature.com/articles/x"), "nature.com");
    }
}
