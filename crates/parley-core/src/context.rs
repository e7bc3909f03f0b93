// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Temporal context for the prompt: wall time, time-of-day register, gap
//! since the last message (only when ≥ 30 minutes), and conversation age.
use chrono::{DateTime, Timelike, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOfDay {
    EarlyMorning,
    Morning,
    Afternoon,
    Evening,
    Night,
    LateNight,
}

impl TimeOfDay {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=7 => Self::EarlyMorning,
            8..=11 => Self::Morning,
            12..=16 => Self::Afternoon,
            17..=20 => Self::Evening,
            21..=23 => Self::Night,
            _ => Self::LateNight,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::EarlyMorning => "early morning",
            Self::Morning => "morning",
            Self::Afternoon => "afternoon",
            Self::Evening => "evening",
            Self::Night => "night",
            Self::LateNight => "late night",
        }
    }
}

/// Gap buckets; below 30 minutes no gap line is emitted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapBucket {
    /// 30–120 minutes.
    Moderate,
    /// 2–8 hours.
    Long,
    /// 8–24 hours.
    VeryLong,
    /// ≥ 24 hours.
    NewSession,
}

pub fn gap_bucket(minutes: i64) -> Option<GapBucket> {
    match minutes {
        m if m < 30 => None,
        m if m < 120 => Some(GapBucket::Moderate),
        m if m < 480 => Some(GapBucket::Long),
        m if m < 1_440 => Some(GapBucket::VeryLong),
        _ => Some(GapBucket::NewSession),
    }
}

fn gap_line(bucket: GapBucket, minutes: i64) -> String {
    match bucket {
        GapBucket::Moderate => format!("It has been {minutes} minutes since the last message."),
        GapBucket::Long => format!(
            "It has been about {} hours since the last message.",
            (minutes + 30) / 60
        ),
        GapBucket::VeryLong => format!(
            "A long pause: about {} hours since the last message.",
            (minutes + 30) / 60
        ),
        GapBucket::NewSession => {
            "This is effectively a new session; more than a day has passed since the last message."
                .to_string()
        }
    }
}

/// Render the temporal block for the prompt.
pub fn temporal_block(
    now: DateTime<Utc>,
    last_message_at: Option<DateTime<Utc>>,
    conversation_started: Option<DateTime<Utc>>,
) -> String {
    let mut out = format!(
        "Current time: {} ({}).",
        now.format("%Y-%m-%d %H:%M UTC"),
        TimeOfDay::from_hour(now.hour()).as_str()
    );
    if let Some(last) = last_message_at {
        let minutes = (now - last).num_minutes();
        if let Some(bucket) = gap_bucket(minutes) {
            out.push(' ');
            out.push_str(&gap_line(bucket, minutes));
        }
    }
    if let Some(started) = conversation_started {
        let minutes = (now - started).num_minutes();
        if minutes >= 1 {
            out.push_str(&format!(" The conversation has been running for {minutes} minutes."));
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(rfc: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn hours_map_to_expected_registers() {
        assert_eq!(TimeOfDay::from_hour(6), TimeOfDay::EarlyMorning);
        assert_eq!(TimeOfDay::from_hour(9), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(14), TimeOfDay::Afternoon);
        assert_eq!(TimeOfDay::from_hour(19), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(22), TimeOfDay::Night);
        assert_eq!(TimeOfDay::from_hour(2), TimeOfDay::LateNight);
    }

    #[test]
    fn short_gaps_emit_nothing() {
        assert!(gap_bucket(29).is_none());
        assert_eq!(gap_bucket(30), Some(GapBucket::Moderate));
    }

    #[test]
    fn gap_buckets_scale() {
        assert_eq!(gap_bucket(90), Some(GapBucket::Moderate));
        assert_eq!(gap_bucket(300), Some(GapBucket::Long));
        assert_eq!(gap_bucket(600), Some(GapBucket::VeryLong));
        assert_eq!(gap_bucket(2_000), Some(GapBucket::NewSession));
    }

    #[test]
    fn block_omits_gap_under_threshold() {
        let now = at("2026-08-01T14:00:00Z");
        let block = temporal_block(now, Some(now - Duration::minutes(10)), None);
        assert!(!block.contains("since the last message"));
    }

    #[test]
    fn block_includes_gap_and_duration() {
        let now = at("2026-08-01T14:00:00Z");
        let block = temporal_block(
            now,
            Some(now - Duration::hours(3)),
            Some(now - Duration::hours(5)),
        );
        assert!(block.contains("about 3 hours"));
        assert!(block.contains("running for 300 minutes"));
        assert!(block.contains("afternoon"));
    }
}
