// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Budget governor: admission control and post-flight metering against a
//! per-user monthly cap.
//!
//! Concurrency contract: at most one in-flight usage update per
//! `(user_id, yyyy_mm)`. Updates serialize on a per-key async mutex and fold
//! into a single storage write. `record` is idempotent under a request id so
//! retried turns never double-bill.
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use parley_model::Metering;
use parley_store::{Store, StoreError, UsageRecord};

/// Remembered request ids; far larger than any plausible retry window.
const SEEN_REQUESTS: usize = 8_192;

/// Admission decision for new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// Admitted, but month-to-date spend has crossed the warning fraction.
    Warn { percent_used: u8 },
    /// Over cap; the turn must not start.
    Deny { spent: i64, cap: i64 },
}

pub struct BudgetGovernor {
    store: Store,
    default_cap: i64,
    warn_fraction: f64,
    /// Per-`(user, month)` exclusion for read-modify-write cycles.
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
    seen: Mutex<LruCache<Uuid, ()>>,
}

impl BudgetGovernor {
    pub fn new(store: Store, default_cap: i64, warn_fraction: f64) -> Self {
        Self {
            store,
            default_cap,
            warn_fraction,
            locks: DashMap::new(),
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_REQUESTS).expect("nonzero"),
            )),
        }
    }

    /// `yyyy-mm` month key for a moment in time.
    pub fn month_key(at: DateTime<Utc>) -> String {
        at.format("%Y-%m").to_string()
    }

    async fn cap_for(&self, user_id: &str) -> Result<i64, StoreError> {
        let settings = self.store.get_settings(user_id).await?;
        Ok(settings.monthly_budget.unwrap_or(self.default_cap))
    }

    /// Pre-flight admission: would `estimated_cost` fit under the cap?
    pub async fn admit(
        &self,
        user_id: &str,
        estimated_cost: i64,
    ) -> Result<Admission, StoreError> {
        let month = Self::month_key(Utc::now());
        let cap = self.cap_for(user_id).await?.max(0);
        let spent = self
            .store
            .usage_record(user_id, &month)
            .await?
            .map(|r| r.total_cost)
            .unwrap_or(0);
        if cap == 0 || spent + estimated_cost > cap {
            info!(user = %user_id, spent, cap, estimated_cost, "budget admission denied");
            return Ok(Admission::Deny { spent, cap });
        }
        let projected = spent + estimated_cost;
        if (projected as f64) >= (cap as f64) * self.warn_fraction {
            let percent_used = ((spent * 100) / cap).clamp(0, 100) as u8;
            return Ok(Admission::Warn { percent_used });
        }
        Ok(Admission::Allow)
    }

    /// Post-flight metering. Retried calls with the same `request_id`
    /// update usage exactly once.
    pub async fn record(
        &self,
        user_id: &str,
        request_id: Uuid,
        metering: &Metering,
    ) -> Result<Option<UsageRecord>, StoreError> {
        let month = Self::month_key(Utc::now());
        let key = (user_id.to_string(), month.clone());
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        {
            let mut seen = self.seen.lock().await;
            if seen.put(request_id, ()).is_some() {
                debug!(user = %user_id, request = %request_id, "duplicate record ignored");
                return Ok(None);
            }
        }

        let record = self
            .store
            .record_usage(
                user_id,
                &month,
                metering.cost_minor,
                &metering.model_tag,
                u64::from(metering.input_tokens),
                u64::from(metering.output_tokens),
            )
            .await?;
        Ok(Some(record))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn metering(cost: i64) -> Metering {
        Metering {
            model_tag: "m".into(),
            input_tokens: 100,
            output_tokens: 50,
            cost_minor: cost,
            wall_ms: 10,
        }
    }

    fn governor(default_cap: i64) -> BudgetGovernor {
        BudgetGovernor::new(Store::in_memory(4).unwrap(), default_cap, 0.8)
    }

    #[tokio::test]
    async fn fresh_user_is_allowed() {
        let g = governor(1_000);
        assert_eq!(g.admit("alice", 10).await.unwrap(), Admission::Allow);
    }

    #[tokio::test]
    async fn over_cap_is_denied_before_any_tokens() {
        let g = governor(100);
        g.record("alice", Uuid::new_v4(), &metering(99)).await.unwrap();
        match g.admit("alice", 5).await.unwrap() {
            Admission::Deny { spent, cap } => {
                assert_eq!(spent, 99);
                assert_eq!(cap, 100);
            }
            other => panic!("expected deny, got {other:?}"),
        }
        // The usage row is unchanged by a denied admission.
        let month = BudgetGovernor::month_key(Utc::now());
        let row = g.store.usage_record("alice", &month).await.unwrap().unwrap();
        assert_eq!(row.total_cost, 99);
    }

    #[tokio::test]
    async fn warning_at_eighty_percent() {
        let g = governor(1_000);
        g.record("alice", Uuid::new_v4(), &metering(800)).await.unwrap();
        match g.admit("alice", 10).await.unwrap() {
            Admission::Warn { percent_used } => assert_eq!(percent_used, 80),
            other => panic!("expected warn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn record_is_idempotent_under_request_id() {
        let g = governor(1_000);
        let id = Uuid::new_v4();
        let first = g.record("alice", id, &metering(50)).await.unwrap();
        assert!(first.is_some());
        let second = g.record("alice", id, &metering(50)).await.unwrap();
        assert!(second.is_none(), "duplicate must not bill again");
        let month = BudgetGovernor::month_key(Utc::now());
        let row = g.store.usage_record("alice", &month).await.unwrap().unwrap();
        assert_eq!(row.total_cost, 50);
    }

    #[tokio::test]
    async fn concurrent_records_serialize_and_sum_exactly() {
        let g = Arc::new(governor(1_000_000));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let g = Arc::clone(&g);
            handles.push(tokio::spawn(async move {
                g.record("alice", Uuid::new_v4(), &metering(7)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let month = BudgetGovernor::month_key(Utc::now());
        let row = g.store.usage_record("alice", &month).await.unwrap().unwrap();
        assert_eq!(row.total_cost, 140, "sum of all committed Record() calls");
    }

    #[tokio::test]
    async fn per_user_settings_override_default_cap() {
        let g = governor(1_000_000);
        let mut settings = g.store.get_settings("alice").await.unwrap();
        settings.monthly_budget = Some(10);
        g.store.update_settings("alice", &settings).await.unwrap();
        assert!(matches!(g.admit("alice", 20).await.unwrap(), Admission::Deny { .. }));
    }

    #[test]
    fn month_key_format() {
        let at = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(BudgetGovernor::month_key(at), "2026-08");
    }
}
