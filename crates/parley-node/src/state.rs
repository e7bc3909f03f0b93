// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use dashmap::DashMap;

use parley_core::Orchestrator;
use parley_retrieval::Ingestor;
use parley_store::Store;
use parley_tabular::TabularPlanner;

use crate::{
    auth::IdentityAuthority,
    session::{DirectLimiter, Session, SessionLimits},
};

/// Shared state handed to every HTTP and WebSocket handler.
// `identity` is a trait object and doesn't implement `Debug`, so `AppState`
// gets a manual `Debug` impl below instead of deriving one.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub orchestrator: Arc<Orchestrator>,
    pub ingestor: Arc<Ingestor>,
    pub tabular: Arc<TabularPlanner>,
    pub identity: Arc<dyn IdentityAuthority>,
    pub limits: SessionLimits,
    pub max_upload_bytes: usize,
    pub default_model_tag: String,
    /// Turn limiters shared across each user's sessions.
    turn_limiters: Arc<DashMap<String, Arc<DirectLimiter>>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("limits", &self.limits)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("default_model_tag", &self.default_model_tag)
            .finish_non_exhaustive()
    }
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        orchestrator: Arc<Orchestrator>,
        ingestor: Arc<Ingestor>,
        tabular: Arc<TabularPlanner>,
        identity: Arc<dyn IdentityAuthority>,
        limits: SessionLimits,
        max_upload_bytes: usize,
        default_model_tag: String,
    ) -> Self {
        Self {
            store,
            orchestrator,
            ingestor,
            tabular,
            identity,
            limits,
            max_upload_bytes,
            default_model_tag,
            turn_limiters: Arc::new(DashMap::new()),
        }
    }

    pub fn turn_limiter_for(&self, user_id: &str) -> Arc<DirectLimiter> {
        self.turn_limiters
            .entry(user_id.to_string())
            .or_insert_with(|| Session::user_turn_limiter(self.limits.turns_per_minute))
            .clone()
    }
}
