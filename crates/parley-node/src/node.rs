// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Node bootstrap: wire the configuration into live components, bind the
//! listener, serve until shutdown.
//!
//! Startup failures map onto the documented exit codes through
//! [`StartupError`]. Runtime errors never exit the process — they surface
//! on the stream or in the log.
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use parley_config::Config;
use parley_core::{BudgetGovernor, Orchestrator};
use parley_model::ModelGateway;
use parley_research::{HttpSearchProvider, ResearchCoordinator, SearchProvider};
use parley_retrieval::{HttpReranker, HybridSearcher, Ingestor, Reranker};
use parley_store::Store;
use parley_tabular::{CredentialCrypto, EngineRegistry, TabularPlanner};

use crate::{auth, error::StartupError, http::routes, session::SessionLimits, state::AppState};

/// Build the shared application state from validated configuration.
pub fn build_state(config: &Config) -> Result<AppState, StartupError> {
    config
        .validate()
        .map_err(|e| StartupError::Misconfiguration(e.to_string()))?;

    let gateway = Arc::new(
        ModelGateway::from_config(config)
            .map_err(|e| StartupError::Misconfiguration(e.to_string()))?,
    );

    let store = Store::open(&config.store.path, config.embedding.dimension)
        .map_err(|e| StartupError::StoreUnreachable(e.to_string()))?;

    let reranker: Option<Arc<dyn Reranker>> = match &config.reranker {
        Some(cfg) => {
            info!(url = %cfg.base_url, "reranker enabled");
            Some(Arc::new(HttpReranker::from_config(cfg)))
        }
        None => {
            warn!("no reranker configured; retrieval uses RRF ordering");
            None
        }
    };
    let searcher = Arc::new(HybridSearcher::new(
        store.clone(),
        Arc::clone(&gateway),
        reranker,
        config.retrieval.clone(),
    ));
    let ingestor = Arc::new(Ingestor::new(
        store.clone(),
        Arc::clone(&gateway),
        config.embedding.batch_size,
    ));

    let crypto = match std::env::var(&config.master_key_env) {
        Ok(hex_key) => CredentialCrypto::from_hex(&hex_key)
            .map_err(|e| StartupError::Misconfiguration(e.to_string()))?,
        Err(_) => {
            warn!(
                env = %config.master_key_env,
                "master key not set; binding credentials will not survive a restart",
            );
            CredentialCrypto::ephemeral()
        }
    };
    // Concrete engines are registered by the deployment; the registry starts
    // empty and bindings for unknown engines fail validation cleanly.
    let tabular = Arc::new(TabularPlanner::new(
        store.clone(),
        Arc::clone(&gateway),
        EngineRegistry::new(),
        crypto,
        Duration::from_millis(config.limits.tabular_timeout_ms),
        config.limits.tabular_row_cap,
    ));

    let research = if config.research.is_empty() {
        warn!("no research providers configured; research jobs are disabled");
        None
    } else {
        let providers: Vec<Arc<dyn SearchProvider>> = config
            .research
            .iter()
            .map(|p| {
                info!(provider = %p.name, "research provider registered");
                Arc::new(HttpSearchProvider::from_config(p)) as Arc<dyn SearchProvider>
            })
            .collect();
        Some(Arc::new(ResearchCoordinator::new(
            store.clone(),
            Arc::clone(&gateway),
            providers,
            Arc::clone(&ingestor),
        )))
    };

    let budget = Arc::new(BudgetGovernor::new(
        store.clone(),
        config.budget.default_monthly_cap,
        config.budget.warn_fraction,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::clone(&gateway),
        searcher,
        Arc::clone(&tabular),
        research,
        budget,
        config.default_tag().to_string(),
        config.retrieval.discipline,
    ));

    let identity = auth::from_config(&config.identity)
        .map_err(|e| StartupError::Misconfiguration(e.to_string()))?;

    Ok(AppState::new(
        store,
        orchestrator,
        ingestor,
        tabular,
        identity,
        SessionLimits::from(&config.limits),
        config.limits.max_upload_bytes,
        config.default_tag().to_string(),
    ))
}

/// Run the node until shutdown. Returns only on startup failure or clean
/// exit.
pub async fn serve(config: Config) -> Result<(), StartupError> {
    let state = build_state(&config)?;
    let app = routes::router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            StartupError::PortConflict(format!("{addr} is already in use"))
        } else {
            StartupError::Misconfiguration(format!("cannot bind {addr}: {e}"))
        }
    })?;
    info!(%addr, "parley listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| StartupError::Misconfiguration(format!("server error: {e}")))?;
    info!("clean shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_config::{ModelProviderConfig, StaticToken};

    fn valid_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.store.path = dir.join("test.db").display().to_string();
        config.embedding.provider = "mock".into();
        config.embedding.dimension = 16;
        config.models.push(ModelProviderConfig {
            tag: "default".into(),
            provider: "mock".into(),
            model: "mock-model".into(),
            api_key_env: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
        });
        config.identity.static_tokens.push(StaticToken {
            token: "test-token".into(),
            user_id: "alice".into(),
        });
        config
    }

    #[tokio::test]
    async fn valid_config_builds_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = build_state(&valid_config(dir.path())).unwrap();
        assert_eq!(state.default_model_tag, "default");
    }

    #[tokio::test]
    async fn missing_models_is_misconfiguration() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path());
        config.models.clear();
        match build_state(&config) {
            Err(StartupError::Misconfiguration(_)) => {}
            other => panic!("expected misconfiguration, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_identity_is_misconfiguration() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path());
        config.identity.static_tokens.clear();
        assert!(matches!(build_state(&config), Err(StartupError::Misconfiguration(_))));
    }

    #[tokio::test]
    async fn unwritable_store_path_is_store_unreachable() {
        let mut config = valid_config(std::path::Path::new("/tmp"));
        config.store.path = "/nonexistent-root-dir/deeper/test.db".into();
        assert!(matches!(build_state(&config), Err(StartupError::StoreUnreachable(_))));
    }

    #[tokio::test]
    async fn port_conflict_maps_to_its_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path());
        // Occupy a port, then try to serve on it.
        let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        config.server.bind = "127.0.0.1".into();
        config.server.port = holder.local_addr().unwrap().port();
        let err = serve(config).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
