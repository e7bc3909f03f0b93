// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bearer credential verification against the identity authority.
//!
//! Static tokens are stored as SHA-256 digests and compared in constant
//! time; raw tokens never persist. The HTTP authority is the production
//! path: the bearer is forwarded and the authority answers with the user id.
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use subtle::ConstantTimeEq;

use crate::error::GatewayError;

#[async_trait]
pub trait IdentityAuthority: Send + Sync {
    /// Validate a bearer credential; returns the user id it belongs to.
    async fn verify(&self, bearer: &str) -> Result<String, GatewayError>;
}

/// Fixed token table for development and tests.
pub struct StaticIdentity {
    entries: Vec<([u8; 32], String)>,
}

impl StaticIdentity {
    pub fn new(tokens: &[parley_config::StaticToken]) -> Self {
        let entries = tokens
            .iter()
            .map(|t| (sha256(t.token.as_bytes()), t.user_id.clone()))
            .collect();
        Self { entries }
    }
}

#[async_trait]
impl IdentityAuthority for StaticIdentity {
    async fn verify(&self, bearer: &str) -> Result<String, GatewayError> {
        let digest = sha256(bearer.as_bytes());
        for (stored, user_id) in &self.entries {
            if stored.ct_eq(&digest).into() {
                return Ok(user_id.clone());
            }
        }
        Err(GatewayError::Auth("unknown credential".into()))
    }
}

/// Remote identity authority: `GET {url}` with the bearer forwarded,
/// expecting `200 {"user_id": "..."}`.
pub struct HttpIdentity {
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpIdentity {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self { url, timeout, client: reqwest::Client::new() }
    }
}

#[async_trait]
impl IdentityAuthority for HttpIdentity {
    async fn verify(&self, bearer: &str) -> Result<String, GatewayError> {
        let resp = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| GatewayError::Auth(format!("identity authority unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Auth("credential rejected".into()));
        }
        let v: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Auth(format!("identity response malformed: {e}")))?;
        v["user_id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| GatewayError::Auth("identity response missing user_id".into()))
    }
}

/// Build the authority from config: static tokens win when present.
pub fn from_config(
    cfg: &parley_config::IdentityConfig,
) -> Result<std::sync::Arc<dyn IdentityAuthority>, GatewayError> {
    if !cfg.static_tokens.is_empty() {
        return Ok(std::sync::Arc::new(StaticIdentity::new(&cfg.static_tokens)));
    }
    match &cfg.url {
        Some(url) => Ok(std::sync::Arc::new(HttpIdentity::new(
            url.clone(),
            Duration::from_millis(cfg.timeout_ms),
        ))),
        None => Err(GatewayError::Config("no identity authority configured".into())),
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_config::StaticToken;

    fn authority() -> StaticIdentity {
        StaticIdentity::new(&[
            StaticToken { token: "alpha-token".into(), user_id: "alice".into() },
            StaticToken { token: "beta-token".into(), user_id: "bob".into() },
        ])
    }

    #[tokio::test]
    async fn known_tokens_resolve_their_users() {
        let auth = authority();
        assert_eq!(auth.verify("alpha-token").await.unwrap(), "alice");
        assert_eq!(auth.verify("beta-token").await.unwrap(), "bob");
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let auth = authority();
        assert!(auth.verify("gamma-token").await.is_err());
        assert!(auth.verify("").await.is_err());
    }

    #[test]
    fn config_without_identity_is_an_error() {
        let cfg = parley_config::IdentityConfig::default();
        assert!(from_config(&cfg).is_err());
    }
}
