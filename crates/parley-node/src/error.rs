// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited")]
    RateLimited,

    #[error("HTTP server error: {0}")]
    Http(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(String),
}

/// Startup failures map to the process exit codes in the binary.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Exit code 1.
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    /// Exit code 2.
    #[error("persistent store unreachable: {0}")]
    StoreUnreachable(String),

    /// Exit code 3.
    #[error("port conflict: {0}")]
    PortConflict(String),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Misconfiguration(_) => 1,
            Self::StoreUnreachable(_) => 2,
            Self::PortConflict(_) => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(StartupError::Misconfiguration("x".into()).exit_code(), 1);
        assert_eq!(StartupError::StoreUnreachable("x".into()).exit_code(), 2);
        assert_eq!(StartupError::PortConflict("x".into()).exit_code(), 3);
    }
}
