// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A query tried to touch a row outside the caller's user scope.
    /// Logged without detail; callers see only the kind.
    #[error("scope violation")]
    ScopeViolation,

    #[error("not found")]
    NotFound,

    /// Duplicate creation or a lost concurrent update.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Retryable storage failure (lock contention, busy database).
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage error: {0}")]
    Fatal(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound,
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    Self::Transient(e.to_string())
                }
                rusqlite::ErrorCode::ConstraintViolation => Self::Conflict(e.to_string()),
                _ => Self::Fatal(e.to_string()),
            },
            _ => Self::Fatal(e.to_string()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_rows_maps_to_not_found() {
        let e: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(e, StoreError::NotFound));
    }
}
