// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::provider::ProviderError;

/// Maximum attempts for a retryable provider call.
pub const MAX_ATTEMPTS: u32 = 3;

const BASE_BACKOFF: Duration = Duration::from_millis(250);

/// Run `op` up to [`MAX_ATTEMPTS`] times with exponential backoff.
///
/// Only errors whose [`ProviderError::is_retryable`] returns true are
/// retried; everything else surfaces immediately. Retrying is safe here
/// because `op` is only re-invoked when the previous attempt failed before
/// any response body was produced.
pub async fn with_backoff<T, F, Fut>(what: &str, op: F) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                let delay = BASE_BACKOFF * 2u32.pow(attempt - 1);
                warn!(call = what, attempt, error = %e, "retrying after backoff");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
