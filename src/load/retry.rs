// src/load/retry.rs

use rusqlite::ErrorCode;
use std::{thread::sleep, time::Duration};
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::error::{EtlError, Result};

/// Another connection holds the lock; worth waiting for.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

pub fn is_constraint(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

/// Upper bound on a single retry delay.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Delay before retry number `attempt` (1-based): `initial_backoff_ms`
/// doubled per attempt, saturating and capped at [`MAX_BACKOFF_MS`].
pub fn backoff_ms(retry: RetryConfig, attempt: u32) -> u64 {
    2u64.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| retry.initial_backoff_ms.checked_mul(factor))
        .unwrap_or(u64::MAX)
        .min(MAX_BACKOFF_MS)
}

/// Run `op` until it succeeds, retrying busy/locked failures with exponential
/// backoff. Every other error is returned on the first occurrence.
pub fn with_retry<T>(
    retry: RetryConfig,
    operation: &str,
    mut op: impl FnMut() -> rusqlite::Result<T>,
) -> Result<T> {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy(&e) && attempts < retry.max_attempts => {
                let backoff = backoff_ms(retry, attempts);
                warn!(operation, attempt = attempts, delay_ms = backoff, error = %e, "database busy, retrying");
                sleep(Duration::from_millis(backoff));
            }
            Err(e) if is_busy(&e) => {
                error!(operation, attempts, error = %e, "exhausted retries");
                return Err(EtlError::StoreBusy {
                    operation: operation.to_string(),
                    attempts,
                });
            }
            Err(e) => return Err(EtlError::Store(e)),
        }
    }
}
