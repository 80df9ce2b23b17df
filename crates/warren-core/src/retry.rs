// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The canonical retry primitive: bounded attempts with half-jittered
//! exponential backoff.  Classification is explicit — callers pass a
//! predicate; nothing here matches on message strings.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Backoff configuration for [`try_n`].
#[derive(Debug, Clone)]
pub struct RetryOpts {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryOpts {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 10_000,
        }
    }
}

/// Delay before retry `attempt` (0-based): uniformly drawn from
/// `[0, min(max, base · 2^attempt)]` — half-jitter, so synchronized clients
/// spread out instead of stampeding.
pub fn backoff_delay_ms(opts: &RetryOpts, attempt: u32) -> u64 {
    let ceiling = opts
        .base_delay_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(opts.max_delay_ms);
    rand::thread_rng().gen_range(0..=ceiling)
}

/// Run `op` up to `n` times, sleeping a jittered backoff between attempts.
///
/// `is_retryable` decides whether a failure is worth another attempt;
/// non-retryable errors (and the final attempt's error) are returned as-is.
pub async fn try_n<T, E, F, Fut>(
    n: u32,
    mut op: F,
    opts: RetryOpts,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = n.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt + 1 >= attempts || !is_retryable(&e) {
                    return Err(e);
                }
                let delay = backoff_delay_ms(&opts, attempt);
                debug!(attempt, delay_ms = delay, error = %e, "retrying after backoff");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                last_err = Some(e);
            }
        }
    }
    // Unreachable in practice: the loop returns on the final attempt.
    Err(last_err.expect("try_n ran zero attempts"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_opts() -> RetryOpts {
        RetryOpts {
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_without_retrying() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Error> = try_n(
            3,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            },
            fast_opts(),
            Error::is_retryable,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Error> = try_n(
            5,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Transient("blip".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
            fast_opts(),
            Error::is_retryable,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn overloaded_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Error> = try_n(
            5,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Overloaded("busy".into())) }
            },
            fast_opts(),
            Error::is_retryable,
        )
        .await;
        assert!(matches!(result, Err(Error::Overloaded(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Error> = try_n(
            3,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Transient("still down".into())) }
            },
            fast_opts(),
            Error::is_retryable,
        )
        .await;
        assert!(matches!(result, Err(Error::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_is_bounded_by_max() {
        let opts = RetryOpts {
            base_delay_ms: 100,
            max_delay_ms: 300,
        };
        for attempt in 0..10 {
            assert!(backoff_delay_ms(&opts, attempt) <= 300);
        }
    }
}
