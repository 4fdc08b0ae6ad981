// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded retry with exponential backoff for transient backend errors.

use std::future::Future;
use std::time::Duration;

use devspace_core::InfrastructureError;
use tracing::warn;

/// Retry schedule for backend calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
    /// Delay growth factor.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Run `call`, retrying while it fails with a transient error.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut call: F,
    ) -> Result<T, InfrastructureError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InfrastructureError>>,
    {
        let mut attempt = 1;
        let mut delay = self.initial_backoff;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient backend error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    delay = delay.mul_f64(self.multiplier).min(self.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("create_container", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(InfrastructureError::backend("create_container", "503", true))
                } else {
                    Ok("abc")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "abc");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("start_container", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(InfrastructureError::backend("start_container", "503", true))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("create_container", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(InfrastructureError::backend("create_container", "no such image", false))
            })
            .await;
        assert!(!result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
