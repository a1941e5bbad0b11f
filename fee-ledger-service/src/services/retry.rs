//! Bounded retry of ledger transactions that lost a lock race.

use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::LedgerError;
use crate::services::metrics::LOCK_RETRIES_TOTAL;

#[derive(Debug, Clone)]
pub struct LockRetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(25),
            max_interval: Duration::from_millis(500),
        }
    }
}

impl LockRetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        }
    }
}

/// Run `op` and retry it with exponential backoff while it fails with
/// `Contention`. Each attempt must open its own transaction.
///
/// Once retries are exhausted the contention surfaces as `TransientStorage`.
/// Every other error is returned immediately.
pub async fn with_lock_retry<T, F, Fut>(
    policy: &LockRetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let attempts = AtomicU32::new(0);
    let max_retries = policy.max_retries;

    let result = retry(policy.backoff(), || {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let fut = op();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(LedgerError::Contention(detail)) if attempt <= max_retries => {
                    tracing::warn!(
                        operation,
                        attempt,
                        detail = %detail,
                        "Lock contention, retrying ledger transaction"
                    );
                    LOCK_RETRIES_TOTAL.with_label_values(&[operation]).inc();
                    Err(backoff::Error::transient(LedgerError::Contention(detail)))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await;

    result.map_err(|e| match e {
        LedgerError::Contention(detail) => LedgerError::TransientStorage(format!(
            "{} gave up after {} attempts: {}",
            operation,
            attempts.load(Ordering::Relaxed),
            detail
        )),
        other => other,
    })
}
