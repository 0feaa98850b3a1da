//! Bounded retries with exponential backoff.
use std::{future::Future, slice, time::Duration};

use tracing::warn;

use crate::{command::Action, error::ApiError, models::Subject, ozone::ModerationApi};

/// How often and how patiently a failing call is repeated.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt. Each further delay doubles.
    pub base_delay: Duration,
    /// Whether an error is worth another attempt.
    pub is_retryable: fn(&ApiError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            is_retryable: ApiError::is_retryable,
        }
    }
}

impl RetryPolicy {
    /// The delay after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            if !(self.is_retryable)(&err) {
                warn!("failed to {what} (not retryable): {err}");
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!("failed to {what} after {attempt} attempts: {err}");
                return Err(err);
            }

            let delay = self.delay_after(attempt);
            warn!(
                "failed to {what} (attempt {attempt}/{}), retrying in {delay:?}: {err}",
                self.max_attempts
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Add or remove a single label on `subject`, retrying per `policy`.
pub async fn emit_label<M: ModerationApi>(
    api: &M,
    policy: &RetryPolicy,
    subject: &Subject,
    action: Action,
    label: &String,
    comment: &str,
) -> Result<(), ApiError> {
    let labels = slice::from_ref(label);
    let (add, remove): (&[String], &[String]) = match action {
        Action::Add => (labels, &[]),
        Action::Remove => (&[], labels),
    };

    policy
        .run(&format!("{action} label {label}"), || {
            api.emit_label(subject, add, remove, comment)
        })
        .await
}
