use std::{future::Future, time::Duration};

use rand::Rng;

use crate::error::ChatResult;

/// Bounded exponential backoff. Used for idempotent reads and for realtime
/// reconnects; never for sends.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with the upper half jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
            .min(self.max_delay);
        let half = exp / 2;
        let jitter = rand::rng().random_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the policy
/// runs out of attempts.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> ChatResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChatResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(%err, attempt, ?delay, "{what} failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ChatError;

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::default();
        for attempt in 1..40 {
            assert!(policy.delay_for(attempt) <= policy.max_delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&RetryPolicy::default(), "list", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ChatError::TransientNetwork("offline".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
        let result: ChatResult<()> = with_backoff(&policy, "list", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ChatError::TransientNetwork("offline".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_validation() {
        let calls = AtomicU32::new(0);
        let result: ChatResult<()> = with_backoff(&RetryPolicy::default(), "list", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ChatError::validation("bad id"))
        })
        .await;

        assert!(matches!(result, Err(ChatError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
