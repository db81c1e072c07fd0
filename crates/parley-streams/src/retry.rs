use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Bounded exponential backoff: `retries` extra attempts after the first,
/// waiting `base_delay * 2^(n-1)` before retry `n`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * 2_u32.pow(retry.saturating_sub(1))
    }
}

pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retry < policy.retries => {
                retry += 1;
                let backoff = policy.delay_for(retry);
                warn!(
                    "{label} failed ({e}) - retry {retry}/{} after {}ms backoff",
                    policy.retries,
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
