//! Retry with exponential backoff and batch-call pacing for embedding providers.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use reposcope_core::config::EmbeddingSettings;
use reposcope_core::error::ProviderError;
use reposcope_core::traits::Embedder;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 4, initial_backoff: Duration::from_millis(250), max_backoff: Duration::from_secs(8) }
    }
}

impl From<&EmbeddingSettings> for RetryPolicy {
    fn from(s: &EmbeddingSettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            initial_backoff: Duration::from_millis(s.initial_backoff_ms),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt. A provider-supplied retry-after wins over `backoff`.
    pub fn delay(&self, backoff: Duration, err: &anyhow::Error) -> Duration {
        match err.downcast_ref::<ProviderError>() {
            Some(ProviderError::Throttled { retry_after: Some(after) }) => *after,
            _ => backoff.min(self.max_backoff),
        }
    }
}

fn is_retryable(err: &anyhow::Error) -> bool {
    !matches!(err.downcast_ref::<ProviderError>(), Some(ProviderError::InvalidResponse(_)))
}

/// Enforces a minimum interval between consecutive provider calls.
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last: Mutex::new(None) }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Calls `embed_batch` on the blocking pool, retrying failed calls per `policy`.
///
/// A response with the wrong number of vectors counts as a failed call.
pub async fn embed_with_retry(
    embedder: &Arc<dyn Embedder>,
    texts: Arc<Vec<String>>,
    policy: &RetryPolicy,
    limiter: Option<&RateLimiter>,
) -> Result<Vec<Vec<f32>>> {
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1u32;
    loop {
        if let Some(l) = limiter {
            l.wait().await;
        }
        let e = Arc::clone(embedder);
        let batch = Arc::clone(&texts);
        let result = tokio::task::spawn_blocking(move || e.embed_batch(&batch))
            .await
            .map_err(|e| anyhow!("embedding task failed: {e}"))?;
        let err = match result {
            Ok(v) if v.len() == texts.len() => return Ok(v),
            Ok(v) => anyhow!(ProviderError::InvalidResponse(format!(
                "{} vectors for {} inputs",
                v.len(),
                texts.len()
            ))),
            Err(e) => e,
        };
        if attempt >= policy.max_attempts || !is_retryable(&err) {
            return Err(err);
        }
        let delay = policy.delay(backoff, &err);
        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "embedding call failed, retrying");
        tokio::time::sleep(delay).await;
        backoff = (backoff * 2).min(policy.max_backoff);
        attempt += 1;
    }
}
