//! Bounded exponential-backoff retry for outbound provider calls.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::config::RetrySettings;

/// Failure text fragments that mark a failure as transient.
pub const DEFAULT_RETRYABLE_PATTERNS: &[&str] = &[
    "network error",
    "error sending request",
    "failed to fetch",
    "connection reset",
    "connection closed",
    "timed out",
    "timeout",
    "429",
    "500",
    "502",
    "503",
    "504",
];

/// Attempt budget for auxiliary calls such as balance probes.
pub const PROBE_MAX_ATTEMPTS: u32 = 2;

/// Waits between attempts. Injected so tests can observe delays without
/// actually sleeping.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub retryable_patterns: &'static [&'static str],
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            retryable_patterns: DEFAULT_RETRYABLE_PATTERNS,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_delay_ms),
        )
    }

    /// Same backoff and sleeper, reduced attempt budget.
    pub fn for_probe(&self) -> Self {
        Self {
            max_attempts: self.max_attempts.min(PROBE_MAX_ATTEMPTS),
            ..self.clone()
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_patterns(mut self, patterns: &'static [&'static str]) -> Self {
        self.retryable_patterns = patterns;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt_index` (0-based).
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt_index))
    }

    pub fn is_retryable(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.retryable_patterns
            .iter()
            .any(|pattern| lower.contains(pattern))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent. The last error is returned unchanged.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let message = err.to_string();
                let remaining = attempt + 1 < policy.max_attempts;
                if !remaining || !policy.is_retryable(&message) {
                    debug!(attempt, "giving up: {message}");
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient failure: {message}"
                );
                policy.sleeper.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
