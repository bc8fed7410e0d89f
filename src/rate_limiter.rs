//! Per-provider/instance token reservoir respecting server-advertised rate
//! limit headers. One [`RateLimiter`] per `(provider, instance)` key, held by
//! a [`RateLimiterRegistry`] — "a coordinator, not a global": GitHub.com and
//! an enterprise GitLab instance never share a reservoir.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::RateLimitInfo;

/// Token reservoir for a single provider/instance.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<RateLimitInfo>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RateLimitInfo {
                limit: u32::MAX,
                remaining: u32::MAX,
                reset_time: Utc::now(),
            }),
        }
    }

    /// Blocks until a token is available or `cancel` fires. When
    /// `remaining == 0`, sleeps until `reset_time + jitter`; spends no token
    /// if canceled.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let sleep_until = {
            let mut state = self.state.lock().unwrap();
            if state.remaining > 0 {
                state.remaining -= 1;
                None
            } else {
                Some(state.reset_time)
            }
        };

        if let Some(reset_time) = sleep_until {
            let jitter_ms: u64 = rand::thread_rng().gen_range(0..1000);
            let now = Utc::now();
            let delay = (reset_time - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
                + std::time::Duration::from_millis(jitter_ms);

            debug!(delay_ms = delay.as_millis() as u64, "rate limit exhausted, waiting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Canceled),
            }

            // After waking, assume the window has rolled over; spend one
            // token for this caller and leave the rest for others.
            let mut state = self.state.lock().unwrap();
            state.remaining = state.remaining.saturating_sub(1);
        }

        Ok(())
    }

    /// Updates bookkeeping from a provider response's rate-limit headers.
    pub fn update_limit(&self, limit: u32, remaining: u32, reset_time: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        *state = RateLimitInfo {
            limit,
            remaining,
            reset_time,
        };
    }

    pub fn snapshot(&self) -> RateLimitInfo {
        *self.state.lock().unwrap()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of [`RateLimiter`]s keyed by `(provider, instance)`. Not a
/// global: callers hold an `Arc<RateLimiterRegistry>` and pass it through
/// explicitly.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, std::sync::Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, provider: &str, instance: &str) -> std::sync::Arc<RateLimiter> {
        let key = format!("{provider}/{instance}");
        let mut limiters = self.limiters.lock().unwrap();
        limiters
            .entry(key)
            .or_insert_with(|| std::sync::Arc::new(RateLimiter::new()))
            .clone()
    }
}
