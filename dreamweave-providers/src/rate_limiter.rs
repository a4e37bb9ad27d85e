//! # Rate Limiter Module
//!
//! Per-provider admission control over two dimensions: requests per minute
//! and concurrent in-flight calls. Acquisition blocks for at most a small
//! bounded deadline (default 250ms); when that elapses the caller gets a
//! `rate_limit_exceeded` refusal instead of queueing unboundedly.
//!
//! The returned [`RatePermit`] releases the concurrency slot on drop, so the
//! slot comes back on every exit path of an invocation, including panics and
//! cancelled futures. The rpm window entry is deliberately left in place on
//! drop: the request was admitted into the minute window whether or not it
//! completed.

use crate::error::ProviderError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

const RPM_WINDOW: Duration = Duration::from_secs(60);

/// Admission parameters for one provider.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Requests admitted per rolling minute (0 = unlimited)
    pub rpm: u32,
    /// Maximum concurrent in-flight requests
    pub concurrent: u32,
    /// Longest an admission attempt may block before refusal
    pub acquire_deadline: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rpm: 60,
            concurrent: 4,
            acquire_deadline: Duration::from_millis(250),
        }
    }
}

/// Token-bucket-equivalent limiter for a single provider.
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    slots: Arc<Semaphore>,
    window: Mutex<VecDeque<Instant>>,
}

/// Held for the duration of one invocation; releases the concurrency slot
/// on drop.
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrent.max(1) as usize));
        Self {
            name: name.into(),
            config,
            slots,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Acquire a dispatch permit, blocking up to the configured deadline.
    pub async fn acquire(&self) -> Result<RatePermit, ProviderError> {
        let started = Instant::now();

        let slot = match tokio::time::timeout(
            self.config.acquire_deadline,
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) | Err(_) => {
                tracing::debug!(provider = %self.name, "concurrency slot unavailable");
                return Err(ProviderError::RateLimit);
            }
        };

        if self.config.rpm == 0 {
            return Ok(RatePermit { _slot: slot });
        }

        loop {
            let wait = {
                let mut window = self
                    .window
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= RPM_WINDOW)
                {
                    window.pop_front();
                }
                if (window.len() as u32) < self.config.rpm {
                    window.push_back(now);
                    None
                } else {
                    // Oldest entry expires first; wait for it.
                    window
                        .front()
                        .map(|t| RPM_WINDOW.saturating_sub(now.duration_since(*t)))
                }
            };

            match wait {
                None => return Ok(RatePermit { _slot: slot }),
                Some(delay) => {
                    if started.elapsed() + delay > self.config.acquire_deadline {
                        tracing::debug!(provider = %self.name, "rpm window full");
                        return Err(ProviderError::RateLimit);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Number of requests currently holding a slot.
    pub fn in_flight(&self) -> u32 {
        self.config.concurrent.max(1) - self.slots.available_permits() as u32
    }

    /// Requests admitted within the current rolling minute.
    pub fn requests_in_window(&self) -> u32 {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= RPM_WINDOW)
        {
            window.pop_front();
        }
        window.len() as u32
    }
}
