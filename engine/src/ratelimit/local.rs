//! Local fixed-window rate limiter
//!
//! Allows `count` accesses per `interval` within this process. The window
//! resets as a whole rather than refilling continuously, which keeps the
//! hot path to a single short lock.

use super::RateLimit;
use crate::config::deserialize_duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::{Duration, Instant};
use virta_core::{Error, Result};

/// Config fields accepted by the `local` rate limit.
pub const CONFIG_FIELDS: &[&str] = &["count", "interval"];

/// Configuration for [`LocalRateLimit`].
#[derive(Debug, Clone, Deserialize)]
pub struct LocalRateLimitConfig {
    /// Accesses allowed per window.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Window length.
    #[serde(
        default = "default_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,
}

fn default_count() -> u32 {
    1000
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

struct Window {
    started: Instant,
    used: u32,
}

/// Process-local fixed-window rate limiter.
pub struct LocalRateLimit {
    count: u32,
    interval: Duration,
    window: Mutex<Window>,
}

impl LocalRateLimit {
    /// Create a limiter from config. A zero count is a config error.
    pub fn new(conf: LocalRateLimitConfig) -> Result<Self> {
        if conf.count == 0 {
            return Err(Error::Config("rate limit count must be above zero".into()));
        }
        if conf.interval.is_zero() {
            return Err(Error::Config(
                "rate limit interval must be above zero".into(),
            ));
        }
        Ok(Self {
            count: conf.count,
            interval: conf.interval,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        })
    }
}

#[async_trait]
impl RateLimit for LocalRateLimit {
    async fn access(&self) -> Result<Duration> {
        let now = Instant::now();
        let mut window = self.window.lock();

        let elapsed = now.duration_since(window.started);
        if elapsed >= self.interval {
            window.started = now;
            window.used = 0;
        }

        if window.used < self.count {
            window.used += 1;
            Ok(Duration::ZERO)
        } else {
            Ok(self.interval.saturating_sub(elapsed))
        }
    }
}
