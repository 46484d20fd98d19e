//! Rate limit resources
//!
//! Rate limiters are named resources consulted through the manager. An
//! access returns the duration the caller should wait before trying again;
//! zero means the action is allowed now. Callers sleep outside the lease,
//! never inside it.

pub mod local;

pub use local::{LocalRateLimit, LocalRateLimitConfig};

use async_trait::async_trait;
use std::time::Duration;
use virta_core::Result;

/// A shared throughput gate.
///
/// Must be safe under concurrent access by construction: limiters are the
/// one resource kind with cross-stream shared mutable state.
#[async_trait]
pub trait RateLimit: Send + Sync {
    /// Request one unit of throughput.
    ///
    /// Returns [`Duration::ZERO`] when allowed, otherwise how long to wait
    /// before the next attempt.
    async fn access(&self) -> Result<Duration>;
}
