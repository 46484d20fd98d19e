//! Cache resources
//!
//! Caches are named resources shared across a stream (and across streams in
//! streams mode). They back the dedupe processor and anything else that
//! needs keyed state with a retention window. Implementations must be safe
//! under concurrent access by construction.

pub mod memory;

pub use memory::{MemoryCache, MemoryCacheConfig};

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use virta_core::Result;

/// Keyed byte storage with optional per-entry TTL.
///
/// The distinction between [`set`](Cache::set) and [`add`](Cache::add)
/// matters for dedupe: `add` fails with [`virta_core::Error::KeyAlreadyExists`]
/// when the key is present, which is the atomic first-writer-wins primitive
/// the fingerprint check relies on.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a value, `Error::KeyNotFound` on miss.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Store a value unconditionally.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Store a value only if the key is absent.
    ///
    /// `Error::KeyAlreadyExists` when another writer got there first.
    async fn add(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
