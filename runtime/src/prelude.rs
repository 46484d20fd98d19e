//! Convenience re-exports for stream authors.
//!
//! ```rust
//! use virta_runtime::prelude::*;
//! ```

// Core types
pub use virta_core::{Ack, AckReceiver, AckResult, Error, Message, MessageBatch, Transaction};

// Configuration and assembly
pub use virta_engine::{ComponentConfig, EngineConfig, Environment, Manager, Stream, StreamConfig};

// Driver contracts
pub use virta_engine::input::{Input, InputHandle, ReadBatch, spawn_input};
pub use virta_engine::output::{Output, OutputHandle, spawn_output};
pub use virta_engine::processor::Processor;

// Broker controls
pub use virta_engine::input::DynamicInputControl;
pub use virta_engine::output::{BackoffConfig, DynamicOutputControl};

// Resources
pub use virta_engine::cache::{Cache, MemoryCache};
pub use virta_engine::ratelimit::{LocalRateLimit, RateLimit};

// Coordinated consumer
pub use virta_engine::shard::{
    LeaseStore, LogStore, MemoryLeaseStore, MemoryLogStore, ShardedLogConfig, ShardedLogInput,
};

// Zero-copy payload
pub use bytes::Bytes;

// Runtime
pub use crate::{StreamsSupervisor, run, run_from_str};
