//! virta-engine - the stream runtime
//!
//! A configurable stream-processing engine: pluggable inputs connected to
//! pluggable outputs through a chain of processors, with at-least-once
//! delivery, backpressure, batching, and runtime reconfiguration of broker
//! children.
//!
//! # Architecture
//!
//! ```text
//! Input ──► Pipeline (processors) ──► [Buffer] ──► Output
//!   ▲                                                │
//!   └──────────── acknowledgements ◄─────────────────┘
//! ```
//!
//! Components hand each other [`virta_core::Transaction`]s over bounded
//! channels; bounded channels are the sole backpressure mechanism. Broker
//! combinators (fan-in, fan-out, retry, drop-on, dynamic) compose at the
//! transaction level, so leaf drivers never know they are composed.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

/// Admin HTTP surface
pub mod api;
/// Buffer stage
pub mod buffer;
/// Cache resources
pub mod cache;
/// Configuration model
pub mod config;
/// Input contract, drivers and brokers
pub mod input;
/// Interpolation glue
pub mod interp;
/// Manager and resource registries
pub mod manager;
/// Prometheus metrics
pub mod metrics;
/// Output contract, drivers and brokers
pub mod output;
/// Processor runtime
pub mod pipeline;
/// Processor implementations
pub mod processor;
/// Rate limit resources
pub mod ratelimit;
/// Constructor environment
pub mod registry;
/// Coordinated sharded-log consumer
pub mod shard;
/// Stream lifecycle
pub mod stream;

pub use config::{ComponentConfig, EngineConfig, LintMode, StreamConfig};
pub use manager::Manager;
pub use metrics::Metrics;
pub use registry::Environment;
pub use stream::Stream;

// The primitives, re-exported for drivers and embedders.
pub use virta_core::{Ack, AckReceiver, AckResult, Error, Message, MessageBatch, Result, Transaction};
