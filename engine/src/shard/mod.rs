//! Coordinated sharded-log consumer
//!
//! The reference implementation of the hardest driver class: one logical
//! consumer shared across N process instances, each processing a dynamic
//! subset of shards, with checkpoints and ownership leases persisted in an
//! external strongly-consistent KV store.
//!
//! ```text
//!             ┌───────────────┐
//!  instance A │ shards 0,1    │──┐
//!             └───────────────┘  │     ┌──────────────┐
//!             ┌───────────────┐  ├────►│ lease store  │
//!  instance B │ shards 2,3    │──┘     │ (checkpoints)│
//!             └───────────────┘        └──────────────┘
//! ```
//!
//! The module splits along the protocol seams:
//!
//! - [`store`] - the collaborator contracts: an ordered log
//!   ([`store::LogStore`]) and the conditional-update checkpoint KV
//!   ([`store::LeaseStore`]), with in-memory implementations.
//! - [`checkpointer`] - the ownership protocol: claim, commit, yield,
//!   delete, observed claims.
//! - [`batcher`] - the per-shard record batcher enforcing the checkpoint
//!   limit and the in-order committed-sequence watermark.
//! - [`input`] - the consumer itself: shard discovery, balancing, the
//!   per-shard state machine, and the rebalance/steal loop.

pub mod batcher;
pub mod checkpointer;
pub mod input;
pub mod store;

pub use batcher::ShardBatcher;
pub use checkpointer::Checkpointer;
pub use input::{ShardedLogConfig, ShardedLogInput};
pub use store::{
    CheckpointRecord, ClientClaim, IteratorPosition, LeaseStore, LogIterator, LogStore,
    LogStoreError, MemoryLeaseStore, MemoryLogStore, Record, ShardInfo,
};
