//! virta-core - primitives for the virta stream engine
//!
//! This crate provides the foundational types shared between the engine and
//! every component driver:
//!
//! - [`Message`] - the atom of data flow (zero-copy payload + metadata)
//! - [`MessageBatch`] - an ordered batch that succeeds or fails as one unit
//! - [`Transaction`] / [`Ack`] - the batch-plus-acknowledgement handoff that
//!   carries the at-least-once contract between components
//! - [`Error`] - the error taxonomy wrappers dispatch on
//!
//! # Why this crate exists
//!
//! Driver crates (inputs, outputs, processors maintained out of tree) need
//! the message and transaction types without pulling in the engine: brokers,
//! the manager, the admin surface. Keeping the primitives here breaks that
//! cycle:
//!
//! ```text
//! virta-core ◄── virta-engine
//!     ▲
//!     └────────── external drivers
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod error;
/// The message envelope and batch types
pub mod message;
/// Transactions and acknowledgements
pub mod transaction;

pub use error::{Error, Result};
pub use message::{Message, MessageBatch, Metadata};
pub use transaction::{Ack, AckReceiver, AckResult, Transaction};
