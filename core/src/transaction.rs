//! Transactions: the unit of handoff between components
//!
//! A [`Transaction`] is a batch of messages plus a single-use
//! acknowledgement. The consumer resolves the acknowledgement exactly once;
//! the producer awaits the matching [`AckReceiver`] before advancing its
//! source position. This is the at-least-once contract: a successful ack
//! permits the producing input to move its offset or checkpoint forward.
//!
//! ```text
//! Input ──txn──► Processor ──txn──► Output
//!   ▲                                 │
//!   └───────────── ack ◄──────────────┘
//! ```
//!
//! Acknowledgements are one-shot by construction: [`Ack::resolve`] takes the
//! value, so signalling twice is unrepresentable. Dropping an unresolved ack
//! is treated as a shutdown-nack so producers never hang.
//!
//! Splitting a batch derives child transactions whose completion is joined:
//! the parent resolves only after every child has resolved, with the first
//! child error winning.

use crate::error::{Error, Result};
use crate::message::MessageBatch;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Outcome of a transaction: `Ok(())` once every message was delivered to a
/// terminal output or dropped by explicit policy.
pub type AckResult = Result<()>;

/// Joins the acknowledgements of derived child transactions back into one
/// parent acknowledgement.
struct AckJoiner {
    remaining: AtomicUsize,
    first_err: std::sync::Mutex<Option<Error>>,
    parent: std::sync::Mutex<Option<Ack>>,
}

impl AckJoiner {
    fn new(parent: Ack, children: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(children),
            first_err: std::sync::Mutex::new(None),
            parent: std::sync::Mutex::new(Some(parent)),
        }
    }

    fn resolve_child(&self, res: AckResult) {
        if let Err(err) = res {
            let mut first = self
                .first_err
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if first.is_none() {
                *first = Some(err);
            }
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let err = self
                .first_err
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            let parent = self
                .parent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(parent) = parent {
                match err {
                    Some(err) => parent.resolve(Err(err)),
                    None => parent.resolve(Ok(())),
                }
            }
        }
    }
}

enum AckInner {
    Channel(oneshot::Sender<AckResult>),
    Joined(Arc<AckJoiner>),
    Noop,
}

/// Single-use acknowledgement handle.
///
/// Consumed by [`Ack::resolve`]; dropping an unresolved ack resolves it with
/// [`Error::Shutdown`] so an abandoned transaction still unblocks its
/// producer.
pub struct Ack {
    inner: Option<AckInner>,
}

impl Ack {
    fn from_channel(tx: oneshot::Sender<AckResult>) -> Self {
        Self {
            inner: Some(AckInner::Channel(tx)),
        }
    }

    /// An acknowledgement nobody is waiting on.
    ///
    /// Used by components that synthesise transactions internally (buffers,
    /// tests) where the upstream half has already been resolved.
    pub fn noop() -> Self {
        Self {
            inner: Some(AckInner::Noop),
        }
    }

    /// Resolve the acknowledgement with the transaction outcome.
    pub fn resolve(mut self, res: AckResult) {
        match self.inner.take() {
            Some(AckInner::Channel(tx)) => {
                // The receiver may have gone away during teardown; there is
                // nobody left to inform.
                let _ = tx.send(res);
            }
            Some(AckInner::Joined(joiner)) => joiner.resolve_child(res),
            Some(AckInner::Noop) | None => {}
        }
    }

    /// Derive `children` acknowledgements that join back into this one.
    ///
    /// The parent resolves once all children have resolved; the first child
    /// error wins. With `children == 0` the parent resolves `Ok` immediately.
    pub fn split(self, children: usize) -> Vec<Ack> {
        if children == 0 {
            self.resolve(Ok(()));
            return Vec::new();
        }
        if children == 1 {
            return vec![self];
        }
        let joiner = Arc::new(AckJoiner::new(self, children));
        (0..children)
            .map(|_| Ack {
                inner: Some(AckInner::Joined(Arc::clone(&joiner))),
            })
            .collect()
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            tracing::debug!("acknowledgement dropped unresolved, treating as shutdown nack");
            match inner {
                AckInner::Channel(tx) => {
                    let _ = tx.send(Err(Error::Shutdown));
                }
                AckInner::Joined(joiner) => joiner.resolve_child(Err(Error::Shutdown)),
                AckInner::Noop => {}
            }
        }
    }
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.inner {
            Some(AckInner::Channel(_)) => "pending",
            Some(AckInner::Joined(_)) => "joined",
            Some(AckInner::Noop) => "noop",
            None => "resolved",
        };
        write!(f, "Ack({state})")
    }
}

/// The producer's half of an acknowledgement.
#[derive(Debug)]
pub struct AckReceiver(oneshot::Receiver<AckResult>);

impl AckReceiver {
    /// Wait for the transaction outcome.
    ///
    /// A dropped sender (component torn down mid-flight) reads as
    /// [`Error::Shutdown`].
    pub async fn wait(self) -> AckResult {
        self.0.await.unwrap_or(Err(Error::Shutdown))
    }
}

/// A batch of messages travelling between exactly two components, plus the
/// acknowledgement the downstream side must resolve.
#[derive(Debug)]
pub struct Transaction {
    /// The messages carried by this transaction.
    pub batch: MessageBatch,
    ack: Ack,
}

impl Transaction {
    /// Create a transaction and the receiver its producer awaits.
    pub fn new(batch: MessageBatch) -> (Self, AckReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                batch,
                ack: Ack::from_channel(tx),
            },
            AckReceiver(rx),
        )
    }

    /// Assemble a transaction from a batch and an existing acknowledgement.
    pub fn from_parts(batch: MessageBatch, ack: Ack) -> Self {
        Self { batch, ack }
    }

    /// Take the transaction apart without resolving it.
    pub fn into_parts(self) -> (MessageBatch, Ack) {
        (self.batch, self.ack)
    }

    /// Resolve the transaction with its outcome.
    pub fn ack(self, res: AckResult) {
        self.ack.resolve(res);
    }

    /// Derive one child transaction per batch, joining their completion.
    ///
    /// The parent acknowledges only after all children acknowledge; the
    /// first non-ok child outcome becomes the parent outcome. An empty batch
    /// list resolves the parent `Ok` immediately.
    pub fn split(self, batches: Vec<MessageBatch>) -> Vec<Transaction> {
        let (_, ack) = self.into_parts();
        let acks = ack.split(batches.len());
        batches
            .into_iter()
            .zip(acks)
            .map(|(batch, ack)| Transaction { batch, ack })
            .collect()
    }
}
