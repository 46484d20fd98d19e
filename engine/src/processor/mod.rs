//! Processor runtime
//!
//! A processor consumes a batch and produces zero or more batches. It may
//! drop, split or enrich. Message-level failures are tagged on the message
//! (see [`virta_core::Message::set_error`]) rather than failing the whole
//! batch; returning `Err` from [`Processor::process`] is reserved for
//! failures that must nack the transaction.
//!
//! ```text
//! Input ──► Processor ──► Processor ──► ... ──► Output
//!              │
//!              ├─► mapping  (rewrite the payload document)
//!              ├─► dedupe   (drop repeats within a cache window)
//!              └─► batch    (window messages into larger batches)
//! ```

pub mod batching;
pub mod dedupe;
pub mod mapping;

pub use batching::{BatchPolicy, BatchPolicyConfig, BatchProcessor};
pub use dedupe::{DedupeConfig, DedupeProcessor};
pub use mapping::MappingProcessor;

use async_trait::async_trait;
use std::sync::Arc;
use virta_core::{MessageBatch, Result};

/// Transformer of batches.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Processor name for logs and metrics.
    fn name(&self) -> &str;

    /// Transform one batch into zero or more batches.
    async fn process(&self, batch: MessageBatch) -> Result<Vec<MessageBatch>>;

    /// Emit any internally buffered state as a final wave.
    ///
    /// Stateful processors (batching) override this; it is called when the
    /// upstream channel closes during shutdown.
    async fn flush(&self) -> Result<Vec<MessageBatch>> {
        Ok(Vec::new())
    }

    /// How long until buffered state must be flushed, if any is pending.
    fn until_flush(&self) -> Option<std::time::Duration> {
        None
    }

    /// Release any held resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Run a batch through a chain of processors in order.
///
/// Each processor's output batches all pass through the remaining chain.
/// An empty result means every message was absorbed or dropped.
pub async fn run_chain(
    processors: &[Arc<dyn Processor>],
    batch: MessageBatch,
) -> Result<Vec<MessageBatch>> {
    let mut batches = vec![batch];
    for processor in processors {
        let mut next = Vec::new();
        for batch in batches {
            next.extend(processor.process(batch).await?);
        }
        batches = next;
        if batches.is_empty() {
            break;
        }
    }
    Ok(batches)
}

/// Flush every processor, feeding each flush through the rest of the chain.
pub async fn flush_chain(processors: &[Arc<dyn Processor>]) -> Result<Vec<MessageBatch>> {
    let mut out = Vec::new();
    for (i, processor) in processors.iter().enumerate() {
        for batch in processor.flush().await? {
            out.extend(run_chain(&processors[i + 1..], batch).await?);
        }
    }
    Ok(out)
}

/// The nearest pending flush deadline across a chain, if any.
pub fn chain_until_flush(processors: &[Arc<dyn Processor>]) -> Option<std::time::Duration> {
    processors
        .iter()
        .filter_map(|p| p.until_flush())
        .min()
}

/// Delegates to a named processor resource.
///
/// Lets several streams share one stateful processor (a dedupe window, a
/// batch accumulator) registered under `resources.processors`.
pub struct ResourceProcessor {
    name: String,
    manager: crate::manager::Manager,
}

impl ResourceProcessor {
    /// Reference a named processor resource.
    pub fn new(name: impl Into<String>, manager: &crate::manager::Manager) -> Self {
        Self {
            name: name.into(),
            manager: manager.clone(),
        }
    }
}

#[async_trait]
impl Processor for ResourceProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, batch: MessageBatch) -> Result<Vec<MessageBatch>> {
        self.manager
            .access_processor(&self.name, |p| async move { p.process(batch).await })
            .await?
    }

    async fn flush(&self) -> Result<Vec<MessageBatch>> {
        self.manager
            .access_processor(&self.name, |p| async move { p.flush().await })
            .await?
    }
}
