//! Auto-retry wrapper: transparent redelivery of nacked batches
//!
//! Wraps a driver so that a downstream nack causes the same batch to be
//! re-presented on a subsequent read, converting transient failures into
//! redelivery without the driver handling it. Inputs whose sources cannot
//! replay (the sharded-log consumer's pull model, generators) are wrapped
//! with this at construction.
//!
//! Nacked batches are held in memory until redelivered. The set is bounded
//! by `max_retries` per batch: once a batch has been retried that many
//! times its failure is surfaced to the driver's own acknowledgement
//! instead. The default of zero retries without bound, matching drop-free
//! delivery at the cost of unbounded memory under a permanently failing
//! downstream.

use super::{AckFn, Input, ReadBatch};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use virta_core::{MessageBatch, Result};

/// Configuration for [`AutoRetryInput`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AutoRetryConfig {
    /// Redeliveries per batch before the failure is surfaced to the driver.
    /// Zero retries without bound.
    #[serde(default)]
    pub max_retries: u32,
}

struct PendingBatch {
    batch: MessageBatch,
    ack: AckFn,
    attempts: u32,
}

struct Shared {
    pending: Mutex<VecDeque<PendingBatch>>,
    notify: Notify,
    max_retries: u32,
}

/// Input wrapper that re-presents nacked batches.
pub struct AutoRetryInput {
    inner: Box<dyn Input>,
    shared: Arc<Shared>,
}

impl AutoRetryInput {
    /// Wrap a driver.
    pub fn new(inner: Box<dyn Input>, conf: AutoRetryConfig) -> Self {
        Self {
            inner,
            shared: Arc::new(Shared {
                pending: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                max_retries: conf.max_retries,
            }),
        }
    }

    fn wrap(&self, pending: PendingBatch) -> ReadBatch {
        let shared = Arc::clone(&self.shared);
        let batch = pending.batch.clone();
        let PendingBatch {
            batch: retained,
            ack,
            attempts,
        } = pending;
        ReadBatch {
            batch,
            ack: Box::new(move |res| match res {
                Ok(()) => ack(Ok(())),
                Err(err) if err.is_shutdown() => ack(Err(err)),
                Err(err) => {
                    let attempts = attempts + 1;
                    if shared.max_retries > 0 && attempts > shared.max_retries {
                        tracing::warn!(
                            attempts,
                            error = %err,
                            "retry ceiling reached, surfacing nack to driver"
                        );
                        ack(Err(err));
                        return;
                    }
                    tracing::debug!(attempts, error = %err, "requeueing nacked batch");
                    shared.pending.lock().push_back(PendingBatch {
                        batch: retained,
                        ack,
                        attempts,
                    });
                    shared.notify.notify_one();
                }
            }),
        }
    }
}

#[async_trait]
impl Input for AutoRetryInput {
    async fn connect(&mut self) -> Result<()> {
        self.inner.connect().await
    }

    async fn read_batch(&mut self) -> Result<ReadBatch> {
        loop {
            if let Some(pending) = self.shared.pending.lock().pop_front() {
                return Ok(self.wrap(pending));
            }

            // A nack arriving while we block on the driver wakes us to
            // serve the redelivery first.
            let fresh = tokio::select! {
                res = self.inner.read_batch() => Some(res?),
                _ = self.shared.notify.notified() => None,
            };
            if let Some(ReadBatch { batch, ack }) = fresh {
                return Ok(self.wrap(PendingBatch {
                    batch,
                    ack,
                    attempts: 0,
                }));
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use virta_core::Error;

    /// Driver producing numbered messages, recording its own acks.
    struct Numbers {
        produced: usize,
        limit: usize,
        acks: Arc<Mutex<Vec<virta_core::AckResult>>>,
    }

    #[async_trait]
    impl Input for Numbers {
        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn read_batch(&mut self) -> Result<ReadBatch> {
            if self.produced >= self.limit {
                // Idle source: block until cancelled.
                std::future::pending::<()>().await;
                unreachable!()
            }
            let n = self.produced;
            self.produced += 1;
            let acks = Arc::clone(&self.acks);
            Ok(ReadBatch {
                batch: MessageBatch::from_payloads([format!("{n}")]),
                ack: Box::new(move |res| acks.lock().push(res)),
            })
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn payload(read: &ReadBatch) -> String {
        read.batch.get(0).unwrap().payload_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn nack_redelivers_same_batch() {
        let acks = Arc::new(Mutex::new(Vec::new()));
        let mut input = AutoRetryInput::new(
            Box::new(Numbers {
                produced: 0,
                limit: 2,
                acks: Arc::clone(&acks),
            }),
            AutoRetryConfig::default(),
        );

        let first = input.read_batch().await.unwrap();
        assert_eq!(payload(&first), "0");
        (first.ack)(Err(Error::Transient("downstream".into())));

        // The nacked batch is re-presented before new reads.
        let redelivered = input.read_batch().await.unwrap();
        assert_eq!(payload(&redelivered), "0");
        (redelivered.ack)(Ok(()));

        // The driver sees a single successful ack, no nack.
        assert_eq!(acks.lock().as_slice(), &[Ok(())]);

        let next = input.read_batch().await.unwrap();
        assert_eq!(payload(&next), "1");
    }

    #[tokio::test]
    async fn ceiling_surfaces_failure_to_driver() {
        let acks = Arc::new(Mutex::new(Vec::new()));
        let mut input = AutoRetryInput::new(
            Box::new(Numbers {
                produced: 0,
                limit: 1,
                acks: Arc::clone(&acks),
            }),
            AutoRetryConfig { max_retries: 1 },
        );

        let first = input.read_batch().await.unwrap();
        (first.ack)(Err(Error::Transient("1st".into())));

        let retry = input.read_batch().await.unwrap();
        (retry.ack)(Err(Error::Transient("2nd".into())));

        // Ceiling of one retry reached; the driver is told.
        assert_eq!(acks.lock().len(), 1);
        assert!(acks.lock()[0].is_err());
    }

    #[tokio::test]
    async fn shutdown_nack_is_not_retried() {
        let acks = Arc::new(Mutex::new(Vec::new()));
        let mut input = AutoRetryInput::new(
            Box::new(Numbers {
                produced: 0,
                limit: 1,
                acks: Arc::clone(&acks),
            }),
            AutoRetryConfig::default(),
        );

        let first = input.read_batch().await.unwrap();
        (first.ack)(Err(Error::Shutdown));

        assert_eq!(acks.lock().as_slice(), &[Err(Error::Shutdown)]);
    }

    #[tokio::test]
    async fn nack_wakes_blocked_read() {
        let acks = Arc::new(Mutex::new(Vec::new()));
        let mut input = AutoRetryInput::new(
            Box::new(Numbers {
                produced: 0,
                limit: 1,
                acks: Arc::clone(&acks),
            }),
            AutoRetryConfig::default(),
        );

        let first = input.read_batch().await.unwrap();
        let ack = first.ack;

        // Nack from another task while the next read blocks on the idle
        // driver.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            ack(Err(Error::Transient("later".into())));
        });

        let redelivered = input.read_batch().await.unwrap();
        assert_eq!(payload(&redelivered), "0");
        handle.await.unwrap();
    }
}
