//! Input contract and reader runtime
//!
//! An [`Input`] driver produces batches plus an acknowledgement callback.
//! The engine wraps every driver in a reader task that turns reads into
//! [`Transaction`]s on a bounded channel and forwards the downstream
//! acknowledgement back to the driver. Drivers never see the channel; the
//! engine never sees the source.
//!
//! ```text
//! driver.read_batch() ──► Transaction ──► (capacity-1 channel) ──► pipeline
//!          ▲                                                         │
//!          └───────────────── ack callback ◄─────────────────────────┘
//! ```
//!
//! The acknowledgement callback is how a driver learns it may advance its
//! source position: it fires with `Ok` only once the batch reached a
//! terminal output or was dropped by explicit policy.

pub mod auto_retry;
pub mod broker;
pub mod dynamic;
pub mod generate;

pub use auto_retry::{AutoRetryConfig, AutoRetryInput};
pub use broker::{FanInConfig, build_fan_in};
pub use dynamic::{DynamicFanInConfig, DynamicInputControl, build_dynamic_fan_in};
pub use generate::{GenerateConfig, GenerateInput};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use virta_core::{AckResult, Error, MessageBatch, Result, Transaction};

/// Callback a driver attaches to each read, fired with the transaction
/// outcome.
pub type AckFn = Box<dyn FnOnce(AckResult) + Send>;

/// One read from a driver: the batch and its acknowledgement hook.
pub struct ReadBatch {
    /// The messages read.
    pub batch: MessageBatch,
    /// Invoked exactly once with the delivery outcome.
    pub ack: AckFn,
}

impl std::fmt::Debug for ReadBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBatch")
            .field("batch", &self.batch)
            .field("ack", &"<ack fn>")
            .finish()
    }
}

impl ReadBatch {
    /// A read whose source needs no acknowledgement.
    pub fn unacked(batch: MessageBatch) -> Self {
        Self {
            batch,
            ack: Box::new(|_| {}),
        }
    }
}

/// A source driver.
///
/// Connect/Close transitions are serialised against reads by the reader
/// task; a driver never sees overlapping calls. Reads must tolerate
/// cancellation at any await point.
#[async_trait]
pub trait Input: Send {
    /// Establish the connection to the source.
    async fn connect(&mut self) -> Result<()>;

    /// Read the next batch. [`Error::NotConnected`] triggers a reconnect,
    /// [`Error::Shutdown`] ends the reader.
    async fn read_batch(&mut self) -> Result<ReadBatch>;

    /// Release the source.
    async fn close(&mut self) -> Result<()>;
}

/// Control half of a running input: stop signal plus the reader task.
pub struct InputControl {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl InputControl {
    /// Tell the input to stop producing new transactions. In-flight
    /// transactions still receive their acknowledgements.
    pub fn trigger_stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Whether the reader task has finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the reader task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    /// Wait up to `deadline` for the reader to finish, aborting it on
    /// expiry.
    pub async fn join_within(mut self, deadline: Duration) -> Result<()> {
        match tokio::time::timeout(deadline, &mut self.task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                self.task.abort();
                Err(Error::Timeout)
            }
        }
    }

    /// Decompose into the stop signal and the reader task, for supervisors
    /// that track tasks by name.
    pub fn into_parts(self) -> (watch::Sender<bool>, JoinHandle<()>) {
        (self.stop, self.task)
    }
}

/// A running input: the transaction stream plus its control half.
pub struct InputHandle {
    rx: mpsc::Receiver<Transaction>,
    control: InputControl,
}

impl InputHandle {
    /// Assemble a handle from raw parts. Used by brokers that merge or
    /// wrap other inputs.
    pub fn from_parts(
        rx: mpsc::Receiver<Transaction>,
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            control: InputControl { stop, task },
        }
    }

    /// Receive the next transaction. `None` once the input has stopped and
    /// drained.
    pub async fn recv(&mut self) -> Option<Transaction> {
        self.rx.recv().await
    }

    /// See [`InputControl::trigger_stop`].
    pub fn trigger_stop(&self) {
        self.control.trigger_stop();
    }

    /// Separate the transaction stream from the control half, for wiring
    /// into a pipeline while the stream keeps the control for shutdown.
    pub fn split(self) -> (mpsc::Receiver<Transaction>, InputControl) {
        (self.rx, self.control)
    }
}

/// Spawn the reader task for a driver.
pub fn spawn_input(driver: Box<dyn Input>, label: String) -> InputHandle {
    let (tx, rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run_reader(driver, tx, stop_rx, label));
    InputHandle::from_parts(rx, stop_tx, task)
}

async fn run_reader(
    mut driver: Box<dyn Input>,
    tx: mpsc::Sender<Transaction>,
    mut stop: watch::Receiver<bool>,
    label: String,
) {
    let mut connected = false;
    let mut reconnect_wait = Duration::from_millis(100);
    const MAX_RECONNECT_WAIT: Duration = Duration::from_secs(5);

    loop {
        if *stop.borrow() {
            break;
        }

        if !connected {
            tokio::select! {
                res = driver.connect() => match res {
                    Ok(()) => {
                        connected = true;
                        reconnect_wait = Duration::from_millis(100);
                        tracing::debug!(input = %label, "input connected");
                    }
                    Err(err) if err.is_shutdown() => break,
                    Err(err) => {
                        tracing::warn!(input = %label, error = %err, "input connect failed");
                        tokio::select! {
                            _ = tokio::time::sleep(reconnect_wait) => {}
                            _ = stop.changed() => {}
                        }
                        reconnect_wait = (reconnect_wait * 2).min(MAX_RECONNECT_WAIT);
                    }
                },
                _ = stop.changed() => {}
            }
            continue;
        }

        tokio::select! {
            res = driver.read_batch() => match res {
                Ok(ReadBatch { batch, ack }) => {
                    let count = batch.len();
                    let (txn, ack_rx) = Transaction::new(batch);
                    if tx.send(txn).await.is_err() {
                        // Downstream is gone; the source must not advance.
                        ack(Err(Error::Shutdown));
                        break;
                    }
                    if let Some(metrics) = crate::metrics::Metrics::get() {
                        metrics.record_input_received(&label, count);
                    }
                    // Forward the outcome without blocking further reads.
                    tokio::spawn(async move { ack(ack_rx.wait().await) });
                }
                Err(Error::NotConnected) => {
                    connected = false;
                }
                Err(Error::Timeout) => {}
                Err(err) if err.is_shutdown() => break,
                Err(err) => {
                    tracing::error!(input = %label, error = %err, "failed to read batch");
                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_wait) => {}
                        _ = stop.changed() => {}
                    }
                }
            },
            _ = stop.changed() => {}
        }
    }

    if let Err(err) = driver.close().await {
        tracing::warn!(input = %label, error = %err, "input close failed");
    }
    // Dropping tx closes the channel, which propagates shutdown downstream.
}
