//! Output contract and sink runtime
//!
//! An [`Output`] driver writes batches to its destination. The engine wraps
//! every driver in a sink task that consumes [`Transaction`]s from a
//! bounded channel, writes them, and resolves each acknowledgement with the
//! write outcome. Brokers and policy wrappers compose at the transaction
//! level, so drivers never know they are composed.
//!
//! ```text
//! pipeline ──► (capacity-1 channel) ──► sink task ──► driver.write_batch()
//!                                          │
//!                                          └── txn.ack(outcome)
//! ```

pub mod drop_on;
pub mod dynamic;
pub mod fan_out;
pub mod retry;
pub mod write;

pub use drop_on::{DropOnConfig, build_drop_on};
pub use dynamic::{DynamicFanOutConfig, DynamicOutputControl, build_dynamic_fan_out};
pub use fan_out::{FanOutConfig, build_fan_out};
pub use retry::{BackoffConfig, RetryConfig, build_retry};
pub use write::{
    DropOutput, FileOutput, FileOutputConfig, RejectOutput, RejectOutputConfig, StdoutOutput,
};

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use virta_core::{Error, MessageBatch, Result, Transaction};

/// A sink driver.
///
/// Connect/Close transitions are serialised against writes by the sink
/// task. A write returning [`Error::NotConnected`] triggers one reconnect
/// and retry; other errors surface on the transaction acknowledgement.
#[async_trait]
pub trait Output: Send {
    /// Establish the connection to the destination.
    async fn connect(&mut self) -> Result<()>;

    /// Write one batch.
    async fn write_batch(&mut self, batch: &MessageBatch) -> Result<()>;

    /// Flush and release the destination.
    async fn close(&mut self) -> Result<()>;
}

/// A running output component: leaf sink, wrapper or broker.
///
/// Holding the handle keeps the component accepting transactions; closing
/// it drains the channel, closes children (for brokers) and releases the
/// driver.
#[derive(Debug)]
pub struct OutputHandle {
    tx: mpsc::Sender<Transaction>,
    task: JoinHandle<()>,
    /// Interrupt for wrappers with internal wait loops (retry backoff);
    /// fired when a close deadline expires.
    interrupt: Option<watch::Sender<bool>>,
    name: String,
    started: Instant,
}

impl OutputHandle {
    /// Assemble a handle from a spawned component task.
    pub fn from_task(name: String, tx: mpsc::Sender<Transaction>, task: JoinHandle<()>) -> Self {
        Self {
            tx,
            task,
            interrupt: None,
            name,
            started: Instant::now(),
        }
    }

    /// Attach an interrupt fired when a close deadline expires.
    pub fn with_interrupt(mut self, interrupt: watch::Sender<bool>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Component name for logs and the admin surface.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How long this component has been running.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Hand a transaction to the component. `Err(Shutdown)` once closed.
    pub async fn send(&self, txn: Transaction) -> Result<()> {
        self.tx.send(txn).await.map_err(|_| Error::Shutdown)
    }

    /// A clone of the ingoing channel, for wiring.
    pub fn sender(&self) -> mpsc::Sender<Transaction> {
        self.tx.clone()
    }

    /// Drain and stop the component, waiting indefinitely.
    pub async fn close(self) -> Result<()> {
        let OutputHandle { tx, task, .. } = self;
        drop(tx);
        task.await.map_err(|e| Error::Io(e.to_string()))
    }

    /// Drain and stop within `deadline`.
    ///
    /// On expiry the interrupt (if any) is fired to abort internal retry
    /// loops, and after a short grace the task is aborted outright. Returns
    /// [`Error::Timeout`] whenever the deadline was missed.
    pub async fn close_within(self, deadline: Duration) -> Result<()> {
        let OutputHandle {
            tx,
            mut task,
            interrupt,
            name,
            ..
        } = self;
        drop(tx);

        if tokio::time::timeout(deadline, &mut task).await.is_ok() {
            return Ok(());
        }

        tracing::warn!(output = %name, "close deadline expired, interrupting");
        if let Some(interrupt) = interrupt {
            let _ = interrupt.send(true);
            if tokio::time::timeout(Duration::from_millis(100), &mut task)
                .await
                .is_ok()
            {
                return Err(Error::Timeout);
            }
        }
        task.abort();
        Err(Error::Timeout)
    }
}

/// Spawn the sink task for a leaf driver.
pub fn spawn_output(driver: Box<dyn Output>, label: String) -> OutputHandle {
    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(run_sink(driver, rx, label.clone()));
    OutputHandle::from_task(label, tx, task)
}

async fn run_sink(
    mut driver: Box<dyn Output>,
    mut rx: mpsc::Receiver<Transaction>,
    label: String,
) {
    let mut connected = false;

    while let Some(txn) = rx.recv().await {
        let res = write_with_reconnect(driver.as_mut(), &mut connected, &txn.batch).await;
        match &res {
            Ok(()) => {
                if let Some(metrics) = crate::metrics::Metrics::get() {
                    metrics.record_output_sent(&label, txn.batch.len());
                }
                tracing::debug!(output = %label, count = txn.batch.len(), "batch written");
            }
            Err(err) => {
                if let Some(metrics) = crate::metrics::Metrics::get() {
                    metrics.record_output_error(&label);
                }
                tracing::error!(output = %label, error = %err, "failed to write batch");
            }
        }
        txn.ack(res);
    }

    if let Err(err) = driver.close().await {
        tracing::warn!(output = %label, error = %err, "output close failed");
    }
}

async fn write_with_reconnect(
    driver: &mut dyn Output,
    connected: &mut bool,
    batch: &MessageBatch,
) -> Result<()> {
    if !*connected {
        driver.connect().await?;
        *connected = true;
    }
    match driver.write_batch(batch).await {
        Err(Error::NotConnected) => {
            *connected = false;
            driver.connect().await?;
            *connected = true;
            driver.write_batch(batch).await
        }
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Sink recording batches, optionally failing the first N writes.
    pub(crate) struct CapturingOutput {
        pub written: Arc<Mutex<Vec<String>>>,
        pub fail_first: Arc<AtomicUsize>,
        pub closed: Arc<AtomicBool>,
    }

    impl CapturingOutput {
        pub(crate) fn new() -> Self {
            Self {
                written: Arc::new(Mutex::new(Vec::new())),
                fail_first: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        pub(crate) fn failing(n: usize) -> Self {
            let out = Self::new();
            out.fail_first.store(n, Ordering::SeqCst);
            out
        }
    }

    #[async_trait]
    impl Output for CapturingOutput {
        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn write_batch(&mut self, batch: &MessageBatch) -> Result<()> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Transient("injected".into()));
            }
            for msg in batch.iter() {
                self.written
                    .lock()
                    .push(msg.payload_str().unwrap_or_default().to_string());
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn txn_of(payload: &str) -> (Transaction, virta_core::AckReceiver) {
        Transaction::new(MessageBatch::from_payloads([payload.to_string()]))
    }

    #[tokio::test]
    async fn sink_writes_and_acks() {
        let driver = CapturingOutput::new();
        let written = Arc::clone(&driver.written);
        let closed = Arc::clone(&driver.closed);

        let handle = spawn_output(Box::new(driver), "cap".into());

        let (txn, rx) = txn_of("hello");
        handle.send(txn).await.unwrap();
        assert_eq!(rx.wait().await, Ok(()));
        assert_eq!(written.lock().as_slice(), &["hello"]);

        handle.close().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn sink_nacks_on_write_error() {
        let driver = CapturingOutput::failing(1);
        let handle = spawn_output(Box::new(driver), "failing".into());

        let (txn, rx) = txn_of("doomed");
        handle.send(txn).await.unwrap();
        assert!(rx.wait().await.is_err());

        // Next write succeeds; the sink stays alive through failures.
        let (txn, rx) = txn_of("fine");
        handle.send(txn).await.unwrap();
        assert_eq!(rx.wait().await, Ok(()));

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn not_connected_triggers_reconnect() {
        struct Flaky {
            connects: Arc<AtomicUsize>,
            wrote: Arc<AtomicUsize>,
            failed_once: bool,
        }

        #[async_trait]
        impl Output for Flaky {
            async fn connect(&mut self) -> Result<()> {
                self.connects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            async fn write_batch(&mut self, _batch: &MessageBatch) -> Result<()> {
                if !self.failed_once {
                    self.failed_once = true;
                    return Err(Error::NotConnected);
                }
                self.wrote.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            async fn close(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let connects = Arc::new(AtomicUsize::new(0));
        let wrote = Arc::new(AtomicUsize::new(0));
        let handle = spawn_output(
            Box::new(Flaky {
                connects: Arc::clone(&connects),
                wrote: Arc::clone(&wrote),
                failed_once: false,
            }),
            "flaky".into(),
        );

        let (txn, rx) = txn_of("x");
        handle.send(txn).await.unwrap();
        assert_eq!(rx.wait().await, Ok(()));

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(wrote.load(Ordering::SeqCst), 1);

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_within_times_out_on_stuck_driver() {
        struct Stuck;

        #[async_trait]
        impl Output for Stuck {
            async fn connect(&mut self) -> Result<()> {
                Ok(())
            }
            async fn write_batch(&mut self, _batch: &MessageBatch) -> Result<()> {
                Ok(())
            }
            async fn close(&mut self) -> Result<()> {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }

        let handle = spawn_output(Box::new(Stuck), "stuck".into());
        let started = std::time::Instant::now();
        let res = handle.close_within(Duration::from_millis(100)).await;
        assert_eq!(res, Err(Error::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn send_after_close_is_shutdown() {
        let handle = spawn_output(Box::new(CapturingOutput::new()), "cap".into());
        let sender = handle.sender();
        handle.close().await.unwrap();

        let (txn, _rx) = txn_of("late");
        assert!(sender.send(txn).await.is_err());
    }
}
