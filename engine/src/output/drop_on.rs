//! Drop-on wrapper: convert selected failures into silent successful acks
//!
//! Wraps a child output with policy flags:
//!
//! - `error: true` - a child error acks the batch upstream as if delivered,
//!   with the failure logged. The batch is gone by explicit policy.
//! - `back_pressure: <duration>` - if the child has not resolved the
//!   transaction within the window, the batch is dropped and acked. The
//!   escape hatch for latency-critical producers in front of slow
//!   downstreams.
//!
//! Without either flag the wrapper is a pass-through.

use super::OutputHandle;
use crate::config::{ComponentConfig, deserialize_opt_duration};
use crate::manager::Manager;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use virta_core::{Error, Result, Transaction};

/// Config fields accepted by the `drop_on` output.
pub const CONFIG_FIELDS: &[&str] = &["error", "back_pressure", "output"];

/// Configuration for the drop-on wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct DropOnConfig {
    /// Drop batches the child fails instead of surfacing the error.
    #[serde(default)]
    pub error: bool,
    /// Drop batches the child has not resolved within this window.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub back_pressure: Option<Duration>,
    /// The wrapped output fragment.
    pub output: ComponentConfig,
}

/// Build a drop-on wrapper around the configured child.
pub fn build_drop_on(conf: &DropOnConfig, mgr: &Manager) -> Result<OutputHandle> {
    let child = mgr.into_path(&["drop_on"]).new_output(&conf.output)?;
    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(run_drop_on(rx, child, conf.error, conf.back_pressure));
    Ok(OutputHandle::from_task("drop_on".into(), tx, task))
}

async fn run_drop_on(
    mut rx: mpsc::Receiver<Transaction>,
    child: OutputHandle,
    drop_on_error: bool,
    back_pressure: Option<Duration>,
) {
    while let Some(txn) = rx.recv().await {
        let (batch, ack) = txn.into_parts();
        let count = batch.len();

        let delivery = async {
            let (child_txn, child_rx) = Transaction::new(batch);
            if child.send(child_txn).await.is_err() {
                return Err(Error::Shutdown);
            }
            child_rx.wait().await
        };

        let res = match back_pressure {
            Some(window) => match tokio::time::timeout(window, delivery).await {
                Ok(res) => res,
                Err(_) => {
                    tracing::error!(
                        count,
                        error = %Error::BackPressure(window),
                        "dropping batch"
                    );
                    if let Some(metrics) = crate::metrics::Metrics::get() {
                        metrics.record_dropped("drop_on", "back_pressure", count);
                    }
                    ack.resolve(Ok(()));
                    continue;
                }
            },
            None => delivery.await,
        };

        match res {
            Ok(()) => ack.resolve(Ok(())),
            Err(err) if drop_on_error => {
                tracing::warn!(count, error = %err, "dropping failed batch by policy");
                if let Some(metrics) = crate::metrics::Metrics::get() {
                    metrics.record_dropped("drop_on", "error", count);
                }
                ack.resolve(Ok(()));
            }
            Err(err) => ack.resolve(Err(err)),
        }
    }

    if let Err(err) = child.close().await {
        tracing::warn!(error = %err, "drop_on child close failed");
    }
}
