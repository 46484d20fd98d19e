//! Fan-out broker: deliver every transaction to every child
//!
//! The parent acknowledgement resolves successfully only when all children
//! have resolved successfully; the first child error fails the parent.
//! Children may observe a transaction in overlapping time and there is no
//! guarantee which completes first. Per-child retry policy is composed by
//! wrapping individual children in `retry`.

use super::OutputHandle;
use crate::config::ComponentConfig;
use crate::manager::Manager;
use serde::Deserialize;
use tokio::sync::mpsc;
use virta_core::{Error, Result, Transaction};

/// Config fields accepted by the `fan_out` output.
pub const CONFIG_FIELDS: &[&str] = &["outputs"];

/// Configuration for the fan-out broker.
#[derive(Debug, Clone, Deserialize)]
pub struct FanOutConfig {
    /// Child output fragments.
    pub outputs: Vec<ComponentConfig>,
}

/// Build a fan-out broker over the configured children.
pub fn build_fan_out(conf: &FanOutConfig, mgr: &Manager) -> Result<OutputHandle> {
    if conf.outputs.is_empty() {
        return Err(Error::Config(
            "fan-out broker requires at least one output".into(),
        ));
    }

    let mut children = Vec::with_capacity(conf.outputs.len());
    for (i, child_conf) in conf.outputs.iter().enumerate() {
        children.push(
            mgr.into_path(&["fan_out", &i.to_string()])
                .new_output(child_conf)?,
        );
    }

    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(run_fan_out(rx, children));
    Ok(OutputHandle::from_task("fan_out".into(), tx, task))
}

pub(crate) async fn run_fan_out(mut rx: mpsc::Receiver<Transaction>, children: Vec<OutputHandle>) {
    while let Some(txn) = rx.recv().await {
        let (batch, ack) = txn.into_parts();
        let acks = ack.split(children.len());

        for (child, child_ack) in children.iter().zip(acks) {
            let child_txn = Transaction::from_parts(batch.clone(), child_ack);
            if let Err(err) = child.send(child_txn).await {
                // The rejected transaction's ack resolves as a shutdown
                // nack on drop, failing the parent via the join.
                tracing::error!(child = child.name(), error = %err, "fan-out child rejected send");
            }
        }
    }

    let closes = children.into_iter().map(OutputHandle::close);
    for res in futures::future::join_all(closes).await {
        if let Err(err) = res {
            tracing::warn!(error = %err, "fan-out child close failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::tests::CapturingOutput;
    use super::*;
    use crate::output::spawn_output;
    use std::sync::Arc;
    use virta_core::MessageBatch;

    fn fan_out_over(children: Vec<OutputHandle>) -> OutputHandle {
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(run_fan_out(rx, children));
        OutputHandle::from_task("fan_out".into(), tx, task)
    }

    #[tokio::test]
    async fn every_child_receives_every_batch() {
        let a = CapturingOutput::new();
        let b = CapturingOutput::new();
        let wrote_a = Arc::clone(&a.written);
        let wrote_b = Arc::clone(&b.written);

        let broker = fan_out_over(vec![
            spawn_output(Box::new(a), "a".into()),
            spawn_output(Box::new(b), "b".into()),
        ]);

        for i in 0..3 {
            let (txn, rx) = Transaction::new(MessageBatch::from_payloads([format!("m{i}")]));
            broker.send(txn).await.unwrap();
            assert_eq!(rx.wait().await, Ok(()));
        }

        assert_eq!(wrote_a.lock().as_slice(), &["m0", "m1", "m2"]);
        assert_eq!(wrote_b.lock().as_slice(), &["m0", "m1", "m2"]);

        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn parent_acks_only_after_all_children() {
        // One healthy child, one that fails: parent must see the error.
        let ok = CapturingOutput::new();
        let bad = CapturingOutput::failing(1);

        let broker = fan_out_over(vec![
            spawn_output(Box::new(ok), "ok".into()),
            spawn_output(Box::new(bad), "bad".into()),
        ]);

        let (txn, rx) = Transaction::new(MessageBatch::from_payloads(["x"]));
        broker.send(txn).await.unwrap();
        assert!(matches!(rx.wait().await, Err(Error::Transient(_))));

        // With both healthy the parent acks clean.
        let (txn, rx) = Transaction::new(MessageBatch::from_payloads(["y"]));
        broker.send(txn).await.unwrap();
        assert_eq!(rx.wait().await, Ok(()));

        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_drains_children() {
        let a = CapturingOutput::new();
        let closed = Arc::clone(&a.closed);
        let broker = fan_out_over(vec![spawn_output(Box::new(a), "a".into())]);

        let (txn, rx) = Transaction::new(MessageBatch::from_payloads(["z"]));
        broker.send(txn).await.unwrap();
        assert_eq!(rx.wait().await, Ok(()));

        broker.close().await.unwrap();
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
