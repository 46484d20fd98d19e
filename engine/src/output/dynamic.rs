//! Dynamic fan-out: a broker whose child set mutates at runtime
//!
//! The broker pattern is always fan-out: each transaction is delivered to
//! every current child. Children are identified by label and mutated via
//! [`DynamicOutputControl`] (wired to the admin API):
//!
//! - `set` replacing an existing id drains the old child to completion
//!   (in-flight acknowledgements still flow) before installing the new
//!   one. The swap is invisible to producers.
//! - `remove` drains then destroys.
//! - Additions never block existing children.
//!
//! While the child set is empty the forwarding task holds the current
//! transaction and waits; producers block on the bounded channel rather
//! than observing failures or gaps.

use super::OutputHandle;
use crate::config::ComponentConfig;
use crate::manager::Manager;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};
use virta_core::{Error, Result, Transaction};

/// Config fields accepted by the `dynamic` output.
pub const CONFIG_FIELDS: &[&str] = &["outputs"];

/// Configuration for the dynamic fan-out.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DynamicFanOutConfig {
    /// Children to create statically at start.
    #[serde(default)]
    pub outputs: HashMap<String, ComponentConfig>,
}

struct ChildEntry {
    handle: OutputHandle,
    config: serde_json::Value,
    added: Instant,
}

#[derive(Default)]
struct Inner {
    children: Mutex<HashMap<String, ChildEntry>>,
    changed: Notify,
}

/// Runtime mutation handle for a dynamic fan-out.
#[derive(Clone)]
pub struct DynamicOutputControl {
    inner: Arc<Inner>,
}

impl DynamicOutputControl {
    /// Install (or replace) the child under `id`.
    pub async fn set(&self, id: &str, output: OutputHandle, config: serde_json::Value) -> Result<()> {
        // Taking the old child out of the map first stops new routing to
        // it; close() then drains its channel and awaits its task, so
        // every in-flight acknowledgement flows before the swap completes.
        let old = self.inner.children.lock().remove(id);
        if let Some(old) = old {
            tracing::info!(id = %id, "draining replaced dynamic output");
            old.handle.close().await?;
        }

        self.inner.children.lock().insert(
            id.to_string(),
            ChildEntry {
                handle: output,
                config,
                added: Instant::now(),
            },
        );
        self.inner.changed.notify_waiters();
        tracing::info!(id = %id, "dynamic output started");
        Ok(())
    }

    /// Drain and destroy the child under `id`.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let entry = self
            .inner
            .children
            .lock()
            .remove(id)
            .ok_or_else(|| Error::ResourceMissing(id.to_string()))?;
        entry.handle.close().await?;
        tracing::info!(id = %id, "dynamic output stopped");
        Ok(())
    }

    /// Like [`remove`](Self::remove) but bounded: the child is aborted if
    /// it fails to drain within the deadline.
    pub async fn remove_within(&self, id: &str, deadline: Duration) -> Result<()> {
        let entry = self
            .inner
            .children
            .lock()
            .remove(id)
            .ok_or_else(|| Error::ResourceMissing(id.to_string()))?;
        entry.handle.close_within(deadline).await
    }

    /// Current child ids and their uptimes.
    pub fn list(&self) -> Vec<(String, Duration)> {
        self.inner
            .children
            .lock()
            .iter()
            .map(|(id, e)| (id.clone(), e.added.elapsed()))
            .collect()
    }

    /// Uptime of one child.
    pub fn uptime(&self, id: &str) -> Option<Duration> {
        self.inner.children.lock().get(id).map(|e| e.added.elapsed())
    }

    /// Stored config of one child.
    pub fn config(&self, id: &str) -> Option<serde_json::Value> {
        self.inner.children.lock().get(id).map(|e| e.config.clone())
    }
}

/// Build a dynamic fan-out, returning the broker handle and the mutation
/// control.
pub fn build_dynamic_fan_out(
    conf: &DynamicFanOutConfig,
    mgr: &Manager,
) -> Result<(OutputHandle, DynamicOutputControl)> {
    let inner = Arc::new(Inner::default());
    let control = DynamicOutputControl {
        inner: Arc::clone(&inner),
    };

    for (id, child_conf) in &conf.outputs {
        let child = mgr.into_path(&["dynamic", id]).new_output(child_conf)?;
        inner.children.lock().insert(
            id.clone(),
            ChildEntry {
                handle: child,
                config: child_conf.to_value(),
                added: Instant::now(),
            },
        );
    }

    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(run_dynamic_fan_out(rx, Arc::clone(&inner)));

    Ok((
        OutputHandle::from_task("dynamic".into(), tx, task),
        control,
    ))
}

async fn run_dynamic_fan_out(mut rx: mpsc::Receiver<Transaction>, inner: Arc<Inner>) {
    while let Some(txn) = rx.recv().await {
        let (batch, ack) = txn.into_parts();

        // Snapshot the senders under the lock, deliver outside it. An
        // empty child set parks the transaction until a child appears;
        // back-pressure does the rest.
        let senders = loop {
            let senders: Vec<(String, mpsc::Sender<Transaction>)> = inner
                .children
                .lock()
                .iter()
                .map(|(id, e)| (id.clone(), e.handle.sender()))
                .collect();
            if !senders.is_empty() {
                break senders;
            }
            tracing::warn!("dynamic fan-out has no children, holding transaction");
            inner.changed.notified().await;
        };

        let acks = ack.split(senders.len());
        for ((id, sender), child_ack) in senders.into_iter().zip(acks) {
            let child_txn = Transaction::from_parts(batch.clone(), child_ack);
            if sender.send(child_txn).await.is_err() {
                // Child closed between snapshot and send; its ack resolves
                // as a shutdown nack on drop.
                tracing::error!(id = %id, "dynamic fan-out child closed mid-delivery");
            }
        }
    }

    // Drain remaining children on shutdown.
    let entries: Vec<ChildEntry> = {
        let mut children = inner.children.lock();
        children.drain().map(|(_, e)| e).collect()
    };
    for entry in entries {
        if let Err(err) = entry.handle.close().await {
            tracing::warn!(error = %err, "dynamic fan-out child close failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::tests::CapturingOutput;
    use super::*;
    use crate::output::spawn_output;
    use virta_core::MessageBatch;

    fn dynamic() -> (OutputHandle, DynamicOutputControl) {
        let inner = Arc::new(Inner::default());
        let control = DynamicOutputControl {
            inner: Arc::clone(&inner),
        };
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(run_dynamic_fan_out(rx, inner));
        (
            OutputHandle::from_task("dynamic".into(), tx, task),
            control,
        )
    }

    #[tokio::test]
    async fn delivers_to_all_current_children() {
        let (broker, control) = dynamic();

        let a = CapturingOutput::new();
        let b = CapturingOutput::new();
        let wrote_a = std::sync::Arc::clone(&a.written);
        let wrote_b = std::sync::Arc::clone(&b.written);

        control
            .set("a", spawn_output(Box::new(a), "a".into()), serde_json::json!({}))
            .await
            .unwrap();
        control
            .set("b", spawn_output(Box::new(b), "b".into()), serde_json::json!({}))
            .await
            .unwrap();

        let (txn, rx) = Transaction::new(MessageBatch::from_payloads(["m"]));
        broker.send(txn).await.unwrap();
        assert_eq!(rx.wait().await, Ok(()));

        assert_eq!(wrote_a.lock().as_slice(), &["m"]);
        assert_eq!(wrote_b.lock().as_slice(), &["m"]);

        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn replace_preserves_delivery() {
        let (broker, control) = dynamic();

        let first = CapturingOutput::new();
        let first_wrote = std::sync::Arc::clone(&first.written);
        control
            .set(
                "slot",
                spawn_output(Box::new(first), "first".into()),
                serde_json::json!({"gen": 1}),
            )
            .await
            .unwrap();

        // Produce continuously from another task while we swap the child.
        let sender = broker.sender();
        let producer = tokio::spawn(async move {
            for i in 0..50 {
                let (txn, rx) = Transaction::new(MessageBatch::from_payloads([format!("m{i}")]));
                if sender.send(txn).await.is_err() {
                    panic!("producer observed a closed broker during swap");
                }
                assert_eq!(rx.wait().await, Ok(()), "producer observed a nack");
            }
        });

        tokio::task::yield_now().await;

        let second = CapturingOutput::new();
        let second_wrote = std::sync::Arc::clone(&second.written);
        control
            .set(
                "slot",
                spawn_output(Box::new(second), "second".into()),
                serde_json::json!({"gen": 2}),
            )
            .await
            .unwrap();

        producer.await.unwrap();

        // Every message landed exactly once, split across generations.
        let total = first_wrote.lock().len() + second_wrote.lock().len();
        assert_eq!(total, 50);
        assert_eq!(control.config("slot").unwrap()["gen"], 2);

        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn empty_set_holds_rather_than_drops() {
        let (broker, control) = dynamic();

        let (txn, rx) = Transaction::new(MessageBatch::from_payloads(["held"]));
        broker.send(txn).await.unwrap();

        // No children yet: the ack must still be pending.
        tokio::task::yield_now().await;

        let late = CapturingOutput::new();
        let wrote = std::sync::Arc::clone(&late.written);
        control
            .set("late", spawn_output(Box::new(late), "late".into()), serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(rx.wait().await, Ok(()));
        assert_eq!(wrote.lock().as_slice(), &["held"]);

        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn remove_unknown_child_is_resource_missing() {
        let (broker, control) = dynamic();
        assert!(matches!(
            control.remove("ghost").await,
            Err(Error::ResourceMissing(_))
        ));
        broker.close().await.unwrap();
    }
}
