//! Dynamic fan-in: a merge broker whose child set mutates at runtime
//!
//! Children are identified by label and can be created, replaced and
//! removed while the stream runs, via [`DynamicInputControl`] (wired to the
//! admin API). Replacing an id drains the old child to completion before
//! the new one is installed; the merged stream never observes the swap.

use super::broker::spawn_forwarder;
use super::{InputControl, InputHandle};
use crate::config::ComponentConfig;
use crate::manager::Manager;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use virta_core::{Error, Result, Transaction};

/// Config fields accepted by the `dynamic` input.
pub const CONFIG_FIELDS: &[&str] = &["inputs", "channel_capacity"];

/// Configuration for the dynamic fan-in.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DynamicFanInConfig {
    /// Children to create statically at start.
    #[serde(default)]
    pub inputs: HashMap<String, ComponentConfig>,
    /// Capacity of the merged channel.
    #[serde(default = "default_capacity")]
    pub channel_capacity: usize,
}

fn default_capacity() -> usize {
    1
}

struct ChildEntry {
    control: InputControl,
    forwarder: tokio::task::JoinHandle<()>,
    config: serde_json::Value,
    added: Instant,
}

struct Inner {
    children: Mutex<HashMap<String, ChildEntry>>,
    /// Master clone of the merged sender; dropped on stop so the merged
    /// channel closes once all forwarders finish.
    merged_tx: Mutex<Option<mpsc::Sender<Transaction>>>,
}

async fn stop_and_join(entry: ChildEntry) {
    entry.control.trigger_stop();
    let _ = entry.forwarder.await;
    entry.control.join().await;
}

/// Runtime mutation handle for a dynamic fan-in.
#[derive(Clone)]
pub struct DynamicInputControl {
    inner: Arc<Inner>,
}

impl DynamicInputControl {
    /// Install (or replace) the child under `id`.
    ///
    /// A replaced child is drained to completion first: its in-flight
    /// transactions keep flowing and their acknowledgements are honoured
    /// before the new child starts. Upstream consumers of the merged
    /// stream observe nothing.
    pub async fn set(
        &self,
        id: &str,
        input: InputHandle,
        config: serde_json::Value,
    ) -> Result<()> {
        let old = self.inner.children.lock().remove(id);
        if let Some(old) = old {
            tracing::info!(id = %id, "draining replaced dynamic input");
            stop_and_join(old).await;
        }
        self.insert(id, input, config)
    }

    /// Install a child without draining semantics; used for the static
    /// start-up set where no previous child can exist.
    pub(crate) fn insert(
        &self,
        id: &str,
        input: InputHandle,
        config: serde_json::Value,
    ) -> Result<()> {
        let tx = self
            .inner
            .merged_tx
            .lock()
            .clone()
            .ok_or(Error::Shutdown)?;
        let (rx, control) = input.split();
        let forwarder = spawn_forwarder(rx, tx);
        self.inner.children.lock().insert(
            id.to_string(),
            ChildEntry {
                control,
                forwarder,
                config,
                added: Instant::now(),
            },
        );
        tracing::info!(id = %id, "dynamic input started");
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
        stop_and_join(entry).await;
        tracing::info!(id = %id, "dynamic input stopped");
        Ok(())
    }

    /// Current child ids and their uptimes.
    pub fn list(&self) -> Vec<(String, std::time::Duration)> {
        self.inner
            .children
            .lock()
            .iter()
            .map(|(id, e)| (id.clone(), e.added.elapsed()))
            .collect()
    }

    /// Uptime of one child.
    pub fn uptime(&self, id: &str) -> Option<std::time::Duration> {
        self.inner.children.lock().get(id).map(|e| e.added.elapsed())
    }

    /// Stored config of one child.
    pub fn config(&self, id: &str) -> Option<serde_json::Value> {
        self.inner.children.lock().get(id).map(|e| e.config.clone())
    }
}

/// Build a dynamic fan-in, returning the merged input handle and the
/// mutation control.
pub fn build_dynamic_fan_in(
    conf: &DynamicFanInConfig,
    mgr: &Manager,
) -> Result<(InputHandle, DynamicInputControl)> {
    let (merged_tx, merged_rx) = mpsc::channel(conf.channel_capacity.max(1));
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let inner = Arc::new(Inner {
        children: Mutex::new(HashMap::new()),
        merged_tx: Mutex::new(Some(merged_tx)),
    });
    let control = DynamicInputControl {
        inner: Arc::clone(&inner),
    };

    for (id, child_conf) in &conf.inputs {
        let child = mgr.into_path(&["dynamic", id]).new_input(child_conf)?;
        control.insert(id, child, child_conf.to_value())?;
    }

    let task = {
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let _ = stop_rx.wait_for(|stopped| *stopped).await;

            // No new children may be installed past this point.
            inner.merged_tx.lock().take();

            let entries: Vec<ChildEntry> = {
                let mut children = inner.children.lock();
                children.drain().map(|(_, e)| e).collect()
            };
            for entry in entries {
                stop_and_join(entry).await;
            }
        })
    };

    Ok((
        InputHandle::from_parts(merged_rx, stop_tx, task),
        control,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::manager::Manager;

    fn generate_conf(tag: &str, count: usize) -> ComponentConfig {
        ComponentConfig::new(
            "generate",
            serde_json::json!({
                "mapping": format!("root.src = \"{tag}\""),
                "count": count,
            }),
        )
    }

    #[tokio::test]
    async fn static_children_merge() {
        let mgr = Manager::for_tests();
        let conf = DynamicFanInConfig {
            inputs: [("a".to_string(), generate_conf("a", 2))].into(),
            channel_capacity: 1,
        };
        let (mut handle, control) = build_dynamic_fan_in(&conf, &mgr).unwrap();
        assert_eq!(control.list().len(), 1);

        for _ in 0..2 {
            let txn = handle.recv().await.unwrap();
            txn.ack(Ok(()));
        }

        handle.trigger_stop();
        while let Some(txn) = handle.recv().await {
            txn.ack(Ok(()));
        }
    }

    #[tokio::test]
    async fn set_adds_child_at_runtime() {
        let mgr = Manager::for_tests();
        let (mut handle, control) =
            build_dynamic_fan_in(&DynamicFanInConfig::default(), &mgr).unwrap();
        assert!(control.list().is_empty());

        let child = mgr.new_input(&generate_conf("late", 1)).unwrap();
        control
            .set("late", child, serde_json::json!({"type": "generate"}))
            .await
            .unwrap();

        let txn = handle.recv().await.unwrap();
        assert_eq!(
            txn.batch.get(0).unwrap().structured().unwrap()["src"],
            "late"
        );
        txn.ack(Ok(()));

        assert!(control.uptime("late").is_some());
        assert!(control.config("late").is_some());

        handle.trigger_stop();
        while let Some(txn) = handle.recv().await {
            txn.ack(Ok(()));
        }
    }

    #[tokio::test]
    async fn remove_drains_child() {
        let mgr = Manager::for_tests();
        let (mut handle, control) =
            build_dynamic_fan_in(&DynamicFanInConfig::default(), &mgr).unwrap();

        let child = mgr.new_input(&generate_conf("x", 0)).unwrap();
        control
            .set("x", child, serde_json::json!({}))
            .await
            .unwrap();

        // Consume one transaction so the child is mid-flight, then remove
        // concurrently while we keep consuming.
        let txn = handle.recv().await.unwrap();
        txn.ack(Ok(()));

        let remover = {
            let control = control.clone();
            tokio::spawn(async move { control.remove("x").await })
        };

        // Keep draining so the child's in-flight sends complete.
        while !remover.is_finished() {
            tokio::select! {
                maybe = handle.recv() => {
                    if let Some(txn) = maybe {
                        txn.ack(Ok(()));
                    }
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(1)) => {}
            }
        }
        remover.await.unwrap().unwrap();

        assert!(control.list().is_empty());
        assert!(matches!(
            control.remove("x").await,
            Err(Error::ResourceMissing(_))
        ));

        handle.trigger_stop();
        while let Some(txn) = handle.recv().await {
            txn.ack(Ok(()));
        }
    }
}
