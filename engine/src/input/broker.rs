//! Fan-in broker: merge several inputs into one transaction stream
//!
//! Each child keeps its own internal ordering; no ordering is defined
//! across children. The merged stream closes only once every child has
//! closed. Acknowledgements pass through untouched: each transaction is
//! still acked by whichever downstream component consumes it, directly to
//! the producing child.

use super::{InputControl, InputHandle};
use crate::config::ComponentConfig;
use crate::manager::Manager;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use virta_core::{Error, Result, Transaction};

/// Config fields accepted by the `broker` input.
pub const CONFIG_FIELDS: &[&str] = &["inputs", "channel_capacity"];

/// Configuration for the fan-in broker.
#[derive(Debug, Clone, Deserialize)]
pub struct FanInConfig {
    /// Child input fragments.
    pub inputs: Vec<ComponentConfig>,
    /// Capacity of the merged channel.
    #[serde(default = "default_capacity")]
    pub channel_capacity: usize,
}

fn default_capacity() -> usize {
    1
}

/// Build a fan-in broker over the configured children.
pub fn build_fan_in(conf: &FanInConfig, mgr: &Manager) -> Result<InputHandle> {
    if conf.inputs.is_empty() {
        return Err(Error::Config("fan-in broker requires at least one input".into()));
    }

    let (merged_tx, merged_rx) = mpsc::channel(conf.channel_capacity.max(1));
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let mut controls: Vec<InputControl> = Vec::with_capacity(conf.inputs.len());
    let mut forwarders = Vec::with_capacity(conf.inputs.len());

    for (i, child_conf) in conf.inputs.iter().enumerate() {
        let child = mgr
            .into_path(&["broker", &i.to_string()])
            .new_input(child_conf)?;
        let (mut rx, control) = child.split();
        controls.push(control);

        let tx = merged_tx.clone();
        forwarders.push(tokio::spawn(async move {
            while let Some(txn) = rx.recv().await {
                if tx.send(txn).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(merged_tx);

    let task = tokio::spawn(async move {
        // A failed wait means every stop sender is gone, which only happens
        // at teardown; either way we proceed to stop the children.
        let _ = stop_rx.wait_for(|stopped| *stopped).await;
        for control in &controls {
            control.trigger_stop();
        }
        for control in controls {
            control.join().await;
        }
        for forwarder in forwarders {
            let _ = forwarder.await;
        }
    });

    Ok(InputHandle::from_parts(merged_rx, stop_tx, task))
}

/// Forward a child input into a shared channel until either side closes.
///
/// Shared with the dynamic fan-in, which spawns one of these per mutable
/// child.
pub(crate) fn spawn_forwarder(
    mut rx: mpsc::Receiver<Transaction>,
    tx: mpsc::Sender<Transaction>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(txn) = rx.recv().await {
            if tx.send(txn).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::manager::Manager;
    use std::collections::HashSet;

    fn generate_conf(name: &str, count: usize) -> ComponentConfig {
        ComponentConfig::new(
            "generate",
            serde_json::json!({
                "mapping": format!("root.src = \"{name}\"\nroot.n = count(\"fan-in-{name}\")"),
                "count": count,
            }),
        )
    }

    #[tokio::test]
    async fn merges_all_sources_and_closes_after_all() {
        let mgr = Manager::for_tests();
        let conf = FanInConfig {
            inputs: vec![generate_conf("a", 3), generate_conf("b", 2)],
            channel_capacity: 1,
        };

        let mut handle = build_fan_in(&conf, &mgr).unwrap();

        let mut seen: Vec<(String, u64)> = Vec::new();
        while let Some(txn) = handle.recv().await {
            for msg in txn.batch.iter() {
                let doc = msg.structured().unwrap();
                seen.push((
                    doc["src"].as_str().unwrap().to_string(),
                    doc["n"].as_u64().unwrap(),
                ));
            }
            txn.ack(Ok(()));
        }

        assert_eq!(seen.len(), 5);
        let sources: HashSet<_> = seen.iter().map(|(s, _)| s.clone()).collect();
        assert_eq!(sources.len(), 2);

        // Per-source internal order is preserved.
        for src in ["a", "b"] {
            let ns: Vec<u64> = seen
                .iter()
                .filter(|(s, _)| s == src)
                .map(|(_, n)| *n)
                .collect();
            let mut sorted = ns.clone();
            sorted.sort_unstable();
            assert_eq!(ns, sorted, "source {src} reordered");
        }
    }

    #[tokio::test]
    async fn stop_propagates_to_children() {
        let mgr = Manager::for_tests();
        let conf = FanInConfig {
            // Unbounded children; only stop ends them.
            inputs: vec![generate_conf("x", 0)],
            channel_capacity: 1,
        };

        let mut handle = build_fan_in(&conf, &mgr).unwrap();
        let txn = handle.recv().await.unwrap();
        txn.ack(Ok(()));

        handle.trigger_stop();
        while let Some(txn) = handle.recv().await {
            txn.ack(Ok(()));
        }
        // recv() returning None proves the merged channel closed cleanly.
    }

    #[test]
    fn empty_broker_is_config_error() {
        let conf = FanInConfig {
            inputs: vec![],
            channel_capacity: 1,
        };
        // No runtime needed: the config check fires before any spawn.
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mgr = Manager::for_tests();
            assert!(build_fan_in(&conf, &mgr).is_err());
        });
    }
}
