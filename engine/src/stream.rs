//! Stream lifecycle: assembly, run, and the two-deadline shutdown
//!
//! A stream is one end-to-end assembly. Construction is bottom-up so every
//! consumer is ready before its producer starts: output first, then buffer,
//! processors, input last.
//!
//! ```text
//! input ──► pipeline ──► [buffer] ──► output
//! ```
//!
//! Shutdown is the inverse and the most delicate operation in the runtime:
//!
//! 1. The input is told to stop producing but finishes in-flight work.
//! 2. Its channel closing propagates through pipeline and buffer.
//! 3. Each component flushes internal state as one last transaction wave.
//! 4. The output drains and closes.
//!
//! Two deadlines apply: a grace delay before shutdown begins (for external
//! consumers pointed at this stream to drain) and a hard ceiling on the
//! whole procedure. On expiry the runtime dumps the unfinished tasks to
//! stderr and reports a timeout.

use crate::config::StreamConfig;
use crate::manager::Manager;
use crate::output::OutputHandle;
use crate::pipeline::Pipeline;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use virta_core::{Error, Result, Transaction};

/// A running stream.
pub struct Stream {
    stop: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
    output: Option<OutputHandle>,
}

impl Stream {
    /// Assemble and start a stream.
    ///
    /// Components start bottom-up: by the time the input produces its
    /// first transaction the whole chain below is accepting.
    pub fn new(conf: &StreamConfig, mgr: &Manager) -> Result<Stream> {
        let output = mgr.into_path(&["output"]).new_output(&conf.output)?;

        let buffer = conf
            .buffer
            .as_ref()
            .map(|b| mgr.into_path(&["buffer"]).new_buffer(b))
            .transpose()?;

        let pipeline = Pipeline::new(&conf.pipeline, &mgr.into_path(&["pipeline"]))?;

        let input = mgr.into_path(&["input"]).new_input(&conf.input)?;

        // Wiring, upstream to downstream.
        let (input_rx, input_control) = input.split();
        let (stop, input_task) = input_control.into_parts();

        let mut tasks = vec![("input".to_string(), input_task)];

        let (pipeline_rx, pipeline_tasks) = pipeline.spawn(input_rx);
        for (i, task) in pipeline_tasks.into_iter().enumerate() {
            tasks.push((format!("pipeline.{i}"), task));
        }

        let final_rx = match buffer {
            Some(buffer) => {
                let handle = buffer.spawn(pipeline_rx);
                for (i, task) in handle.tasks.into_iter().enumerate() {
                    tasks.push((format!("buffer.{i}"), task));
                }
                handle.rx
            }
            None => pipeline_rx,
        };

        let pump = tokio::spawn(pump(final_rx, output.sender()));
        tasks.push(("output.pump".to_string(), pump));

        if let Some(metrics) = crate::metrics::Metrics::get() {
            metrics.active_streams.inc();
        }
        tracing::info!(input = %conf.input.type_name, output = %conf.output.type_name, "stream started");

        Ok(Stream {
            stop,
            tasks,
            output: Some(output),
        })
    }

    /// Tell the input to stop producing new transactions.
    pub fn trigger_stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Wait for the stream to finish naturally (finite inputs), then
    /// release everything.
    pub async fn run_to_completion(mut self) -> Result<()> {
        for (_, task) in &mut self.tasks {
            let _ = task.await;
        }
        let res = match self.output.take() {
            Some(output) => output.close().await,
            None => Ok(()),
        };
        finish_stream_metrics();
        res
    }

    /// Stop the stream: grace delay, stop signal, bounded drain.
    ///
    /// Returns [`Error::Timeout`] if the whole procedure exceeds
    /// `close_timeout`; the unfinished components are dumped to stderr
    /// first.
    pub async fn stop(mut self, close_delay: Duration, close_timeout: Duration) -> Result<()> {
        if !close_delay.is_zero() {
            tracing::info!(
                delay_ms = close_delay.as_millis() as u64,
                "delaying shutdown for external consumers"
            );
            tokio::time::sleep(close_delay).await;
        }

        tracing::info!("stream shutting down");
        let _ = self.stop.send(true);

        let drained = tokio::time::timeout(close_timeout, async {
            for (name, task) in &mut self.tasks {
                if task.await.is_err() {
                    tracing::warn!(component = %name, "component task panicked during drain");
                }
            }
            match self.output.take() {
                Some(output) => output.close().await,
                None => Ok(()),
            }
        })
        .await;

        match drained {
            Ok(res) => {
                finish_stream_metrics();
                tracing::info!("stream shutdown complete");
                res
            }
            Err(_) => {
                self.dump_tasks();
                for (_, task) in &self.tasks {
                    task.abort();
                }
                if let Some(output) = self.output.take() {
                    let _ = output.close_within(Duration::from_millis(100)).await;
                }
                finish_stream_metrics();
                Err(Error::Timeout)
            }
        }
    }

    /// Write the state of every component task to stderr, for diagnosing a
    /// shutdown that failed to drain in time.
    fn dump_tasks(&self) {
        eprintln!("=== virta task dump: shutdown deadline expired ===");
        for (name, task) in &self.tasks {
            let state = if task.is_finished() {
                "finished"
            } else {
                "RUNNING"
            };
            eprintln!("  {name}: {state}");
        }
        if self.output.is_some() {
            eprintln!("  output: RUNNING");
        }
        eprintln!("==================================================");
        tracing::error!("shutdown deadline expired, task dump written to stderr");
    }
}

fn finish_stream_metrics() {
    if let Some(metrics) = crate::metrics::Metrics::get() {
        metrics.active_streams.dec();
    }
}

async fn pump(mut rx: mpsc::Receiver<Transaction>, tx: mpsc::Sender<Transaction>) {
    while let Some(txn) = rx.recv().await {
        if tx.send(txn).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::ComponentConfig;

    fn stream_conf(input: serde_json::Value, output: serde_json::Value) -> StreamConfig {
        serde_json::from_value(serde_json::json!({
            "input": input,
            "output": output,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn finite_stream_runs_to_completion() {
        let mgr = Manager::for_tests();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        let conf = stream_conf(
            serde_json::json!({"generate": {"mapping": "root.id = \"foobar\"", "count": 4}}),
            serde_json::json!({"file": {"path": path.to_string_lossy(), "codec": "lines"}}),
        );

        let stream = Stream::new(&conf, &mgr).unwrap();
        stream.run_to_completion().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| *l == r#"{"id":"foobar"}"#));
    }

    #[tokio::test]
    async fn stream_with_pipeline_and_buffer() {
        let mgr = Manager::for_tests();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        let conf: StreamConfig = serde_json::from_value(serde_json::json!({
            "input": {"generate": {"mapping": "root.n = count(\"stream-buffer-test\")", "count": 3}},
            "pipeline": {"processors": [{"mapping": "root.tagged = json(\"n\")"}]},
            "buffer": {"memory": {"limit": 1024}},
            "output": {"file": {"path": path.to_string_lossy(), "codec": "lines"}},
        }))
        .unwrap();

        let stream = Stream::new(&conf, &mgr).unwrap();
        stream.run_to_completion().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.contains(r#"{"tagged":1}"#));
    }

    #[tokio::test]
    async fn stop_drains_in_flight_work() {
        let mgr = Manager::for_tests();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        // Unbounded input; only stop ends it.
        let conf = stream_conf(
            serde_json::json!({"generate": {"mapping": "root.id = \"x\"", "count": 0}}),
            serde_json::json!({"file": {"path": path.to_string_lossy(), "codec": "lines"}}),
        );

        let stream = Stream::new(&conf, &mgr).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        stream
            .stop(Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.is_empty(), "some messages flowed before stop");
    }

    #[tokio::test]
    async fn stop_with_stuck_output_times_out() {
        use crate::output::Output;
        use async_trait::async_trait;
        use virta_core::MessageBatch;

        struct BlockOnClose;

        #[async_trait]
        impl Output for BlockOnClose {
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

        let mgr = Manager::for_tests();
        mgr.environment()
            .register_output(
                "block_on_close",
                &[],
                Box::new(|_conf, mgr| {
                    Ok(crate::output::spawn_output(
                        Box::new(BlockOnClose),
                        mgr.path_string(),
                    ))
                }),
            )
            .unwrap();

        let conf = stream_conf(
            serde_json::json!({"generate": {"mapping": "root.id = \"x\"", "count": 0}}),
            serde_json::json!({"type": "block_on_close"}),
        );

        let stream = Stream::new(&conf, &mgr).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let res = stream
            .stop(Duration::ZERO, Duration::from_millis(500))
            .await;

        assert_eq!(res, Err(Error::Timeout));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "stop must return promptly after the deadline"
        );
    }
}
