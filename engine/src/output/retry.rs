//! Retry wrapper: resubmit failed transactions with exponential backoff
//!
//! Intercepts downstream errors, backs off with jitter, and resubmits the
//! same batch. The retry loop checks the close interrupt on every
//! iteration: a cancelled component fails the in-flight transaction with a
//! timeout, distinguishable from the last downstream error.

use super::OutputHandle;
use crate::config::{ComponentConfig, deserialize_duration};
use crate::manager::Manager;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use virta_core::{Error, Result, Transaction};

/// Config fields accepted by the `retry` output.
pub const CONFIG_FIELDS: &[&str] = &["output", "max_retries", "backoff"];

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(
        default = "default_initial_interval",
        deserialize_with = "deserialize_duration",
        rename = "initial_interval"
    )]
    pub initial_delay: Duration,
    /// Ceiling on the delay between retries.
    #[serde(
        default = "default_max_interval",
        deserialize_with = "deserialize_duration",
        rename = "max_interval"
    )]
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0), randomising each delay by +/- this share.
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,
}

fn default_initial_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_interval(),
            max_delay: default_max_interval(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter(),
        }
    }
}

impl BackoffConfig {
    /// Delay for attempt n (1-indexed retries; attempt 0 is the initial
    /// try and has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for_attempt_with_jitter(attempt, rand::rng().random::<f64>())
    }

    /// Delay with an explicit jitter sample in `[0.0, 1.0)`, for tests.
    pub fn delay_for_attempt_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_us =
            self.initial_delay.as_micros() as f64 * self.multiplier.powi((attempt - 1) as i32);
        let base_us = base_us.min(self.max_delay.as_micros() as f64);

        // Map jitter from [0, 1) to [-1, 1) and scale by the factor.
        let jitter_range = base_us * self.jitter_factor;
        let jitter_offset = (jitter * 2.0 - 1.0) * jitter_range;
        let final_us = (base_us + jitter_offset).max(1.0);

        Duration::from_micros(final_us as u64)
    }
}

/// Configuration for the retry wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// The wrapped output fragment.
    pub output: ComponentConfig,
    /// Retries before the last error is surfaced. Zero retries forever.
    #[serde(default)]
    pub max_retries: u32,
    /// Backoff policy.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Build a retry wrapper around the configured child.
pub fn build_retry(conf: &RetryConfig, mgr: &Manager) -> Result<OutputHandle> {
    let child = mgr.into_path(&["retry"]).new_output(&conf.output)?;
    let (tx, rx) = mpsc::channel(1);
    let (interrupt_tx, interrupt_rx) = watch::channel(false);

    let task = tokio::spawn(run_retry(
        rx,
        child,
        conf.backoff.clone(),
        conf.max_retries,
        interrupt_rx,
    ));

    Ok(OutputHandle::from_task("retry".into(), tx, task).with_interrupt(interrupt_tx))
}

async fn run_retry(
    mut rx: mpsc::Receiver<Transaction>,
    child: OutputHandle,
    backoff: BackoffConfig,
    max_retries: u32,
    mut interrupt: watch::Receiver<bool>,
) {
    while let Some(txn) = rx.recv().await {
        let (batch, ack) = txn.into_parts();
        let mut attempt: u32 = 0;

        let outcome = loop {
            if *interrupt.borrow() {
                break Err(Error::Timeout);
            }

            let (child_txn, child_rx) = Transaction::new(batch.clone());
            if child.send(child_txn).await.is_err() {
                break Err(Error::Shutdown);
            }

            let res = tokio::select! {
                res = child_rx.wait() => res,
                _ = interrupt.changed() => break Err(Error::Timeout),
            };

            match res {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::info!(attempt, "delivery recovered after retry");
                    }
                    break Ok(());
                }
                Err(err) if err.is_shutdown() => break Err(err),
                Err(err) => {
                    attempt += 1;
                    if max_retries > 0 && attempt > max_retries {
                        break Err(err);
                    }
                    let delay = backoff.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "delivery failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = interrupt.changed() => break Err(Error::Timeout),
                    }
                }
            }
        };

        ack.resolve(outcome);
    }

    if let Err(err) = child.close().await {
        tracing::warn!(error = %err, "retry child close failed");
    }
}
