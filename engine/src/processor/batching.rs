//! Batch policy: windowing messages into larger batches
//!
//! A policy emits a batch on the first satisfied condition out of message
//! count, byte size, elapsed period, or an end-of-batch expression evaluated
//! against each arriving message. All counters reset at emit.
//!
//! The policy itself is a passive accumulator shared by the `batch`
//! processor, outputs that batch writes, and the sharded-log input's
//! per-shard batcher. Timed emission is driven by the host: it asks
//! [`BatchPolicy::until_next`] for the pending deadline and calls
//! [`BatchPolicy::flush`] when it expires.

use super::Processor;
use crate::config::deserialize_opt_duration;
use crate::interp::Expr;
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use virta_core::{Error, Message, MessageBatch, Result};

/// Config fields accepted by batch policies.
pub const CONFIG_FIELDS: &[&str] = &["count", "byte_size", "period", "check"];

/// Declarative batch policy.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BatchPolicyConfig {
    /// Emit after this many messages. Zero disables.
    #[serde(default)]
    pub count: usize,
    /// Emit once buffered payloads reach this many bytes. Zero disables.
    #[serde(default)]
    pub byte_size: usize,
    /// Emit this long after the first buffered message.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub period: Option<Duration>,
    /// Emit when this expression evaluates truthy against an arriving
    /// message.
    #[serde(default)]
    pub check: Option<String>,
}

impl BatchPolicyConfig {
    /// A policy with no active conditions batches nothing.
    pub fn is_noop(&self) -> bool {
        self.count == 0
            && self.byte_size == 0
            && self.period.is_none()
            && self.check.is_none()
    }
}

/// Accumulates messages until a policy condition fires.
pub struct BatchPolicy {
    count: usize,
    byte_size: usize,
    period: Option<Duration>,
    check: Option<Expr>,

    buf: Vec<Message>,
    buf_bytes: usize,
    oldest: Option<Instant>,
}

impl BatchPolicy {
    /// Build a policy, parsing the check expression if present.
    pub fn new(conf: BatchPolicyConfig) -> Result<Self> {
        let check = conf.check.as_deref().map(Expr::parse).transpose()?;
        Ok(Self {
            count: conf.count,
            byte_size: conf.byte_size,
            period: conf.period,
            check,
            buf: Vec::new(),
            buf_bytes: 0,
            oldest: None,
        })
    }

    /// Add a message; returns true when a batch is ready to flush.
    pub fn add(&mut self, msg: Message) -> bool {
        self.buf_bytes += msg.payload_len();
        if self.oldest.is_none() {
            self.oldest = Some(Instant::now());
        }

        let check_fired = match &self.check {
            Some(expr) => match expr.eval(&msg) {
                Ok(v) => is_truthy(&v),
                Err(err) => {
                    tracing::debug!(error = %err, "batch check failed, not emitting");
                    false
                }
            },
            None => false,
        };

        self.buf.push(msg);

        (self.count > 0 && self.buf.len() >= self.count)
            || (self.byte_size > 0 && self.buf_bytes >= self.byte_size)
            || check_fired
            || self
                .period
                .zip(self.oldest)
                .is_some_and(|(p, t)| t.elapsed() >= p)
    }

    /// Take the pending batch, resetting all counters.
    pub fn flush(&mut self) -> Option<MessageBatch> {
        if self.buf.is_empty() {
            return None;
        }
        self.buf_bytes = 0;
        self.oldest = None;
        Some(std::mem::take(&mut self.buf).into())
    }

    /// Time remaining until the period condition fires, when messages are
    /// pending and a period is configured.
    pub fn until_next(&self) -> Option<Duration> {
        let period = self.period?;
        let oldest = self.oldest?;
        Some(period.saturating_sub(oldest.elapsed()))
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => s == "true",
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

/// Processor wrapping a [`BatchPolicy`].
///
/// Incoming transactions whose messages are absorbed without emitting are
/// acknowledged immediately; the end-to-end ack chain therefore ends at
/// this processor for buffered messages. Batch at the input level when the
/// window must stay inside the delivery guarantee.
pub struct BatchProcessor {
    policy: Mutex<BatchPolicy>,
}

impl BatchProcessor {
    /// Build from config. An all-disabled policy is a config error.
    pub fn new(conf: BatchPolicyConfig) -> Result<Self> {
        if conf.is_noop() {
            return Err(Error::Config(
                "batch policy requires at least one of count, byte_size, period, check".into(),
            ));
        }
        Ok(Self {
            policy: Mutex::new(BatchPolicy::new(conf)?),
        })
    }
}

#[async_trait::async_trait]
impl Processor for BatchProcessor {
    fn name(&self) -> &str {
        "batch"
    }

    async fn process(&self, batch: MessageBatch) -> Result<Vec<MessageBatch>> {
        let mut out = Vec::new();
        let mut policy = self.policy.lock();
        for msg in batch {
            if policy.add(msg) {
                out.extend(policy.flush());
            }
        }
        Ok(out)
    }

    async fn flush(&self) -> Result<Vec<MessageBatch>> {
        Ok(self.policy.lock().flush().into_iter().collect())
    }

    fn until_flush(&self) -> Option<Duration> {
        self.policy.lock().until_next()
    }
}
