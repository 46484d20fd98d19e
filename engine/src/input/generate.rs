//! Generate input: synthetic messages from a mapping
//!
//! Produces messages on an interval by evaluating a mapping against an
//! empty message. Useful for load generation, scheduled triggers and tests.

use super::{Input, ReadBatch};
use crate::config::deserialize_opt_duration;
use crate::interp::Mapping;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use virta_core::{Error, Message, MessageBatch, Result};

/// Config fields accepted by the `generate` input.
pub const CONFIG_FIELDS: &[&str] = &["mapping", "interval", "count", "batch_size"];

/// Configuration for [`GenerateInput`].
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateConfig {
    /// Mapping evaluated per generated message, e.g. `root.id = "foobar"`.
    pub mapping: String,
    /// Delay between batches. Absent or zero emits as fast as downstream
    /// accepts.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub interval: Option<Duration>,
    /// Stop after this many messages. Zero means unbounded.
    #[serde(default)]
    pub count: usize,
    /// Messages per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    1
}

/// Synthetic input driver.
pub struct GenerateInput {
    mapping: Mapping,
    interval: Option<Duration>,
    count: usize,
    batch_size: usize,
    produced: usize,
    next_at: Option<Instant>,
}

impl GenerateInput {
    /// Build from config. The mapping is parsed (and linted) here.
    pub fn new(conf: GenerateConfig) -> Result<Self> {
        if conf.batch_size == 0 {
            return Err(Error::Config("generate batch_size must be above zero".into()));
        }
        Ok(Self {
            mapping: Mapping::parse(&conf.mapping)?,
            interval: conf.interval.filter(|d| !d.is_zero()),
            count: conf.count,
            batch_size: conf.batch_size,
            produced: 0,
            next_at: None,
        })
    }
}

#[async_trait]
impl Input for GenerateInput {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_batch(&mut self) -> Result<ReadBatch> {
        if self.count > 0 && self.produced >= self.count {
            return Err(Error::Shutdown);
        }

        if let Some(at) = self.next_at {
            tokio::time::sleep_until(at).await;
        }
        if let Some(interval) = self.interval {
            self.next_at = Some(Instant::now() + interval);
        }

        let mut batch = MessageBatch::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            if self.count > 0 && self.produced >= self.count {
                break;
            }
            let mut msg = Message::default();
            self.mapping.apply(&mut msg)?;
            batch.push(msg);
            self.produced += 1;
        }

        Ok(ReadBatch::unacked(batch))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
