//! Per-shard record batcher
//!
//! Groups a shard's records by the configured batch policy, enforces the
//! checkpoint limit by stalling record pulls while too many records are in
//! flight, and attaches an acknowledgement to every flushed batch that
//! advances the committed sequence only when the ack fires.
//!
//! The committed sequence is an in-order watermark: a sequence commits only
//! once every record at or below it has been acknowledged, preserving
//! at-least-once across out-of-order acks.

use super::store::Record;
use crate::input::AckFn;
use crate::processor::{BatchPolicy, BatchPolicyConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use virta_core::{Message, MessageBatch, Result};

/// Metadata key carrying the source stream name.
pub const META_STREAM: &str = "log_stream";
/// Metadata key carrying the shard id.
pub const META_SHARD: &str = "log_shard";
/// Metadata key carrying the record sequence.
pub const META_SEQUENCE: &str = "log_sequence";

/// In-order acknowledgement watermark over record sequences.
#[derive(Default)]
struct SequenceWatermark {
    /// In-flight sequences in arrival order, with their ack state.
    pending: VecDeque<(u64, bool)>,
    /// Highest sequence with every predecessor acknowledged.
    committed: Option<u64>,
}

impl SequenceWatermark {
    fn track(&mut self, seq: u64) {
        self.pending.push_back((seq, false));
    }

    fn ack(&mut self, seq: u64) {
        for entry in self.pending.iter_mut() {
            if entry.0 == seq {
                entry.1 = true;
                break;
            }
        }
        while let Some((seq, true)) = self.pending.front().copied() {
            self.pending.pop_front();
            self.committed = Some(seq);
        }
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

/// Batches one shard's records and tracks their acknowledgements.
pub struct ShardBatcher {
    stream: String,
    shard: String,
    policy: BatchPolicy,
    batch_sequences: Vec<u64>,
    watermark: Arc<Mutex<SequenceWatermark>>,
    checkpoint_limit: usize,
}

impl ShardBatcher {
    /// Build a batcher for one shard. A no-op policy degrades to
    /// batch-per-record.
    pub fn new(
        stream: impl Into<String>,
        shard: impl Into<String>,
        mut policy_conf: BatchPolicyConfig,
        checkpoint_limit: usize,
    ) -> Result<Self> {
        if policy_conf.is_noop() {
            policy_conf.count = 1;
        }
        Ok(Self {
            stream: stream.into(),
            shard: shard.into(),
            policy: BatchPolicy::new(policy_conf)?,
            batch_sequences: Vec::new(),
            watermark: Arc::new(Mutex::new(SequenceWatermark::default())),
            checkpoint_limit: checkpoint_limit.max(1),
        })
    }

    /// Whether record pulls must stall: in-flight records (plus the ones
    /// buffered for the next batch) have reached the checkpoint limit.
    pub fn stalled(&self) -> bool {
        self.watermark.lock().in_flight() + self.policy.len() >= self.checkpoint_limit
    }

    /// Add a record to the pending batch; returns true when the batch is
    /// ready to flush.
    pub fn add_record(&mut self, record: Record) -> bool {
        let msg = Message::new(record.payload)
            .with_metadata(META_STREAM, self.stream.clone())
            .with_metadata(META_SHARD, self.shard.clone())
            .with_metadata(META_SEQUENCE, record.sequence.to_string());
        self.batch_sequences.push(record.sequence);
        self.policy.add(msg)
    }

    /// Whether a batch is buffered and waiting to flush.
    pub fn has_pending(&self) -> bool {
        !self.policy.is_empty()
    }

    /// Time until the batch policy's period fires, if records are pending.
    pub fn until_next(&self) -> Option<Duration> {
        self.policy.until_next()
    }

    /// Flush the pending batch with its acknowledgement hook.
    ///
    /// The hook advances the committed watermark only on a successful
    /// acknowledgement; failures leave the sequences in flight so the
    /// checkpoint never claims undelivered records.
    pub fn flush_message(&mut self) -> Option<(MessageBatch, AckFn)> {
        let batch = self.policy.flush()?;
        let sequences = std::mem::take(&mut self.batch_sequences);

        let watermark = Arc::clone(&self.watermark);
        {
            let mut wm = watermark.lock();
            for seq in &sequences {
                wm.track(*seq);
            }
        }

        let ack: AckFn = Box::new(move |res| {
            if res.is_ok() {
                let mut wm = watermark.lock();
                for seq in &sequences {
                    wm.ack(*seq);
                }
            }
        });

        Some((batch, ack))
    }

    /// Highest sequence safe to commit.
    pub fn committed_sequence(&self) -> Option<u64> {
        self.watermark.lock().committed
    }

    /// Records dispatched but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.watermark.lock().in_flight()
    }
}
