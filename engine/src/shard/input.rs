//! The sharded-log input: discovery, claiming, consuming, rebalancing
//!
//! Streams are either *balanced* (shards distributed across instances by
//! coordinating through the lease store) or *pinned* (`stream:shard`
//! entries consumed exactly as listed). Mixing both in one input is a
//! config error.
//!
//! Each owned shard runs its own consumer task, a state machine:
//!
//! | state     | entered                         | exited by                    |
//! |-----------|---------------------------------|------------------------------|
//! | Consuming | after a successful claim        | shard end / lost claim / stop|
//! | Yielding  | commit observed another owner   | final checkpoint, task exits |
//! | Finished  | closed shard fully consumed     | checkpoint row deleted       |
//! | Closing   | the input is shutting down      | final checkpoint, task exits |
//!
//! The rebalance loop first grabs unclaimed or stale shards; only when
//! none remain does it consider stealing from a client holding at least
//! `steal_surplus` more shards than this one (the surplus prevents two
//! clients playing hot potato with an odd shard).

use super::batcher::ShardBatcher;
use super::checkpointer::Checkpointer;
use super::store::{
    IteratorPosition, LeaseError, LeaseStore, LogStore, LogStoreError, Record,
};
use crate::config::deserialize_duration;
use crate::input::{AckFn, AutoRetryConfig, AutoRetryInput, Input, InputHandle, ReadBatch,
    spawn_input};
use crate::processor::BatchPolicyConfig;
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use virta_core::{Error, MessageBatch, Result};

/// Configuration for [`ShardedLogInput`].
#[derive(Debug, Clone, Deserialize)]
pub struct ShardedLogConfig {
    /// Streams to consume: `name` for balanced consumption, `name:shard`
    /// to pin a single shard. Comma-separated entries are split.
    pub streams: Vec<String>,
    /// Ceiling on in-flight records per shard before pulls stall.
    #[serde(default = "default_checkpoint_limit")]
    pub checkpoint_limit: usize,
    /// Period between checkpoint commits.
    #[serde(
        default = "default_commit_period",
        deserialize_with = "deserialize_duration"
    )]
    pub commit_period: Duration,
    /// A client that has not refreshed within this period is assumed dead.
    #[serde(
        default = "default_lease_period",
        deserialize_with = "deserialize_duration"
    )]
    pub lease_period: Duration,
    /// Period between shard rebalance attempts.
    #[serde(
        default = "default_rebalance_period",
        deserialize_with = "deserialize_duration"
    )]
    pub rebalance_period: Duration,
    /// Start new shards from the oldest record rather than the latest.
    #[serde(default = "default_true")]
    pub start_from_oldest: bool,
    /// Steal only from clients holding at least this many more shards
    /// than us.
    #[serde(default = "default_steal_surplus")]
    pub steal_surplus: usize,
    /// Records per read call.
    #[serde(default = "default_read_limit")]
    pub read_limit: usize,
    /// Per-shard batch policy. Shards batch separately so that
    /// acknowledgements are never contaminated across shards.
    #[serde(default)]
    pub batching: BatchPolicyConfig,
}

fn default_checkpoint_limit() -> usize {
    1024
}
fn default_commit_period() -> Duration {
    Duration::from_secs(5)
}
fn default_lease_period() -> Duration {
    Duration::from_secs(30)
}
fn default_rebalance_period() -> Duration {
    Duration::from_secs(30)
}
fn default_true() -> bool {
    true
}
fn default_steal_surplus() -> usize {
    2
}
fn default_read_limit() -> usize {
    10_000
}

const INITIAL_POLL_BACKOFF: Duration = Duration::from_millis(300);
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(5);
/// How long to wait when parked on in-flight acknowledgements.
const ACK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardState {
    Consuming,
    Yielding,
    Finished,
    Closing,
}

struct Shared {
    log: Arc<dyn LogStore>,
    checkpointer: Checkpointer,
    conf: ShardedLogConfig,
    msg_tx: mpsc::Sender<(MessageBatch, AckFn)>,
}

/// Shard-balanced log input with external checkpointing.
pub struct ShardedLogInput {
    conf: ShardedLogConfig,
    balanced: Vec<String>,
    pinned: HashMap<String, Vec<String>>,
    log: Arc<dyn LogStore>,
    checkpointer: Checkpointer,
    msg_rx: Option<mpsc::Receiver<(MessageBatch, AckFn)>>,
    shutdown: Option<watch::Sender<bool>>,
    runner: Option<JoinHandle<()>>,
}

impl ShardedLogInput {
    /// Build the consumer over the two external collaborators.
    ///
    /// Stream entries are validated here: balanced and pinned entries
    /// cannot be mixed, and a pinned entry carries exactly one `:`.
    pub fn new(
        conf: ShardedLogConfig,
        log: Arc<dyn LogStore>,
        leases: Arc<dyn LeaseStore>,
    ) -> Result<Self> {
        let mut balanced = Vec::new();
        let mut pinned: HashMap<String, Vec<String>> = HashMap::new();

        for entry in &conf.streams {
            for part in entry.split(',') {
                let trimmed = part.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let pieces: Vec<&str> = trimmed.split(':').collect();
                match pieces.as_slice() {
                    [stream] => {
                        if !pinned.is_empty() {
                            return Err(mix_error());
                        }
                        balanced.push(stream.to_string());
                    }
                    [stream, shard] => {
                        if !balanced.is_empty() {
                            return Err(mix_error());
                        }
                        pinned
                            .entry(stream.trim().to_string())
                            .or_default()
                            .push(shard.trim().to_string());
                    }
                    _ => {
                        return Err(Error::Config(format!(
                            "stream '{trimmed}' is invalid, only one shard may be specified; \
                             list the stream twice for two shards, e.g. `foo:0,foo:1`"
                        )));
                    }
                }
            }
        }
        if balanced.is_empty() && pinned.is_empty() {
            return Err(Error::Config("no streams configured".into()));
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        let checkpointer = Checkpointer::new(leases, client_id, conf.lease_period);

        Ok(Self {
            conf,
            balanced,
            pinned,
            log,
            checkpointer,
            msg_rx: None,
            shutdown: None,
            runner: None,
        })
    }

    /// This instance's stable client identity.
    pub fn client_id(&self) -> &str {
        self.checkpointer.client_id()
    }

    /// Wrap in transparent nack-redelivery and spawn as an engine input.
    pub fn spawn(self, label: impl Into<String>) -> InputHandle {
        let wrapped = AutoRetryInput::new(Box::new(self), AutoRetryConfig::default());
        spawn_input(Box::new(wrapped), label.into())
    }

    fn all_streams(&self) -> Vec<&str> {
        self.balanced
            .iter()
            .map(String::as_str)
            .chain(self.pinned.keys().map(String::as_str))
            .collect()
    }
}

fn mix_error() -> Error {
    Error::Config(
        "balanced streams and explicit stream:shard entries cannot be mixed in one input".into(),
    )
}

#[async_trait]
impl Input for ShardedLogInput {
    async fn connect(&mut self) -> Result<()> {
        if self.runner.is_some() {
            return Ok(());
        }

        // Missing streams surface to the reader, which retries with its
        // own backoff.
        for stream in self.all_streams() {
            match self.log.list_shards(stream).await {
                Ok(_) => {}
                Err(LogStoreError::StreamNotFound(s)) => {
                    return Err(Error::Transient(format!("stream {s} does not exist yet")));
                }
                Err(err) => return Err(Error::Transient(err.to_string())),
            }
        }

        let (msg_tx, msg_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            log: Arc::clone(&self.log),
            checkpointer: self.checkpointer.clone(),
            conf: self.conf.clone(),
            msg_tx,
        });

        let runner = if self.pinned.is_empty() {
            let streams = self.balanced.clone();
            tokio::spawn(run_balanced(shared, streams, shutdown_rx))
        } else {
            let pinned = self.pinned.clone();
            tokio::spawn(run_pinned(shared, pinned, shutdown_rx))
        };

        self.msg_rx = Some(msg_rx);
        self.shutdown = Some(shutdown_tx);
        self.runner = Some(runner);
        tracing::info!(client = %self.checkpointer.client_id(), "sharded log consumer connected");
        Ok(())
    }

    async fn read_batch(&mut self) -> Result<ReadBatch> {
        let rx = self.msg_rx.as_mut().ok_or(Error::NotConnected)?;
        match rx.recv().await {
            Some((batch, ack)) => Ok(ReadBatch { batch, ack }),
            None => Err(Error::Shutdown),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(runner) = self.runner.take() {
            let _ = runner.await;
        }
        self.msg_rx = None;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────
// Orchestration
// ────────────────────────────────────────────────────────────────────────

async fn run_balanced(
    shared: Arc<Shared>,
    streams: Vec<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut consumers: JoinSet<()> = JoinSet::new();
    let client_id = shared.checkpointer.client_id().to_string();
    let stale_after = chrono::Duration::from_std(shared.conf.lease_period * 2)
        .unwrap_or_else(|_| chrono::Duration::seconds(60));

    loop {
        if *shutdown.borrow() {
            break;
        }

        for stream in &streams {
            let shards = match shared.log.list_shards(stream).await {
                Ok(shards) => shards,
                Err(err) => {
                    tracing::error!(stream = %stream, error = %err, "failed to list shards");
                    continue;
                }
            };
            let claims = match shared.checkpointer.all_claims(stream).await {
                Ok(claims) => claims,
                Err(err) => {
                    tracing::error!(stream = %stream, error = %err, "failed to obtain claims");
                    continue;
                }
            };

            // Unclaimed: open shards with no live claim. A stale claim
            // (lease twice overdue) counts as unclaimed, remembering its
            // last owner for the conditional claim.
            let mut unclaimed: HashMap<String, String> = shards
                .iter()
                .filter(|s| !s.closed)
                .map(|s| (s.id.clone(), String::new()))
                .collect();
            let now = chrono::Utc::now();
            for (owner, owner_claims) in &claims {
                for claim in owner_claims {
                    if now.signed_duration_since(claim.lease_timeout) > stale_after {
                        if unclaimed.contains_key(&claim.shard) {
                            unclaimed.insert(claim.shard.clone(), owner.clone());
                        }
                    } else {
                        unclaimed.remove(&claim.shard);
                    }
                }
            }

            if !unclaimed.is_empty() {
                for (shard, previous_owner) in unclaimed {
                    let from = (!previous_owner.is_empty()).then_some(previous_owner.as_str());
                    match shared.checkpointer.claim(stream, &shard, from).await {
                        Ok(sequence) => {
                            spawn_consumer(
                                &mut consumers,
                                Arc::clone(&shared),
                                shutdown.clone(),
                                stream.clone(),
                                shard,
                                sequence,
                            );
                        }
                        Err(LeaseError::NotAcquired) => {}
                        Err(err) => {
                            tracing::error!(shard = %shard, error = %err, "failed to claim unclaimed shard");
                        }
                    }
                }
                // Unclaimed shards existed; no need for thievery yet.
                continue;
            }

            // Nothing unclaimed: look for a client worth stealing from.
            let self_claims = claims.get(&client_id).map(Vec::len).unwrap_or(0);
            for (owner, owner_claims) in &claims {
                if owner == &client_id {
                    continue;
                }
                if owner_claims.len() < self_claims + shared.conf.steal_surplus {
                    continue;
                }

                let target =
                    owner_claims[rand::rng().random_range(0..owner_claims.len())].shard.clone();
                tracing::debug!(
                    stream = %stream,
                    shard = %target,
                    from = %owner,
                    client = %client_id,
                    "attempting to steal shard"
                );
                match shared.checkpointer.claim(stream, &target, Some(owner)).await {
                    Ok(sequence) => {
                        tracing::debug!(shard = %target, "successfully stole shard");
                        spawn_consumer(
                            &mut consumers,
                            Arc::clone(&shared),
                            shutdown.clone(),
                            stream.clone(),
                            target,
                            sequence,
                        );
                        // One theft per pass is plenty.
                        break;
                    }
                    Err(LeaseError::NotAcquired) => {
                        tracing::debug!(shard = %target, "aborting theft, owner still live");
                    }
                    Err(err) => {
                        tracing::error!(shard = %target, error = %err, "failed to steal shard");
                    }
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.conf.rebalance_period) => {}
            _ = shutdown.changed() => break,
        }
    }

    while consumers.join_next().await.is_some() {}
    // Dropping `shared` here releases the msg sender and closes the
    // channel toward the reader.
}

async fn run_pinned(
    shared: Arc<Shared>,
    mut stream_shards: HashMap<String, Vec<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut consumers: JoinSet<()> = JoinSet::new();

    while !stream_shards.is_empty() && !*shutdown.borrow() {
        let mut remaining: HashMap<String, Vec<String>> = HashMap::new();

        for (stream, shards) in stream_shards.drain() {
            let mut failed = Vec::new();
            for shard in shards {
                match shared.checkpointer.claim(&stream, &shard, None).await {
                    Ok(sequence) => {
                        spawn_consumer(
                            &mut consumers,
                            Arc::clone(&shared),
                            shutdown.clone(),
                            stream.clone(),
                            shard,
                            sequence,
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            stream = %stream,
                            shard = %shard,
                            error = %err,
                            "failed to start pinned shard consumer"
                        );
                        failed.push(shard);
                    }
                }
            }
            if !failed.is_empty() {
                remaining.insert(stream, failed);
            }
        }

        stream_shards = remaining;
        if !stream_shards.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    while consumers.join_next().await.is_some() {}
}

fn spawn_consumer(
    consumers: &mut JoinSet<()>,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    stream: String,
    shard: String,
    starting_sequence: Option<u64>,
) {
    consumers.spawn(run_consumer(
        shared,
        shutdown,
        stream,
        shard,
        starting_sequence,
    ));
}

// ────────────────────────────────────────────────────────────────────────
// Per-shard consumer
// ────────────────────────────────────────────────────────────────────────

async fn run_consumer(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    stream: String,
    shard: String,
    starting_sequence: Option<u64>,
) {
    let client = shared.checkpointer.client_id().to_string();
    tracing::debug!(stream = %stream, shard = %shard, client = %client, "consuming shard");
    if let Some(metrics) = crate::metrics::Metrics::get() {
        metrics.shards_owned.with_label_values(&[stream.as_str()]).inc();
    }

    let state = consume_shard(&shared, &mut shutdown, &stream, &shard, starting_sequence).await;

    if let Some(metrics) = crate::metrics::Metrics::get() {
        metrics.shards_owned.with_label_values(&[stream.as_str()]).dec();
    }
    let reason = match state {
        ShardState::Finished => "the shard is closed",
        ShardState::Yielding => "the shard was claimed by another client",
        _ => "the pipeline is shutting down",
    };
    tracing::debug!(stream = %stream, shard = %shard, client = %client, reason, "closing shard");
}

async fn consume_shard(
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
    stream: &str,
    shard: &str,
    starting_sequence: Option<u64>,
) -> ShardState {
    let conf = &shared.conf;
    let fallback_position = if conf.start_from_oldest {
        IteratorPosition::TrimHorizon
    } else {
        IteratorPosition::Latest
    };
    let start_position = starting_sequence
        .map(IteratorPosition::AfterSequence)
        .unwrap_or(fallback_position);

    let mut batcher = match ShardBatcher::new(
        stream,
        shard,
        conf.batching.clone(),
        conf.checkpoint_limit,
    ) {
        Ok(b) => b,
        Err(err) => {
            tracing::error!(error = %err, "failed to build shard batcher");
            let _ = shared
                .checkpointer
                .yield_shard(stream, shard, starting_sequence)
                .await;
            return ShardState::Yielding;
        }
    };

    let mut iterator = match shared.log.get_iterator(stream, shard, start_position).await {
        Ok(iter) => Some(iter),
        Err(err) => {
            tracing::error!(error = %err, "failed to obtain shard iterator");
            let _ = shared
                .checkpointer
                .yield_shard(stream, shard, starting_sequence)
                .await;
            return ShardState::Yielding;
        }
    };

    let mut pending: VecDeque<Record> = VecDeque::new();
    let mut pending_msg: Option<(MessageBatch, AckFn)> = None;
    let mut commit_at = Instant::now() + conf.commit_period;
    let mut poll_backoff = INITIAL_POLL_BACKOFF;

    let final_state = loop {
        // Periodic commit; a failed condition means the shard was stolen.
        if Instant::now() >= commit_at {
            commit_at = Instant::now() + conf.commit_period;
            match shared
                .checkpointer
                .checkpoint(stream, shard, batcher.committed_sequence(), false)
                .await
            {
                Ok(true) => {}
                Ok(false) => break ShardState::Yielding,
                Err(err) => {
                    tracing::error!(
                        stream = %stream,
                        shard = %shard,
                        error = %err,
                        "failed to store checkpoint"
                    );
                }
            }
        }
        if *shutdown.borrow() {
            break ShardState::Closing;
        }

        // Assemble the next message: a timed window, then buffered
        // records.
        if pending_msg.is_none() && batcher.until_next().is_some_and(|d| d.is_zero()) {
            pending_msg = batcher.flush_message();
        }
        if pending_msg.is_none() {
            while let Some(record) = pending.pop_front() {
                if batcher.add_record(record) {
                    pending_msg = batcher.flush_message();
                    break;
                }
            }
        }

        // End of a closed shard: flush what remains, wait for in-flight
        // acknowledgements, then finish.
        if pending_msg.is_none() && iterator.is_none() && pending.is_empty() {
            if batcher.has_pending() {
                pending_msg = batcher.flush_message();
            }
            if pending_msg.is_none() && batcher.in_flight() == 0 {
                break ShardState::Finished;
            }
        }

        // Dispatch.
        if let Some((batch, ack)) = pending_msg.take() {
            tokio::select! {
                permit = shared.msg_tx.reserve() => match permit {
                    Ok(permit) => permit.send((batch, ack)),
                    Err(_) => break ShardState::Closing,
                },
                _ = tokio::time::sleep_until(commit_at) => {
                    pending_msg = Some((batch, ack));
                }
                _ = shutdown.changed() => {
                    pending_msg = Some((batch, ack));
                }
            }
            continue;
        }

        // Pull more records.
        if iterator.is_some() && pending.is_empty() && !batcher.stalled() {
            let iter = match iterator.clone() {
                Some(iter) => iter,
                None => continue,
            };
            tokio::select! {
                res = shared.log.read_records(stream, &iter, conf.read_limit) => match res {
                    Ok((records, next)) => {
                        let empty = records.is_empty();
                        pending.extend(records);
                        iterator = next;
                        if empty && iterator.is_some() {
                            tokio::select! {
                                _ = tokio::time::sleep(poll_backoff) => {}
                                _ = tokio::time::sleep_until(commit_at) => {}
                                _ = shutdown.changed() => {}
                            }
                            poll_backoff = (poll_backoff * 2).min(MAX_POLL_BACKOFF);
                        } else if !empty {
                            poll_backoff = INITIAL_POLL_BACKOFF;
                        }
                    }
                    Err(LogStoreError::IteratorExpired) => {
                        tracing::warn!(shard = %shard, "shard iterator expired, refreshing");
                        let position = batcher
                            .committed_sequence()
                            .or(starting_sequence)
                            .map(IteratorPosition::AfterSequence)
                            .unwrap_or(fallback_position);
                        match shared.log.get_iterator(stream, shard, position).await {
                            Ok(fresh) => iterator = Some(fresh),
                            Err(err) => {
                                tracing::error!(error = %err, "failed to refresh shard iterator");
                                tokio::time::sleep(poll_backoff).await;
                            }
                        }
                    }
                    Err(LogStoreError::Throttled) => {
                        tracing::warn!(shard = %shard, "throttled while pulling records");
                        tokio::select! {
                            _ = tokio::time::sleep(poll_backoff) => {}
                            _ = shutdown.changed() => {}
                        }
                        poll_backoff = (poll_backoff * 2).min(MAX_POLL_BACKOFF);
                    }
                    Err(LogStoreError::StreamNotFound(_)) => {
                        tracing::error!(stream = %stream, "stream vanished mid-consumption");
                        break ShardState::Closing;
                    }
                    Err(LogStoreError::Other(err)) => {
                        tracing::error!(error = %err, "failed to pull records");
                        tokio::select! {
                            _ = tokio::time::sleep(poll_backoff) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                },
                _ = tokio::time::sleep_until(commit_at) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        // Parked on the checkpoint limit or on in-flight acks: wake for
        // the next timer.
        let batch_timer = batcher.until_next().unwrap_or(ACK_POLL).max(Duration::from_millis(1));
        tokio::select! {
            _ = tokio::time::sleep_until(commit_at) => {}
            _ = tokio::time::sleep(batch_timer) => {}
            _ = shutdown.changed() => {}
        }
    };

    // Final bookkeeping per exit state.
    match final_state {
        ShardState::Finished => {
            if let Err(err) = shared.checkpointer.delete(stream, shard).await {
                tracing::error!(
                    stream = %stream,
                    shard = %shard,
                    error = %err,
                    "failed to remove checkpoint for finished shard"
                );
            }
        }
        ShardState::Yielding => {
            if let Err(err) = shared
                .checkpointer
                .yield_shard(stream, shard, batcher.committed_sequence())
                .await
            {
                tracing::error!(
                    stream = %stream,
                    shard = %shard,
                    error = %err,
                    "failed to yield checkpoint for stolen shard"
                );
            }
        }
        ShardState::Closing | ShardState::Consuming => {
            if let Err(err) = shared
                .checkpointer
                .checkpoint(stream, shard, batcher.committed_sequence(), true)
                .await
            {
                tracing::error!(
                    stream = %stream,
                    shard = %shard,
                    error = %err,
                    "failed to store final checkpoint"
                );
            }
        }
    }
    final_state
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::shard::store::{MemoryLeaseStore, MemoryLogStore};

    fn conf(streams: &[&str]) -> ShardedLogConfig {
        ShardedLogConfig {
            streams: streams.iter().map(|s| s.to_string()).collect(),
            checkpoint_limit: 1024,
            commit_period: Duration::from_millis(20),
            lease_period: Duration::from_millis(200),
            rebalance_period: Duration::from_millis(50),
            start_from_oldest: true,
            steal_surplus: 2,
            read_limit: 100,
            batching: BatchPolicyConfig::default(),
        }
    }

    fn stores() -> (Arc<MemoryLogStore>, Arc<MemoryLeaseStore>) {
        (Arc::new(MemoryLogStore::new()), Arc::new(MemoryLeaseStore::new()))
    }

    #[test]
    fn mixing_balanced_and_pinned_is_rejected() {
        let (log, leases) = stores();
        let res = ShardedLogInput::new(conf(&["foo", "bar:0"]), log, leases);
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn double_colon_is_rejected() {
        let (log, leases) = stores();
        let res = ShardedLogInput::new(conf(&["foo:0:1"]), log, leases);
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn comma_separated_entries_split() {
        let (log, leases) = stores();
        let input = ShardedLogInput::new(conf(&["foo:0,foo:1"]), log, leases).unwrap();
        assert_eq!(input.pinned["foo"].len(), 2);
    }

    #[tokio::test]
    async fn missing_stream_surfaces_as_transient() {
        let (log, leases) = stores();
        let mut input = ShardedLogInput::new(conf(&["ghost"]), log, leases).unwrap();
        assert!(matches!(input.connect().await, Err(Error::Transient(_))));
    }

    #[tokio::test]
    async fn pinned_shard_consumes_to_the_end() {
        let (log, leases) = stores();
        log.create_stream("s", 1);
        for i in 0..5 {
            log.append("s", "0", format!("r{i}"));
        }
        log.close_shard("s", "0");

        let mut input =
            ShardedLogInput::new(conf(&["s:0"]), log, Arc::clone(&leases) as Arc<dyn LeaseStore>)
                .unwrap();
        input.connect().await.unwrap();

        let mut payloads = Vec::new();
        loop {
            match input.read_batch().await {
                Ok(read) => {
                    for msg in read.batch.iter() {
                        payloads.push(msg.payload_str().unwrap().to_string());
                    }
                    (read.ack)(Ok(()));
                }
                Err(Error::Shutdown) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        input.close().await.unwrap();

        assert_eq!(payloads, vec!["r0", "r1", "r2", "r3", "r4"]);
        // Finished shards delete their checkpoint row.
        assert!(leases.get("s", "0").is_none());
    }

    #[tokio::test]
    async fn committed_sequence_advances_only_after_ack() {
        let (log, leases) = stores();
        log.create_stream("s", 1);
        log.append("s", "0", "one");

        let mut input =
            ShardedLogInput::new(conf(&["s:0"]), log, Arc::clone(&leases) as Arc<dyn LeaseStore>)
                .unwrap();
        input.connect().await.unwrap();

        let read = input.read_batch().await.unwrap();

        // Unacked: commits pass but carry no sequence.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(leases.get("s", "0").unwrap().sequence, None);

        (read.ack)(Ok(()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(leases.get("s", "0").unwrap().sequence, Some(1));

        input.close().await.unwrap();
    }

    #[tokio::test]
    async fn balanced_single_client_claims_everything() {
        let (log, leases) = stores();
        log.create_stream("s", 3);
        for shard in ["0", "1", "2"] {
            log.append("s", shard, format!("payload-{shard}"));
        }

        let mut input =
            ShardedLogInput::new(conf(&["s"]), log, Arc::clone(&leases) as Arc<dyn LeaseStore>)
                .unwrap();
        let client = input.client_id().to_string();
        input.connect().await.unwrap();

        let mut seen = std::collections::HashSet::new();
        while seen.len() < 3 {
            let read = tokio::time::timeout(Duration::from_secs(5), input.read_batch())
                .await
                .expect("timed out waiting for shard records")
                .unwrap();
            for msg in read.batch.iter() {
                seen.insert(msg.payload_str().unwrap().to_string());
            }
            (read.ack)(Ok(()));
        }

        let claims = leases.all_claims("s").await.unwrap();
        assert_eq!(claims[&client].len(), 3, "all shards claimed by the one client");

        input.close().await.unwrap();
    }

    #[tokio::test]
    async fn resumes_after_seeded_checkpoint() {
        let (log, leases) = stores();
        log.create_stream("s", 1);
        for seq in [99, 100, 101] {
            log.append_at("s", "0", seq, format!("r{seq}"));
        }
        leases.seed(
            "s",
            "0",
            "previous-client",
            Some(100),
            chrono::Utc::now() - chrono::Duration::seconds(600),
        );

        let mut input =
            ShardedLogInput::new(conf(&["s:0"]), log, Arc::clone(&leases) as Arc<dyn LeaseStore>)
                .unwrap();
        input.connect().await.unwrap();

        let read = input.read_batch().await.unwrap();
        assert_eq!(read.batch.len(), 1);
        assert_eq!(
            read.batch.get(0).unwrap().payload_str(),
            Some("r101"),
            "consumption resumes after the committed sequence"
        );
        (read.ack)(Ok(()));

        input.close().await.unwrap();
    }

    #[tokio::test]
    async fn iterator_expiry_is_refreshed_transparently() {
        let (log, leases) = stores();
        log.create_stream("s", 1);
        log.append("s", "0", "first");

        let mut input =
            ShardedLogInput::new(conf(&["s:0"]), Arc::clone(&log) as Arc<dyn LogStore>, leases)
                .unwrap();
        input.connect().await.unwrap();

        let read = input.read_batch().await.unwrap();
        (read.ack)(Ok(()));

        // Invalidate the consumer's iterator, then append more records.
        log.expire_iterators();
        log.append("s", "0", "second");

        let read = tokio::time::timeout(Duration::from_secs(5), input.read_batch())
            .await
            .expect("consumer should refresh its iterator and continue")
            .unwrap();
        assert_eq!(read.batch.get(0).unwrap().payload_str(), Some("second"));
        (read.ack)(Ok(()));

        input.close().await.unwrap();
    }

    #[tokio::test]
    async fn throttling_backs_off_and_recovers() {
        let (log, leases) = stores();
        log.create_stream("s", 1);
        log.throttle_next(2);
        log.append("s", "0", "eventually");

        let mut input =
            ShardedLogInput::new(conf(&["s:0"]), Arc::clone(&log) as Arc<dyn LogStore>, leases)
                .unwrap();
        input.connect().await.unwrap();

        let read = tokio::time::timeout(Duration::from_secs(5), input.read_batch())
            .await
            .expect("consumer should recover from throttling")
            .unwrap();
        assert_eq!(read.batch.get(0).unwrap().payload_str(), Some("eventually"));
        (read.ack)(Ok(()));

        input.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_writes_final_checkpoint() {
        let (log, leases) = stores();
        log.create_stream("s", 1);
        log.append("s", "0", "one");

        let mut input =
            ShardedLogInput::new(conf(&["s:0"]), log, Arc::clone(&leases) as Arc<dyn LeaseStore>)
                .unwrap();
        input.connect().await.unwrap();

        let read = input.read_batch().await.unwrap();
        (read.ack)(Ok(()));
        // Give the watermark a moment, then close before the next commit
        // tick; the final checkpoint must still capture the sequence.
        tokio::time::sleep(Duration::from_millis(5)).await;
        input.close().await.unwrap();

        let record = leases.get("s", "0").unwrap();
        assert_eq!(record.sequence, Some(1));
        assert!(
            record.lease_timeout <= chrono::Utc::now(),
            "final checkpoint frees the lease"
        );
    }
}
