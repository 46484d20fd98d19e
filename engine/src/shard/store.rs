//! Collaborator contracts for the sharded-log consumer
//!
//! Two external systems back the consumer: the ordered log itself and a
//! strongly-consistent KV holding checkpoint records. Both are abstracted
//! behind traits so the protocol is testable without cloud credentials;
//! concrete drivers implement these against their service APIs.
//!
//! The checkpoint schema is one record per `(stream, shard)`:
//! `{client_id, sequence, lease_timeout}`. A shard is *held* by its client
//! until the lease timeout passes, then *free*. All mutations are
//! conditional and atomic.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// One record of an ordered shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Position within the shard. Strictly increasing.
    pub sequence: u64,
    /// Opaque payload.
    pub payload: Bytes,
}

/// A shard of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    /// Shard identifier, unique within its stream.
    pub id: String,
    /// Whether the shard has been closed and will receive no new records.
    pub closed: bool,
}

/// Opaque read position within a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogIterator {
    /// The shard this iterator reads.
    pub shard: String,
    pub(crate) offset: u64,
    pub(crate) token: u64,
}

/// Where a fresh iterator starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorPosition {
    /// The oldest retained record.
    TrimHorizon,
    /// Only records appended after acquisition.
    Latest,
    /// The first record with a sequence above the given one.
    AfterSequence(u64),
}

/// Failure modes of the log collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogStoreError {
    /// The iterator aged out; acquire a fresh one at the last acked
    /// sequence.
    #[error("shard iterator expired")]
    IteratorExpired,
    /// The stream does not exist (yet).
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    /// The service throttled the call; back off exponentially.
    #[error("throttled by upstream")]
    Throttled,
    /// Anything else.
    #[error(transparent)]
    Other(#[from] virta_core::Error),
}

/// The ordered log: shard discovery and record reads.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// The shards of a stream.
    async fn list_shards(&self, stream: &str) -> Result<Vec<ShardInfo>, LogStoreError>;

    /// Acquire an iterator.
    async fn get_iterator(
        &self,
        stream: &str,
        shard: &str,
        position: IteratorPosition,
    ) -> Result<LogIterator, LogStoreError>;

    /// Read up to `limit` records.
    ///
    /// Returns the records plus the follow-up iterator; `None` means the
    /// shard is closed and fully consumed. An empty record set with a
    /// `Some` iterator means no new records yet.
    async fn read_records(
        &self,
        stream: &str,
        iterator: &LogIterator,
        limit: usize,
    ) -> Result<(Vec<Record>, Option<LogIterator>), LogStoreError>;
}

/// One checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Owning client, or the last owner if the lease expired.
    pub client_id: String,
    /// Last committed sequence, if any was ever committed.
    pub sequence: Option<u64>,
    /// The lease is held until this instant.
    pub lease_timeout: DateTime<Utc>,
}

/// A claim observed via [`LeaseStore::all_claims`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientClaim {
    /// The claimed shard.
    pub shard: String,
    /// When the claim's lease runs out.
    pub lease_timeout: DateTime<Utc>,
}

/// Failure modes of the checkpoint KV.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// The conditional claim failed: another client holds a live lease.
    #[error("the lease could not be acquired")]
    NotAcquired,
    /// Anything else.
    #[error("lease store error: {0}")]
    Other(String),
}

/// The checkpoint KV. All operations are conditional and atomic.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claim a shard for `new_client`.
    ///
    /// Succeeds when the record is absent, the lease has expired, the
    /// record already belongs to `new_client`, or it belongs to
    /// `from_client` (the steal path). Writes a fresh lease and returns
    /// the last committed sequence.
    async fn claim(
        &self,
        stream: &str,
        shard: &str,
        new_client: &str,
        from_client: Option<&str>,
        lease: Duration,
    ) -> Result<Option<u64>, LeaseError>;

    /// Commit the latest acknowledged sequence and refresh the lease.
    ///
    /// `final_commit` sets the lease timeout to now, freeing the shard for
    /// immediate takeover. Returns `false` when another client has stolen
    /// the shard (the caller should yield).
    async fn commit(
        &self,
        stream: &str,
        shard: &str,
        client: &str,
        sequence: Option<u64>,
        lease: Duration,
        final_commit: bool,
    ) -> Result<bool, LeaseError>;

    /// Remove the checkpoint row of a finished shard.
    async fn delete(&self, stream: &str, shard: &str, client: &str) -> Result<(), LeaseError>;

    /// All claims on a stream, grouped by client.
    async fn all_claims(
        &self,
        stream: &str,
    ) -> Result<HashMap<String, Vec<ClientClaim>>, LeaseError>;
}

// ────────────────────────────────────────────────────────────────────────
// In-memory implementations
// ────────────────────────────────────────────────────────────────────────

struct ShardData {
    records: Vec<Record>,
    closed: bool,
}

/// In-memory ordered log for tests and embedding.
///
/// Failure injection: [`MemoryLogStore::throttle_next`] makes the next N
/// reads fail with `Throttled`; [`MemoryLogStore::expire_iterators`]
/// invalidates every outstanding iterator, as an aged-out iterator would.
#[derive(Default)]
pub struct MemoryLogStore {
    streams: Mutex<HashMap<String, HashMap<String, ShardData>>>,
    throttle_budget: AtomicUsize,
    generation: AtomicUsize,
    expire_flag: AtomicBool,
}

impl MemoryLogStore {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stream with numbered shards `"0"..shards`.
    pub fn create_stream(&self, stream: &str, shards: usize) {
        let mut streams = self.streams.lock();
        let entry = streams.entry(stream.to_string()).or_default();
        for i in 0..shards {
            entry.entry(i.to_string()).or_insert(ShardData {
                records: Vec::new(),
                closed: false,
            });
        }
    }

    /// Append a record, returning its assigned sequence.
    pub fn append(&self, stream: &str, shard: &str, payload: impl Into<Bytes>) -> u64 {
        let mut streams = self.streams.lock();
        let data = streams
            .entry(stream.to_string())
            .or_default()
            .entry(shard.to_string())
            .or_insert(ShardData {
                records: Vec::new(),
                closed: false,
            });
        let sequence = data.records.last().map(|r| r.sequence + 1).unwrap_or(1);
        data.records.push(Record {
            sequence,
            payload: payload.into(),
        });
        sequence
    }

    /// Append a record at an explicit sequence (must be increasing).
    pub fn append_at(&self, stream: &str, shard: &str, sequence: u64, payload: impl Into<Bytes>) {
        let mut streams = self.streams.lock();
        let data = streams
            .entry(stream.to_string())
            .or_default()
            .entry(shard.to_string())
            .or_insert(ShardData {
                records: Vec::new(),
                closed: false,
            });
        debug_assert!(
            data.records.last().map(|r| r.sequence < sequence).unwrap_or(true),
            "sequences must increase"
        );
        data.records.push(Record {
            sequence,
            payload: payload.into(),
        });
    }

    /// Mark a shard closed: no further records will arrive.
    pub fn close_shard(&self, stream: &str, shard: &str) {
        if let Some(data) = self
            .streams
            .lock()
            .get_mut(stream)
            .and_then(|s| s.get_mut(shard))
        {
            data.closed = true;
        }
    }

    /// Fail the next `n` reads with [`LogStoreError::Throttled`].
    pub fn throttle_next(&self, n: usize) {
        self.throttle_budget.store(n, Ordering::SeqCst);
    }

    /// Invalidate all outstanding iterators once.
    pub fn expire_iterators(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.expire_flag.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn list_shards(&self, stream: &str) -> Result<Vec<ShardInfo>, LogStoreError> {
        let streams = self.streams.lock();
        let shards = streams
            .get(stream)
            .ok_or_else(|| LogStoreError::StreamNotFound(stream.to_string()))?;
        let mut out: Vec<ShardInfo> = shards
            .iter()
            .map(|(id, data)| ShardInfo {
                id: id.clone(),
                closed: data.closed,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn get_iterator(
        &self,
        stream: &str,
        shard: &str,
        position: IteratorPosition,
    ) -> Result<LogIterator, LogStoreError> {
        let streams = self.streams.lock();
        let data = streams
            .get(stream)
            .ok_or_else(|| LogStoreError::StreamNotFound(stream.to_string()))?
            .get(shard)
            .ok_or_else(|| {
                LogStoreError::Other(virta_core::Error::Permanent(format!(
                    "shard {shard} not found"
                )))
            })?;

        let offset = match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::Latest => data.records.len() as u64,
            IteratorPosition::AfterSequence(seq) => data
                .records
                .iter()
                .position(|r| r.sequence > seq)
                .map(|i| i as u64)
                .unwrap_or(data.records.len() as u64),
        };

        Ok(LogIterator {
            shard: shard.to_string(),
            offset,
            token: self.generation.load(Ordering::SeqCst) as u64,
        })
    }

    async fn read_records(
        &self,
        stream: &str,
        iterator: &LogIterator,
        limit: usize,
    ) -> Result<(Vec<Record>, Option<LogIterator>), LogStoreError> {
        let budget = self.throttle_budget.load(Ordering::SeqCst);
        if budget > 0
            && self
                .throttle_budget
                .compare_exchange(budget, budget - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(LogStoreError::Throttled);
        }

        if self.expire_flag.load(Ordering::SeqCst)
            && iterator.token < self.generation.load(Ordering::SeqCst) as u64
        {
            return Err(LogStoreError::IteratorExpired);
        }

        let streams = self.streams.lock();
        let data = streams
            .get(stream)
            .ok_or_else(|| LogStoreError::StreamNotFound(stream.to_string()))?
            .get(&iterator.shard)
            .ok_or_else(|| {
                LogStoreError::Other(virta_core::Error::Permanent(format!(
                    "shard {} not found",
                    iterator.shard
                )))
            })?;

        let start = iterator.offset as usize;
        let end = (start + limit.max(1)).min(data.records.len());
        let records: Vec<Record> = data.records.get(start..end).unwrap_or(&[]).to_vec();
        let next_offset = end as u64;

        let consumed_everything = next_offset as usize >= data.records.len();
        let next = if data.closed && consumed_everything {
            None
        } else {
            Some(LogIterator {
                shard: iterator.shard.clone(),
                offset: next_offset,
                token: self.generation.load(Ordering::SeqCst) as u64,
            })
        };

        Ok((records, next))
    }
}

/// In-memory checkpoint KV with atomic conditional updates.
#[derive(Default)]
pub struct MemoryLeaseStore {
    records: Mutex<HashMap<(String, String), CheckpointRecord>>,
}

impl MemoryLeaseStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a checkpoint row, e.g. a committed sequence with an already
    /// expired lease.
    pub fn seed(
        &self,
        stream: &str,
        shard: &str,
        client_id: &str,
        sequence: Option<u64>,
        lease_timeout: DateTime<Utc>,
    ) {
        self.records.lock().insert(
            (stream.to_string(), shard.to_string()),
            CheckpointRecord {
                client_id: client_id.to_string(),
                sequence,
                lease_timeout,
            },
        );
    }

    /// The row for a shard, if present.
    pub fn get(&self, stream: &str, shard: &str) -> Option<CheckpointRecord> {
        self.records
            .lock()
            .get(&(stream.to_string(), shard.to_string()))
            .cloned()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn claim(
        &self,
        stream: &str,
        shard: &str,
        new_client: &str,
        from_client: Option<&str>,
        lease: Duration,
    ) -> Result<Option<u64>, LeaseError> {
        let now = Utc::now();
        let lease_timeout = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| LeaseError::Other(e.to_string()))?;
        let mut records = self.records.lock();
        let key = (stream.to_string(), shard.to_string());

        match records.get_mut(&key) {
            None => {
                records.insert(
                    key,
                    CheckpointRecord {
                        client_id: new_client.to_string(),
                        sequence: None,
                        lease_timeout,
                    },
                );
                Ok(None)
            }
            Some(rec) => {
                let allowed = rec.lease_timeout <= now
                    || rec.client_id == new_client
                    || from_client.is_some_and(|c| c == rec.client_id);
                if !allowed {
                    return Err(LeaseError::NotAcquired);
                }
                rec.client_id = new_client.to_string();
                rec.lease_timeout = lease_timeout;
                Ok(rec.sequence)
            }
        }
    }

    async fn commit(
        &self,
        stream: &str,
        shard: &str,
        client: &str,
        sequence: Option<u64>,
        lease: Duration,
        final_commit: bool,
    ) -> Result<bool, LeaseError> {
        let now = Utc::now();
        let mut records = self.records.lock();
        let key = (stream.to_string(), shard.to_string());

        let Some(rec) = records.get_mut(&key) else {
            return Ok(false);
        };
        if rec.client_id != client {
            return Ok(false);
        }

        // Committed sequences never move backwards.
        if let Some(seq) = sequence {
            rec.sequence = Some(rec.sequence.map_or(seq, |prev| prev.max(seq)));
        }
        rec.lease_timeout = if final_commit {
            now
        } else {
            now + chrono::Duration::from_std(lease)
                .map_err(|e| LeaseError::Other(e.to_string()))?
        };
        Ok(true)
    }

    async fn delete(&self, stream: &str, shard: &str, client: &str) -> Result<(), LeaseError> {
        let mut records = self.records.lock();
        let key = (stream.to_string(), shard.to_string());
        if records.get(&key).is_some_and(|r| r.client_id == client) {
            records.remove(&key);
        }
        Ok(())
    }

    async fn all_claims(
        &self,
        stream: &str,
    ) -> Result<HashMap<String, Vec<ClientClaim>>, LeaseError> {
        let records = self.records.lock();
        let mut out: HashMap<String, Vec<ClientClaim>> = HashMap::new();
        for ((s, shard), rec) in records.iter() {
            if s == stream {
                out.entry(rec.client_id.clone()).or_default().push(ClientClaim {
                    shard: shard.clone(),
                    lease_timeout: rec.lease_timeout,
                });
            }
        }
        Ok(out)
    }
}
