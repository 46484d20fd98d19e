//! Ownership protocol over the checkpoint KV
//!
//! Binds a client identity and lease period to the conditional operations
//! of a [`LeaseStore`]:
//!
//! - *Claim*: take a free (or stolen) shard, learning its last committed
//!   sequence.
//! - *Commit*: persist the latest acknowledged sequence and refresh the
//!   lease. A failed condition means another client stole the shard; the
//!   caller yields gracefully.
//! - *Yield*: a final commit with the lease timeout set to now, freeing
//!   the shard for immediate takeover.
//! - *Delete*: garbage-collect the row of a finished shard.

use super::store::{ClientClaim, LeaseError, LeaseStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use virta_core::{Error, Result};

/// The ownership protocol bound to one client identity.
#[derive(Clone)]
pub struct Checkpointer {
    store: Arc<dyn LeaseStore>,
    client_id: String,
    lease: Duration,
}

impl Checkpointer {
    /// Bind a store to a client identity and lease period.
    pub fn new(store: Arc<dyn LeaseStore>, client_id: impl Into<String>, lease: Duration) -> Self {
        Self {
            store,
            client_id: client_id.into(),
            lease,
        }
    }

    /// This instance's stable client identity.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Attempt to claim a shard, optionally stealing from `from_client`.
    ///
    /// `Ok(None)` means the shard was claimed with no committed sequence
    /// yet; `Err(LeaseError::NotAcquired)` means another client holds a
    /// live lease.
    pub async fn claim(
        &self,
        stream: &str,
        shard: &str,
        from_client: Option<&str>,
    ) -> std::result::Result<Option<u64>, LeaseError> {
        self.store
            .claim(stream, shard, &self.client_id, from_client, self.lease)
            .await
    }

    /// Commit the latest acknowledged sequence.
    ///
    /// Returns whether this client still owns the shard. A `final_commit`
    /// frees the lease immediately, which is how both graceful yield and
    /// shutdown hand the shard over.
    pub async fn checkpoint(
        &self,
        stream: &str,
        shard: &str,
        sequence: Option<u64>,
        final_commit: bool,
    ) -> Result<bool> {
        self.store
            .commit(
                stream,
                shard,
                &self.client_id,
                sequence,
                self.lease,
                final_commit,
            )
            .await
            .map_err(|e| Error::Transient(e.to_string()))
    }

    /// Free the shard after losing the claim: a final commit of whatever
    /// was acknowledged.
    pub async fn yield_shard(
        &self,
        stream: &str,
        shard: &str,
        sequence: Option<u64>,
    ) -> Result<()> {
        self.checkpoint(stream, shard, sequence, true).await.map(|_| ())
    }

    /// Remove the checkpoint row of a finished shard.
    pub async fn delete(&self, stream: &str, shard: &str) -> Result<()> {
        self.store
            .delete(stream, shard, &self.client_id)
            .await
            .map_err(|e| Error::Transient(e.to_string()))
    }

    /// All claims on a stream, grouped by client.
    pub async fn all_claims(&self, stream: &str) -> Result<HashMap<String, Vec<ClientClaim>>> {
        self.store
            .all_claims(stream)
            .await
            .map_err(|e| Error::Transient(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::shard::store::MemoryLeaseStore;

    fn pair() -> (Checkpointer, Checkpointer, Arc<MemoryLeaseStore>) {
        let store = Arc::new(MemoryLeaseStore::new());
        (
            Checkpointer::new(Arc::clone(&store) as Arc<dyn LeaseStore>, "a", Duration::from_secs(30)),
            Checkpointer::new(Arc::clone(&store) as Arc<dyn LeaseStore>, "b", Duration::from_secs(30)),
            store,
        )
    }

    #[tokio::test]
    async fn claim_commit_yield_cycle() {
        let (a, b, store) = pair();

        assert_eq!(a.claim("s", "0", None).await.unwrap(), None);
        assert!(a.checkpoint("s", "0", Some(5), false).await.unwrap());
        assert_eq!(store.get("s", "0").unwrap().sequence, Some(5));

        // b cannot claim while the lease lives.
        assert_eq!(b.claim("s", "0", None).await, Err(LeaseError::NotAcquired));

        // Yield frees it; b inherits the sequence.
        a.yield_shard("s", "0", Some(6)).await.unwrap();
        assert_eq!(b.claim("s", "0", None).await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn stolen_shard_detected_at_commit() {
        let (a, b, _store) = pair();

        a.claim("s", "0", None).await.unwrap();
        b.claim("s", "0", Some("a")).await.unwrap();

        assert!(
            !a.checkpoint("s", "0", Some(9), false).await.unwrap(),
            "old owner's commit reports the theft"
        );
    }

    #[tokio::test]
    async fn delete_cleans_finished_shard() {
        let (a, _b, store) = pair();
        a.claim("s", "0", None).await.unwrap();
        a.delete("s", "0").await.unwrap();
        assert!(store.get("s", "0").is_none());
    }
}
