//! Dedupe processor
//!
//! Computes a fingerprint for each message via interpolation and performs an
//! atomic first-writer-wins `add` against a named cache. Repeats within the
//! cache's retention window are dropped; for any two messages with the same
//! fingerprint, the first to reach the processor survives.
//!
//! Cache access failures are governed by `drop_on_err`: when true (the
//! default) the message is dropped, when false it is forwarded tagged as
//! errored. Deduplication is the canonical non-idempotent processor: the
//! cache write happens here, not at the terminal output, so a batch retried
//! after this point will see its repeats dropped.

use super::Processor;
use crate::interp::Template;
use crate::manager::Manager;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use virta_core::{Error, MessageBatch, Result};

/// Config fields accepted by the `dedupe` processor.
pub const CONFIG_FIELDS: &[&str] = &["cache", "key", "drop_on_err"];

/// Configuration for [`DedupeProcessor`].
#[derive(Debug, Clone, Deserialize)]
pub struct DedupeConfig {
    /// Name of the cache resource holding fingerprints.
    pub cache: String,
    /// Fingerprint template, e.g. `${! json("id") }`.
    pub key: String,
    /// Drop the message when the cache fails, instead of forwarding it
    /// errored.
    #[serde(default = "default_drop_on_err")]
    pub drop_on_err: bool,
}

fn default_drop_on_err() -> bool {
    true
}

/// Drops messages whose fingerprint was already seen.
pub struct DedupeProcessor {
    cache: String,
    key: Template,
    drop_on_err: bool,
    manager: Manager,
}

impl DedupeProcessor {
    /// Build from config. The key template is parsed (and linted) here; the
    /// cache is resolved per access so the resource can be swapped under a
    /// running stream.
    pub fn new(conf: DedupeConfig, manager: &Manager) -> Result<Self> {
        Ok(Self {
            cache: conf.cache,
            key: Template::parse(&conf.key)?,
            drop_on_err: conf.drop_on_err,
            manager: manager.clone(),
        })
    }
}

#[async_trait]
impl Processor for DedupeProcessor {
    fn name(&self) -> &str {
        "dedupe"
    }

    async fn process(&self, batch: MessageBatch) -> Result<Vec<MessageBatch>> {
        let mut kept = MessageBatch::with_capacity(batch.len());

        for mut msg in batch {
            let key = match self.key.render(&msg) {
                Ok(key) => key,
                Err(err) => {
                    tracing::debug!(error = %err, "dedupe key render failed");
                    if self.drop_on_err {
                        continue;
                    }
                    msg.set_error(err);
                    kept.push(msg);
                    continue;
                }
            };

            let added = self
                .manager
                .access_cache(&self.cache, |cache| {
                    let key = key.clone();
                    async move { cache.add(&key, Bytes::new(), None).await }
                })
                .await?;

            match added {
                Ok(()) => kept.push(msg),
                Err(Error::KeyAlreadyExists) => {
                    tracing::debug!(key = %key, "dropping duplicate message");
                }
                Err(err) => {
                    tracing::error!(
                        cache = %self.cache,
                        error = %err,
                        "dedupe cache access failed"
                    );
                    if self.drop_on_err {
                        continue;
                    }
                    msg.set_error(err);
                    kept.push(msg);
                }
            }
        }

        if kept.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![kept])
        }
    }
}
