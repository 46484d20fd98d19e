//! Mapping processor
//!
//! Rewrites each message payload as a fresh document built from `root.x =
//! expr` assignments. A message whose mapping fails is tagged as errored and
//! forwarded, so error-branch policies downstream can observe it.

use super::Processor;
use crate::interp::Mapping;
use async_trait::async_trait;
use virta_core::{MessageBatch, Result};

/// Applies a [`Mapping`] to every message of a batch.
pub struct MappingProcessor {
    mapping: Mapping,
}

impl MappingProcessor {
    /// Parse the mapping source. Fails at config time on malformed input.
    pub fn new(src: &str) -> Result<Self> {
        Ok(Self {
            mapping: Mapping::parse(src)?,
        })
    }
}

#[async_trait]
impl Processor for MappingProcessor {
    fn name(&self) -> &str {
        "mapping"
    }

    async fn process(&self, mut batch: MessageBatch) -> Result<Vec<MessageBatch>> {
        for msg in batch.iter_mut() {
            if let Err(err) = self.mapping.apply(msg) {
                tracing::debug!(error = %err, "mapping failed, tagging message");
                msg.set_error(err);
            }
        }
        Ok(vec![batch])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rewrites_payloads() {
        let proc = MappingProcessor::new("root.id = \"foobar\"").unwrap();
        let out = proc
            .process(MessageBatch::from_payloads(["{}"]))
            .await
            .unwrap();
        assert_eq!(out[0].get(0).unwrap().payload_str(), Some(r#"{"id":"foobar"}"#));
    }

    #[tokio::test]
    async fn failed_mapping_tags_message() {
        let proc = MappingProcessor::new(r#"root.x = json("missing")"#).unwrap();
        let out = proc
            .process(MessageBatch::from_payloads(["{}"]))
            .await
            .unwrap();
        let msg = out[0].get(0).unwrap();
        assert!(msg.is_errored());
    }

    #[test]
    fn invalid_mapping_fails_at_construction() {
        assert!(MappingProcessor::new("gibberish").is_err());
    }
}
