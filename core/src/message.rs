//! Message and batch types for virta
//!
//! The Message is the atom of data flow: an opaque payload plus a
//! string-keyed metadata map. It's format-agnostic and uses `Bytes` for
//! zero-copy payload handling.
//!
//! # Zero-Copy Design
//!
//! ```text
//! Input reads 10KB payload as Bytes
//!                     │
//!                     ▼
//! Message created with payload.clone()  ← Just increments refcount
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! Output A        Output B        Output C
//! (all share same underlying bytes - no copies!)
//! ```
//!
//! # Structured access
//!
//! Processors that address the payload as a document (`json("path")`
//! interpolations, mapping assignments) go through [`Message::structured`],
//! which parses once and caches the result. Mutating the payload invalidates
//! the cache.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Metadata storage - lazily allocated, None when empty.
pub type Metadata = Option<Box<HashMap<String, String>>>;

/// Helper to get metadata or empty map
#[inline]
fn metadata_ref(m: &Metadata) -> &HashMap<String, String> {
    static EMPTY: OnceLock<HashMap<String, String>> = OnceLock::new();
    m.as_ref()
        .map(|b| b.as_ref())
        .unwrap_or_else(|| EMPTY.get_or_init(HashMap::new))
}

/// The unit of data flow: an opaque payload plus metadata.
///
/// Messages are immutable by convention - processors that change a message
/// operate on their own copy of the batch, and `Bytes` makes those copies
/// cheap. A message can be flagged as *errored* with a cause; errored
/// messages keep flowing so that error-branch processors and `drop_on`
/// policies can observe them.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use virta_core::Message;
///
/// let msg = Message::new(Bytes::from(r#"{"id": 1}"#))
///     .with_metadata("origin", "orders");
/// assert_eq!(msg.metadata().get("origin"), Some(&"orders".to_string()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Opaque payload - zero-copy via Bytes.
    payload: Bytes,

    /// Headers and context, propagated through the pipeline.
    ///
    /// Lazily allocated - None when empty to keep messages small.
    metadata: Metadata,

    /// Cached parse of the payload as a JSON document.
    ///
    /// Shared between clones made before the first structured read.
    parsed: OnceLock<Arc<serde_json::Value>>,

    /// Failure flag with cause. Set by processors instead of failing the
    /// whole batch.
    error: Option<Arc<Error>>,
}

impl Message {
    /// Create a new message from a payload.
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            metadata: None,
            parsed: OnceLock::new(),
            error: None,
        }
    }

    /// Add a metadata entry, builder style.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(|| Box::new(HashMap::new()))
            .insert(key.into(), value.into());
        self
    }

    /// Get metadata reference (returns empty map if None).
    #[inline]
    pub fn metadata(&self) -> &HashMap<String, String> {
        metadata_ref(&self.metadata)
    }

    /// Get mutable metadata, allocating if needed.
    #[inline]
    pub fn metadata_mut(&mut self) -> &mut HashMap<String, String> {
        self.metadata
            .get_or_insert_with(|| Box::new(HashMap::new()))
    }

    /// The raw payload.
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as a string slice, if valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Replace the payload, invalidating the structured cache.
    pub fn set_payload(&mut self, payload: Bytes) {
        self.payload = payload;
        self.parsed = OnceLock::new();
    }

    /// Parse the payload as a JSON document, caching the result.
    ///
    /// Repeated structured reads of the same message (or its clones made
    /// before the first read) amortise to a single parse.
    pub fn structured(&self) -> Result<Arc<serde_json::Value>> {
        if let Some(v) = self.parsed.get() {
            return Ok(Arc::clone(v));
        }
        let parsed: serde_json::Value = serde_json::from_slice(&self.payload)?;
        let arc = Arc::new(parsed);
        // A concurrent clone may have raced us; either value parsed from the
        // same bytes, so returning ours is equivalent.
        let _ = self.parsed.set(Arc::clone(&arc));
        Ok(arc)
    }

    /// Replace the payload with a serialized document and prime the cache.
    pub fn set_structured(&mut self, value: serde_json::Value) -> Result<()> {
        self.payload = Bytes::from(serde_json::to_vec(&value)?);
        self.parsed = OnceLock::new();
        let _ = self.parsed.set(Arc::new(value));
        Ok(())
    }

    /// Flag the message as errored with a cause.
    pub fn set_error(&mut self, err: Error) {
        self.error = Some(Arc::new(err));
    }

    /// Clear the errored flag.
    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// The failure cause, if the message is errored.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_deref()
    }

    /// Whether the message has been flagged as errored.
    pub fn is_errored(&self) -> bool {
        self.error.is_some()
    }
}

impl From<Bytes> for Message {
    fn from(payload: Bytes) -> Self {
        Self::new(payload)
    }
}

impl From<&str> for Message {
    fn from(payload: &str) -> Self {
        Self::new(Bytes::copy_from_slice(payload.as_bytes()))
    }
}

/// An ordered sequence of messages that travel, succeed and fail as one
/// unit.
///
/// All acknowledgement and retry decisions happen at batch granularity.
/// Order within a batch is preserved by all pure transformations.
#[derive(Debug, Clone, Default)]
pub struct MessageBatch {
    messages: Vec<Message>,
}

impl MessageBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// Create a batch with room for `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Vec::with_capacity(capacity),
        }
    }

    /// Build a batch from raw payloads. Convenient in tests.
    pub fn from_payloads<I, B>(payloads: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            messages: payloads
                .into_iter()
                .map(|p| Message::new(p.into()))
                .collect(),
        }
    }

    /// Append a message.
    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total payload bytes across the batch.
    pub fn byte_size(&self) -> usize {
        self.messages.iter().map(|m| m.payload_len()).sum()
    }

    /// Message at `index`, if present.
    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    /// Iterate messages in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Iterate messages mutably, preserving order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Message> {
        self.messages.iter_mut()
    }

    /// Split into two batches by a predicate: (accepted, rejected).
    ///
    /// Relative order is preserved within both children.
    pub fn partition<F>(self, mut predicate: F) -> (MessageBatch, MessageBatch)
    where
        F: FnMut(&Message) -> bool,
    {
        let mut accepted = MessageBatch::new();
        let mut rejected = MessageBatch::new();
        for msg in self.messages {
            if predicate(&msg) {
                accepted.push(msg);
            } else {
                rejected.push(msg);
            }
        }
        (accepted, rejected)
    }

    /// Consume the batch into its messages.
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    /// Borrow the messages as a slice.
    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }
}

impl From<Vec<Message>> for MessageBatch {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

impl From<Message> for MessageBatch {
    fn from(msg: Message) -> Self {
        Self {
            messages: vec![msg],
        }
    }
}

impl IntoIterator for MessageBatch {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl<'a> IntoIterator for &'a MessageBatch {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

impl FromIterator<Message> for MessageBatch {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        Self {
            messages: iter.into_iter().collect(),
        }
    }
}
