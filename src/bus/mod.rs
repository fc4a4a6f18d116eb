//! Message bus abstraction
//!
//! The transport only needs a handful of operations from the underlying
//! pub/sub client: connect, publish with a reply subject, subscribe, and
//! receive. Two implementations are provided:
//! - **NATS**: `async-nats` backed client for real deployments
//! - **Memory**: in-process bus with scriptable replies, for tests and demos

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::types::Result;

pub use memory::{MemoryBus, PublishedRequest, ScriptedReply};
pub use nats::NatsBus;

/// A message delivered on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Subject the message was published to
    pub subject: String,
    /// Raw payload
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}

/// How a bus client hands inbound messages to its subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryModel {
    /// Cheap blocking receive per subscription; one subscription per request is fine
    BlockingReceive,
    /// Messages are pushed onto a per-subscription queue by the client
    PushQueue,
}

/// A listening point on the bus
#[async_trait]
pub trait Subscription: Send {
    /// Subject (possibly a wildcard) this subscription listens on
    fn subject(&self) -> &str;

    /// False once the subscription has been torn down or gone stale
    fn is_valid(&self) -> bool;

    /// Next pushed message, `None` once the subscription is closed
    async fn next(&mut self) -> Option<BusMessage>;

    /// Blocking receive bounded by `timeout`; `Ok(None)` when nothing arrived
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<BusMessage>> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(message) => Ok(message),
            Err(_) => Ok(None),
        }
    }

    /// Stop receiving on this subscription
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// The pub/sub client the transport is built on
#[async_trait]
pub trait BusClient: Send + Sync + 'static {
    /// Establish the connection; calling it again once connected is a no-op
    async fn connect(&self) -> Result<()>;

    /// Generate a unique reply subject
    fn new_inbox(&self) -> String;

    /// Publish `payload` on `subject` asking for replies on `reply_to`
    async fn publish(&self, subject: &str, payload: Bytes, reply_to: &str) -> Result<()>;

    /// Subscribe to `subject`, optionally unsubscribing after `max_messages`
    async fn subscribe(
        &self,
        subject: &str,
        max_messages: Option<u64>,
    ) -> Result<Box<dyn Subscription>>;

    /// Delivery model of this client, used to pick the receive strategy
    fn delivery_model(&self) -> DeliveryModel;
}

/// Whether `subject` is matched by `pattern`
///
/// Supports exact matches and `*` tokens, each matching exactly one token.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some("*"), Some(token)) if !token.is_empty() => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_subject_match() {
        assert!(subject_matches("_INBOX.abc", "_INBOX.abc"));
        assert!(!subject_matches("_INBOX.abc", "_INBOX.abd"));
    }

    #[test]
    fn test_wildcard_matches_single_token() {
        assert!(subject_matches("_INBOX.mux.*", "_INBOX.mux.token1"));
        assert!(!subject_matches("_INBOX.mux.*", "_INBOX.mux"));
        assert!(!subject_matches("_INBOX.mux.*", "_INBOX.mux.a.b"));
        assert!(!subject_matches("_INBOX.mux.*", "_INBOX.other.token1"));
    }
}
