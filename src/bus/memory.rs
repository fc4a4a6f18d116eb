//! In-process message bus
//!
//! Routes published messages to local subscriptions without a server.
//! A responder closure plays the part of the RPC server: for every
//! published request it returns the replies to deliver, each after its
//! own delay. Used by the test suite and for local demos.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::{subject_matches, BusClient, BusMessage, DeliveryModel, Subscription};
use crate::rpc::messages::{ACK, NACK};
use crate::types::{Result, TransportError};

/// A request as seen by the memory bus
#[derive(Debug, Clone)]
pub struct PublishedRequest {
    pub subject: String,
    pub reply_to: String,
    pub payload: Bytes,
}

/// A reply the responder wants delivered on the request's reply subject
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub delay: Duration,
    pub payload: Bytes,
}

impl ScriptedReply {
    pub fn ack() -> Self {
        Self::payload(Bytes::from_static(ACK))
    }

    pub fn nack() -> Self {
        Self::payload(Bytes::from_static(NACK))
    }

    pub fn payload(payload: impl Into<Bytes>) -> Self {
        Self {
            delay: Duration::ZERO,
            payload: payload.into(),
        }
    }

    /// Deliver this reply `delay` after the request was published
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = Arc<dyn Fn(&PublishedRequest) -> Vec<ScriptedReply> + Send + Sync>;

struct SubscriptionEntry {
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
    remaining: Option<u64>,
    valid: Arc<AtomicBool>,
}

struct Inner {
    delivery_model: DeliveryModel,
    subscriptions: Mutex<HashMap<u64, SubscriptionEntry>>,
    next_id: AtomicU64,
    responder: Mutex<Option<Responder>>,
    published: Mutex<Vec<PublishedRequest>>,
    failing_publishes: AtomicUsize,
    connects: AtomicUsize,
}

impl Inner {
    fn deliver(&self, message: BusMessage) -> usize {
        let mut subscriptions = match self.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut delivered = 0;
        let mut exhausted = Vec::new();
        for (id, entry) in subscriptions.iter_mut() {
            if !subject_matches(&entry.pattern, &message.subject) {
                continue;
            }
            if entry.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
            if let Some(remaining) = entry.remaining.as_mut() {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    exhausted.push(*id);
                }
            }
        }

        // Max reached: the subscription stops receiving but its buffered
        // messages stay readable.
        for id in exhausted {
            if let Some(entry) = subscriptions.remove(&id) {
                entry.valid.store(false, Ordering::SeqCst);
            }
        }

        if delivered == 0 {
            debug!("No subscriber for {}", message.subject);
        }
        delivered
    }

    fn remove(&self, id: u64) {
        let mut subscriptions = match self.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = subscriptions.remove(&id) {
            entry.valid.store(false, Ordering::SeqCst);
        }
    }
}

/// In-process bus with scriptable replies
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    /// Create a bus advertising the given delivery model
    pub fn new(delivery_model: DeliveryModel) -> Self {
        Self {
            inner: Arc::new(Inner {
                delivery_model,
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                responder: Mutex::new(None),
                published: Mutex::new(Vec::new()),
                failing_publishes: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Install the server-side behaviour: replies to send for each request
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&PublishedRequest) -> Vec<ScriptedReply> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.responder.lock() {
            *slot = Some(Arc::new(responder));
        }
    }

    /// Make the next `count` publishes fail with a bus I/O error
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Mark every live subscription stale, as a reconnect would
    pub fn invalidate_subscriptions(&self) {
        if let Ok(subscriptions) = self.inner.subscriptions.lock() {
            for entry in subscriptions.values() {
                entry.valid.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Close every live subscription from the bus side, as a server would
    ///
    /// Buffered messages stay readable; then each subscription ends.
    pub fn close_subscriptions(&self) {
        let mut subscriptions = match self.inner.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let closed: Vec<SubscriptionEntry> =
            subscriptions.drain().map(|(_, entry)| entry).collect();
        drop(subscriptions);

        for entry in closed {
            entry.valid.store(false, Ordering::SeqCst);
        }
    }

    /// Deliver a message directly, bypassing the responder
    pub fn inject(&self, subject: &str, payload: impl Into<Bytes>) -> usize {
        self.inner.deliver(BusMessage::new(subject, payload))
    }

    /// Requests published so far
    pub fn published(&self) -> Vec<PublishedRequest> {
        self.inner
            .published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Number of requests published so far
    pub fn publish_count(&self) -> usize {
        self.inner.published.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Subscriptions still registered on the bus
    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Number of times `connect` was called
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusClient for MemoryBus {
    async fn connect(&self) -> Result<()> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
    }

    async fn publish(&self, subject: &str, payload: Bytes, reply_to: &str) -> Result<()> {
        let should_fail = self
            .inner
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TransportError::BusIo("Connection reset".into()));
        }

        let request = PublishedRequest {
            subject: subject.to_string(),
            reply_to: reply_to.to_string(),
            payload,
        };
        if let Ok(mut published) = self.inner.published.lock() {
            published.push(request.clone());
        }

        let responder = self.inner.responder.lock().ok().and_then(|r| r.clone());
        let Some(responder) = responder else {
            return Ok(());
        };

        for reply in responder(&request) {
            let inner = Arc::clone(&self.inner);
            let reply_to = request.reply_to.clone();
            tokio::spawn(async move {
                if !reply.delay.is_zero() {
                    tokio::time::sleep(reply.delay).await;
                }
                inner.deliver(BusMessage::new(reply_to, reply.payload));
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        max_messages: Option<u64>,
    ) -> Result<Box<dyn Subscription>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let valid = Arc::new(AtomicBool::new(true));

        self.inner
            .subscriptions
            .lock()
            .map_err(|_| TransportError::Internal("Subscription table poisoned".into()))?
            .insert(
                id,
                SubscriptionEntry {
                    pattern: subject.to_string(),
                    tx,
                    remaining: max_messages,
                    valid: Arc::clone(&valid),
                },
            );

        Ok(Box::new(MemorySubscription {
            id,
            subject: subject.to_string(),
            rx,
            valid,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn delivery_model(&self) -> DeliveryModel {
        self.inner.delivery_model
    }
}

/// Subscription on a [`MemoryBus`]
pub struct MemorySubscription {
    id: u64,
    subject: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    valid: Arc<AtomicBool>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.inner.remove(self.id);
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.inner.remove(self.id);
    }
}
