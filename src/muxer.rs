//! Request multiplexer for the shared-receive strategy
//!
//! One wildcard subscription on `<prefix>.*` carries the replies of every
//! in-flight request. Each request registers a token and publishes with
//! reply subject `<prefix>.<token>`; a dispatcher task routes each inbound
//! message to the waiting request by the subject's last token.
//!
//! A registration is removed when its [`PendingReply`] is dropped, on every
//! exit path. Messages for unknown or already-removed tokens are dropped.
//!
//! If the wildcard subscription closes, the dispatcher marks the
//! multiplexer closed and wakes every waiting request; [`MuxerSlot`] then
//! starts a replacement on the next request.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusClient, BusMessage, Subscription};
use crate::rpc::exchange::ReplyChannel;
use crate::subscription::REPLIES_PER_REQUEST;
use crate::types::Result;

type PendingMap = DashMap<String, mpsc::Sender<BusMessage>>;

/// Shared reply subscription with token-keyed dispatch
pub struct RequestMultiplexer {
    prefix: String,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    dispatcher: JoinHandle<()>,
}

impl RequestMultiplexer {
    /// Subscribe to `<inbox>.*` and start the dispatcher task
    pub async fn start(bus: &dyn BusClient) -> Result<Self> {
        let prefix = bus.new_inbox();
        let subscription = bus.subscribe(&format!("{}.*", prefix), None).await?;
        let pending = Arc::new(PendingMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let dispatcher = tokio::spawn(dispatch(
            subscription,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        info!("Request multiplexer listening on {}.*", prefix);
        Ok(Self {
            prefix,
            pending,
            closed,
            dispatcher,
        })
    }

    /// Register a new request and get the handle to wait on
    pub fn register(&self) -> PendingReply {
        let token = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(REPLIES_PER_REQUEST as usize);
        self.pending.insert(token.clone(), tx);

        PendingReply {
            reply_to: format!("{}.{}", self.prefix, token),
            token,
            rx,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Reply subject prefix shared by all requests
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Requests currently registered
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the shared subscription has stopped delivering
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for RequestMultiplexer {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(
    mut subscription: Box<dyn Subscription>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
) {
    while let Some(message) = subscription.next().await {
        let sender = message
            .subject
            .rsplit('.')
            .next()
            .and_then(|token| pending.get(token).map(|entry| entry.value().clone()));

        match sender {
            Some(tx) => {
                if let Err(e) = tx.try_send(message) {
                    debug!("Dropping extra reply: {}", e);
                }
            }
            None => debug!("Dropping reply for unknown token on {}", message.subject),
        }
    }
    warn!(
        "Request multiplexer subscription on {} closed",
        subscription.subject()
    );
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders ends every wait at once
    pending.clear();
}

/// Holds the client's multiplexer, started on first use and restarted
/// after its subscription closes
#[derive(Default)]
pub struct MuxerSlot {
    current: RwLock<Option<Arc<RequestMultiplexer>>>,
    starting: Mutex<()>,
}

impl MuxerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The running multiplexer, if any
    pub fn current(&self) -> Option<Arc<RequestMultiplexer>> {
        let current = match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        current.filter(|muxer| !muxer.is_closed())
    }

    /// The running multiplexer, starting one if there is none or it closed
    pub async fn get_or_start(&self, bus: &dyn BusClient) -> Result<Arc<RequestMultiplexer>> {
        if let Some(muxer) = self.current() {
            return Ok(muxer);
        }

        let _starting = self.starting.lock().await;
        if let Some(muxer) = self.current() {
            return Ok(muxer);
        }

        let muxer = Arc::new(RequestMultiplexer::start(bus).await?);
        let previous = match self.current.write() {
            Ok(mut guard) => guard.replace(Arc::clone(&muxer)),
            Err(poisoned) => poisoned.into_inner().replace(Arc::clone(&muxer)),
        };
        if previous.is_some() {
            warn!("Request multiplexer restarted on {}.*", muxer.prefix());
        }
        Ok(muxer)
    }
}

/// An in-flight request registered with the multiplexer
pub struct PendingReply {
    token: String,
    reply_to: String,
    rx: mpsc::Receiver<BusMessage>,
    pending: Arc<PendingMap>,
}

impl PendingReply {
    pub fn token(&self) -> &str {
        &self.token
    }
}

#[async_trait]
impl ReplyChannel for PendingReply {
    fn reply_to(&self) -> &str {
        &self.reply_to
    }

    async fn next_reply(&mut self, timeout: Duration) -> Result<Option<BusMessage>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(message) => Ok(message),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.pending.remove(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeliveryModel, MemoryBus};

    #[tokio::test]
    async fn test_replies_route_by_token() {
        let bus = MemoryBus::new(DeliveryModel::PushQueue);
        let muxer = RequestMultiplexer::start(&bus).await.unwrap();

        let mut a = muxer.register();
        let mut b = muxer.register();
        assert_eq!(muxer.pending_count(), 2);

        bus.inject(b.reply_to(), "for-b");
        bus.inject(a.reply_to(), "for-a");

        let got_a = a.next_reply(Duration::from_secs(1)).await.unwrap().unwrap();
        let got_b = b.next_reply(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(&got_a.payload[..], b"for-a");
        assert_eq!(&got_b.payload[..], b"for-b");
    }

    #[tokio::test]
    async fn test_drop_removes_registration() {
        let bus = MemoryBus::new(DeliveryModel::PushQueue);
        let muxer = RequestMultiplexer::start(&bus).await.unwrap();

        let reply = muxer.register();
        let stale_subject = reply.reply_to().to_string();
        drop(reply);
        assert_eq!(muxer.pending_count(), 0);

        // A late reply for the removed token reaches the dispatcher and is dropped
        let mut fresh = muxer.register();
        bus.inject(&stale_subject, "late");
        let got = fresh.next_reply(Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_buffers_both_replies_in_arrival_order() {
        let bus = MemoryBus::new(DeliveryModel::PushQueue);
        let muxer = RequestMultiplexer::start(&bus).await.unwrap();
        let mut reply = muxer.register();

        bus.inject(reply.reply_to(), "first");
        bus.inject(reply.reply_to(), "second");

        let first = reply.next_reply(Duration::from_secs(1)).await.unwrap().unwrap();
        let second = reply.next_reply(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"first");
        assert_eq!(&second.payload[..], b"second");
    }

    #[tokio::test]
    async fn test_closed_subscription_wakes_waiters() {
        let bus = MemoryBus::new(DeliveryModel::PushQueue);
        let muxer = RequestMultiplexer::start(&bus).await.unwrap();
        let mut reply = muxer.register();

        bus.close_subscriptions();
        let got = reply.next_reply(Duration::from_secs(5)).await.unwrap();

        assert!(got.is_none());
        assert!(muxer.is_closed());
        assert_eq!(muxer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_slot_restarts_closed_muxer() {
        let bus = MemoryBus::new(DeliveryModel::PushQueue);
        let slot = MuxerSlot::new();
        assert!(slot.current().is_none());

        let first = slot.get_or_start(&bus).await.unwrap();
        let again = slot.get_or_start(&bus).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        bus.close_subscriptions();
        while !first.is_closed() {
            tokio::task::yield_now().await;
        }
        assert!(slot.current().is_none());

        let restarted = slot.get_or_start(&bus).await.unwrap();
        assert_ne!(restarted.prefix(), first.prefix());
        assert_eq!(bus.active_subscriptions(), 1);
    }
}
