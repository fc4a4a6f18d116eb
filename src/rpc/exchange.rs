//! ACK-then-RESPONSE exchange
//!
//! Every request expects two replies on its reply subject: the ACK sentinel
//! and the encoded response, in either order. A NACK in place of the first
//! reply rejects the request.
//!
//! The exchange runs against a [`ReplyChannel`], so the protocol is the same
//! whether replies come from a pooled or per-request subscription (direct
//! receive) or from the request multiplexer (shared receive).

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::messages::{is_ack, is_nack, RequestOptions};
use crate::bus::{BusClient, BusMessage};
use crate::config::{ClientConfig, ReceiveStrategy};
use crate::muxer::MuxerSlot;
use crate::subscription::{SubscriptionPool, SubscriptionResource};
use crate::types::{Result, TransportError};

/// Result of one exchange attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The non-ACK reply, ready for decoding
    Response(Bytes),
    /// Nothing arrived in time, or no reply was the ACK sentinel
    AckTimeout,
    /// The server rejected the request
    Nack,
}

/// Where an exchange reads its replies from
#[async_trait]
pub trait ReplyChannel: Send {
    /// Subject the server should reply to
    fn reply_to(&self) -> &str;

    /// Next reply, `Ok(None)` if none arrived within `timeout`
    async fn next_reply(&mut self, timeout: Duration) -> Result<Option<BusMessage>>;
}

#[async_trait]
impl ReplyChannel for SubscriptionResource {
    fn reply_to(&self) -> &str {
        &self.inbox
    }

    async fn next_reply(&mut self, timeout: Duration) -> Result<Option<BusMessage>> {
        self.subscription.next_message(timeout).await
    }
}

/// Publish `payload` and run the two-reply exchange on `channel`
pub async fn request_with_two_responses<C>(
    bus: &dyn BusClient,
    subject: &str,
    payload: Bytes,
    channel: &mut C,
    options: &RequestOptions,
) -> Result<ExchangeOutcome>
where
    C: ReplyChannel + ?Sized,
{
    bus.publish(subject, payload, channel.reply_to()).await?;

    let Some(first) = channel.next_reply(options.ack_timeout).await? else {
        return Ok(ExchangeOutcome::AckTimeout);
    };

    if is_nack(&first.payload) {
        return Ok(ExchangeOutcome::Nack);
    }

    let second = channel
        .next_reply(options.response_timeout)
        .await?
        .map(|m| m.payload);

    classify(first.payload, second, options)
}

/// Decide the outcome from the two replies
///
/// Whichever reply is the ACK sentinel is the acknowledgement and the other
/// is the response. If neither is the ACK the exchange counts as an
/// ack-timeout. A missing, empty or duplicate-ACK response is a
/// `ResponseTimeout`.
pub fn classify(
    first: Bytes,
    second: Option<Bytes>,
    options: &RequestOptions,
) -> Result<ExchangeOutcome> {
    let response = if is_ack(&first) {
        second
    } else if second.as_deref().is_some_and(is_ack) {
        Some(first)
    } else {
        return Ok(ExchangeOutcome::AckTimeout);
    };

    match response {
        Some(payload) if !payload.is_empty() && !is_ack(&payload) => {
            Ok(ExchangeOutcome::Response(payload))
        }
        _ => Err(TransportError::ResponseTimeout(options.service_and_method())),
    }
}

enum ReplyReceiver {
    /// One subscription per request: pooled when a pool is configured
    Direct { pool: Option<SubscriptionPool> },
    /// Multiplexer started on first use, restarted if its subscription closes
    Shared { muxer: MuxerSlot },
}

/// Runs exchanges with the receive strategy chosen at construction
pub struct ExchangeHandler {
    bus: Arc<dyn BusClient>,
    receiver: ReplyReceiver,
}

impl ExchangeHandler {
    pub fn new(bus: Arc<dyn BusClient>, strategy: ReceiveStrategy, config: &ClientConfig) -> Self {
        let receiver = match strategy {
            ReceiveStrategy::Direct => ReplyReceiver::Direct {
                pool: config.uses_subscription_pool().then(|| {
                    SubscriptionPool::new(
                        config.subscription_pool_size,
                        config.subscription_acquire_timeout,
                    )
                }),
            },
            ReceiveStrategy::Shared => {
                if config.uses_subscription_pool() {
                    info!("Subscription pool size ignored: replies are multiplexed");
                }
                ReplyReceiver::Shared {
                    muxer: MuxerSlot::new(),
                }
            }
        };
        Self { bus, receiver }
    }

    pub fn strategy(&self) -> ReceiveStrategy {
        match self.receiver {
            ReplyReceiver::Direct { .. } => ReceiveStrategy::Direct,
            ReplyReceiver::Shared { .. } => ReceiveStrategy::Shared,
        }
    }

    /// Free pool slots, `None` when pooling is not in use
    pub fn available_subscriptions(&self) -> Option<usize> {
        match &self.receiver {
            ReplyReceiver::Direct { pool: Some(pool) } => Some(pool.available()),
            _ => None,
        }
    }

    /// Requests registered with the multiplexer, `None` while none is running
    pub fn pending_requests(&self) -> Option<usize> {
        match &self.receiver {
            ReplyReceiver::Shared { muxer } => muxer.current().map(|m| m.pending_count()),
            _ => None,
        }
    }

    /// One exchange attempt; every subscription it uses is released or torn
    /// down before it returns
    pub async fn exchange(
        &self,
        subject: &str,
        payload: Bytes,
        options: &RequestOptions,
    ) -> Result<ExchangeOutcome> {
        match &self.receiver {
            ReplyReceiver::Direct { pool: Some(pool) } => {
                self.exchange_pooled(pool, subject, payload, options).await
            }
            ReplyReceiver::Direct { pool: None } => {
                self.exchange_ephemeral(subject, payload, options).await
            }
            ReplyReceiver::Shared { muxer } => {
                self.exchange_shared(muxer, subject, payload, options).await
            }
        }
    }

    async fn exchange_pooled(
        &self,
        pool: &SubscriptionPool,
        subject: &str,
        payload: Bytes,
        options: &RequestOptions,
    ) -> Result<ExchangeOutcome> {
        let bus = &*self.bus;
        let mut lease = pool.acquire(bus).await?;

        let outcome = match lease.ensure_valid(bus).await {
            Ok(resource) => {
                request_with_two_responses(bus, subject, payload, resource, options).await
            }
            Err(e) => Err(e),
        };

        // Late replies to an unfinished exchange must not reach the next borrower.
        // If this future is dropped before here, the lease discards the resource.
        if matches!(outcome, Ok(ExchangeOutcome::Response(_))) {
            lease.mark_complete();
        } else {
            match lease.replace(bus).await {
                Ok(()) => lease.mark_complete(),
                Err(e) => warn!("Could not renew pooled subscription: {}", e),
            }
        }

        outcome
    }

    async fn exchange_ephemeral(
        &self,
        subject: &str,
        payload: Bytes,
        options: &RequestOptions,
    ) -> Result<ExchangeOutcome> {
        let bus = &*self.bus;
        let mut resource = SubscriptionResource::ephemeral(bus).await?;
        let outcome = request_with_two_responses(bus, subject, payload, &mut resource, options).await;
        resource.close().await;
        outcome
    }

    async fn exchange_shared(
        &self,
        muxer: &MuxerSlot,
        subject: &str,
        payload: Bytes,
        options: &RequestOptions,
    ) -> Result<ExchangeOutcome> {
        let bus = &*self.bus;
        let muxer = muxer.get_or_start(bus).await?;

        let mut pending = muxer.register();
        debug!("Request {} registered as {}", options.service_and_method(), pending.token());
        request_with_two_responses(bus, subject, payload, &mut pending, options).await
    }
}
