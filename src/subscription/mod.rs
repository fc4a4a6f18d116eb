//! Reply subscriptions for the direct-receive strategy
//!
//! A [`SubscriptionResource`] pairs a bus subscription with the inbox it
//! listens on. Resources are either borrowed from a [`SubscriptionPool`] or
//! created per request and torn down afterwards.

pub mod pool;

use tracing::warn;

use crate::bus::{BusClient, Subscription};
use crate::types::Result;

pub use pool::{PooledSubscription, SubscriptionPool};

/// Replies expected per exchange: the ACK and the response
pub const REPLIES_PER_REQUEST: u64 = 2;

/// A subscription and the inbox subject it listens on
pub struct SubscriptionResource {
    pub subscription: Box<dyn Subscription>,
    pub inbox: String,
}

impl SubscriptionResource {
    /// Subscribe to a fresh inbox
    pub async fn create(bus: &dyn BusClient, max_messages: Option<u64>) -> Result<Self> {
        let inbox = bus.new_inbox();
        let subscription = bus.subscribe(&inbox, max_messages).await?;
        Ok(Self {
            subscription,
            inbox,
        })
    }

    /// Subscription for a single exchange, retired after both replies
    pub async fn ephemeral(bus: &dyn BusClient) -> Result<Self> {
        Self::create(bus, Some(REPLIES_PER_REQUEST)).await
    }

    pub fn is_valid(&self) -> bool {
        self.subscription.is_valid()
    }

    /// Unsubscribe, logging rather than failing: the resource is being discarded
    pub async fn close(mut self) {
        if let Err(e) = self.subscription.unsubscribe().await {
            warn!("Failed to unsubscribe from {}: {}", self.inbox, e);
        }
    }
}
