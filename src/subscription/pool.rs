//! Bounded pool of reusable reply subscriptions
//!
//! - At most `size` resources exist, borrowed or idle
//! - Borrowing waits up to a short acquire timeout, then fails with
//!   `AcquireTimeout` instead of stalling the retry pipeline
//! - Slots allocate their subscription lazily on first borrow
//! - A stale resource is replaced in place, so the slot heals
//! - A lease dropped before its exchange was marked complete discards its
//!   resource, so replies still in flight never reach the next borrower

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::SubscriptionResource;
use crate::bus::BusClient;
use crate::types::{Result, TransportError};

struct PoolInner {
    idle: Mutex<Vec<SubscriptionResource>>,
}

/// Pool of reply subscriptions
pub struct SubscriptionPool {
    inner: Arc<PoolInner>,
    permits: Arc<Semaphore>,
    size: usize,
    acquire_timeout: Duration,
}

impl SubscriptionPool {
    pub fn new(size: usize, acquire_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(size)),
            }),
            permits: Arc::new(Semaphore::new(size)),
            size,
            acquire_timeout,
        }
    }

    /// Borrow a subscription, creating one if no idle resource exists
    pub async fn acquire(&self, bus: &dyn BusClient) -> Result<PooledSubscription> {
        let permit = match tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(TransportError::Internal("Subscription pool closed".into())),
            Err(_) => {
                return Err(TransportError::AcquireTimeout {
                    waited: self.acquire_timeout,
                })
            }
        };

        let idle = match self.inner.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };

        let resource = match idle {
            Some(resource) => resource,
            None => {
                let resource = SubscriptionResource::create(bus, None).await?;
                debug!("Pool slot subscribed to {}", resource.inbox);
                resource
            }
        };

        Ok(PooledSubscription {
            resource: Some(resource),
            completed: false,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Configured number of slots
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently borrowed
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Allocated resources waiting in the pool
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// A borrowed pool slot
///
/// On drop the resource goes back to the pool only if the lease was marked
/// complete; otherwise it is discarded and the slot allocates afresh.
pub struct PooledSubscription {
    resource: Option<SubscriptionResource>,
    completed: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSubscription {
    /// The slot's resource, replacing it first if it went stale
    pub async fn ensure_valid(&mut self, bus: &dyn BusClient) -> Result<&mut SubscriptionResource> {
        let stale = self.resource.as_ref().map_or(true, |r| !r.is_valid());
        if stale {
            debug!("Replacing stale pooled subscription");
            self.replace(bus).await?;
        }
        self.resource
            .as_mut()
            .ok_or_else(|| TransportError::Internal("Pool slot has no subscription".into()))
    }

    /// Unsubscribe the current resource and put a fresh one in its place
    ///
    /// On failure the slot is left empty and the next borrower allocates.
    pub async fn replace(&mut self, bus: &dyn BusClient) -> Result<()> {
        if let Some(old) = self.resource.take() {
            old.close().await;
        }
        let fresh = SubscriptionResource::create(bus, None).await?;
        self.resource = Some(fresh);
        Ok(())
    }

    /// The resource has no replies outstanding and may be reused
    pub fn mark_complete(&mut self) {
        self.completed = true;
    }

    /// Inbox of the current resource
    pub fn inbox(&self) -> Option<&str> {
        self.resource.as_ref().map(|r| r.inbox.as_str())
    }
}

impl Drop for PooledSubscription {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        if !self.completed {
            // Dropping the subscription unsubscribes it
            debug!(
                "Discarding pooled subscription {} after an unfinished exchange",
                resource.inbox
            );
            return;
        }
        match self.pool.idle.lock() {
            Ok(mut idle) => idle.push(resource),
            Err(_) => warn!("Subscription pool poisoned, dropping {}", resource.inbox),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeliveryModel, MemoryBus};

    #[tokio::test]
    async fn test_slots_allocate_lazily_and_are_reused() {
        let bus = MemoryBus::new(DeliveryModel::BlockingReceive);
        let pool = SubscriptionPool::new(2, Duration::from_millis(100));
        assert_eq!(bus.active_subscriptions(), 0);

        let mut first = pool.acquire(&bus).await.unwrap();
        let inbox = first.inbox().unwrap().to_string();
        assert_eq!(bus.active_subscriptions(), 1);
        first.mark_complete();
        drop(first);

        let again = pool.acquire(&bus).await.unwrap();
        assert_eq!(again.inbox(), Some(inbox.as_str()));
        assert_eq!(bus.active_subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_borrow_times_out() {
        let bus = MemoryBus::new(DeliveryModel::BlockingReceive);
        let pool = SubscriptionPool::new(1, Duration::from_millis(100));

        let _held = pool.acquire(&bus).await.unwrap();
        assert_eq!(pool.available(), 0);

        let err = pool.acquire(&bus).await.err().unwrap();
        assert!(matches!(err, TransportError::AcquireTimeout { .. }));
        assert_eq!(bus.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_stale_resource_is_healed_in_place() {
        let bus = MemoryBus::new(DeliveryModel::BlockingReceive);
        let pool = SubscriptionPool::new(1, Duration::from_millis(100));

        let stale_inbox = {
            let mut lease = pool.acquire(&bus).await.unwrap();
            lease.mark_complete();
            lease.inbox().unwrap().to_string()
        };
        bus.invalidate_subscriptions();

        let mut lease = pool.acquire(&bus).await.unwrap();
        let resource = lease.ensure_valid(&bus).await.unwrap();
        assert!(resource.is_valid());
        assert_ne!(resource.inbox, stale_inbox);
        lease.mark_complete();
        drop(lease);

        assert_eq!(pool.idle(), 1);
        assert_eq!(bus.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_unfinished_lease_discards_resource() {
        let bus = MemoryBus::new(DeliveryModel::BlockingReceive);
        let pool = SubscriptionPool::new(1, Duration::from_millis(100));

        let abandoned_inbox = {
            let lease = pool.acquire(&bus).await.unwrap();
            lease.inbox().unwrap().to_string()
        };
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.available(), 1);
        assert_eq!(bus.active_subscriptions(), 0);

        let lease = pool.acquire(&bus).await.unwrap();
        assert_ne!(lease.inbox(), Some(abandoned_inbox.as_str()));
    }
}
