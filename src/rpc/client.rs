//! RPC client transport
//!
//! Turns a `service#method` call into a publish on the method's subject,
//! runs the ACK/RESPONSE exchange under the retry policy, and hands back
//! the raw response payload.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::exchange::ExchangeHandler;
use super::messages::RequestOptions;
use super::retry::RetryPolicy;
use super::subject::SubjectKeyCache;
use crate::bus::{BusClient, DeliveryModel};
use crate::config::{ClientConfig, ReceiveStrategy};
use crate::types::Result;

/// Client side of the RPC transport
///
/// Safe to share between tasks; each call keeps its state for its own
/// duration only.
pub struct NatsRpcClient<B: BusClient> {
    bus: Arc<B>,
    config: ClientConfig,
    exchange: ExchangeHandler,
    retry: RetryPolicy,
    subjects: Arc<SubjectKeyCache>,
}

impl<B: BusClient> NatsRpcClient<B> {
    /// Create a client over `bus`
    ///
    /// The receive strategy is fixed here: the configured override if any,
    /// otherwise what suits the bus client's delivery model.
    pub fn new(bus: B, config: ClientConfig) -> Result<Self> {
        Self::from_arc(Arc::new(bus), config)
    }

    pub fn from_arc(bus: Arc<B>, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let strategy = config
            .receive_strategy
            .unwrap_or_else(|| match bus.delivery_model() {
                DeliveryModel::BlockingReceive => ReceiveStrategy::Direct,
                DeliveryModel::PushQueue => ReceiveStrategy::Shared,
            });
        info!(
            "RPC client using {:?} receive strategy (pool size {})",
            strategy, config.subscription_pool_size
        );

        let shared_bus: Arc<dyn BusClient> = bus.clone();
        Ok(Self {
            exchange: ExchangeHandler::new(shared_bus, strategy, &config),
            retry: RetryPolicy::from_config(&config),
            subjects: SubjectKeyCache::global(),
            bus,
            config,
        })
    }

    /// Use a private subject cache instead of the process-wide one
    pub fn with_subject_cache(mut self, subjects: Arc<SubjectKeyCache>) -> Self {
        self.subjects = subjects;
        self
    }

    /// Call `service#method` with the client-wide timeouts
    pub async fn send_request(&self, service: &str, method: &str, payload: Bytes) -> Result<Bytes> {
        let options = RequestOptions::new(service, method, &self.config);
        self.send_request_with(payload, &options).await
    }

    /// Call with explicit per-request options
    pub async fn send_request_with(&self, payload: Bytes, options: &RequestOptions) -> Result<Bytes> {
        self.bus.connect().await?;

        if let Some(available) = self.exchange.available_subscriptions() {
            debug!("Subscription pool: {} available", available);
        }

        let subject = self.subjects.subject_for(
            &self.config.subject_prefix,
            &options.service_name,
            &options.method_name,
        );
        let label = options.service_and_method();
        let exchange = &self.exchange;
        let subject_ref: &str = &subject;

        let started = Instant::now();
        let result = self
            .retry
            .run(&label, move || {
                exchange.exchange(subject_ref, payload.clone(), options)
            })
            .await;

        debug!(
            "{} on {} finished in {:?} (ok: {})",
            label,
            subject,
            started.elapsed(),
            result.is_ok()
        );
        result
    }

    pub fn strategy(&self) -> ReceiveStrategy {
        self.exchange.strategy()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    /// Free pooled subscriptions, `None` when pooling is not in use
    pub fn available_subscriptions(&self) -> Option<usize> {
        self.exchange.available_subscriptions()
    }

    /// In-flight multiplexed requests, `None` before the multiplexer starts
    pub fn pending_requests(&self) -> Option<usize> {
        self.exchange.pending_requests()
    }

    /// No-op: the bus connection is kept for the life of the process
    pub fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, ScriptedReply};

    #[tokio::test]
    async fn test_strategy_follows_delivery_model() {
        let direct = NatsRpcClient::new(
            MemoryBus::new(DeliveryModel::BlockingReceive),
            ClientConfig::default(),
        )
        .unwrap();
        assert_eq!(direct.strategy(), ReceiveStrategy::Direct);

        let shared = NatsRpcClient::new(
            MemoryBus::new(DeliveryModel::PushQueue),
            ClientConfig::default(),
        )
        .unwrap();
        assert_eq!(shared.strategy(), ReceiveStrategy::Shared);
    }

    #[tokio::test]
    async fn test_strategy_override_wins() {
        let config = ClientConfig {
            receive_strategy: Some(ReceiveStrategy::Direct),
            ..Default::default()
        };
        let client =
            NatsRpcClient::new(MemoryBus::new(DeliveryModel::PushQueue), config).unwrap();
        assert_eq!(client.strategy(), ReceiveStrategy::Direct);
    }

    #[tokio::test]
    async fn test_request_published_on_method_subject() {
        let bus = MemoryBus::new(DeliveryModel::BlockingReceive);
        bus.respond_with(|_| vec![ScriptedReply::ack(), ScriptedReply::payload("done")]);
        let config = ClientConfig {
            subject_prefix: "test".into(),
            ..Default::default()
        };
        let client = NatsRpcClient::new(bus.clone(), config)
            .unwrap()
            .with_subject_cache(Arc::new(SubjectKeyCache::new()));

        let response = client
            .send_request("Warehouse::ShipmentService", "create", Bytes::from_static(b"req"))
            .await
            .unwrap();

        assert_eq!(response, Bytes::from_static(b"done"));
        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "test.rpc.warehouse.shipment_service.create");
        assert_eq!(&published[0].payload[..], b"req");
        assert_eq!(bus.connect_count(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(NatsRpcClient::new(MemoryBus::new(DeliveryModel::PushQueue), config).is_err());
    }
}
