//! NATS bus client
//!
//! Wraps `async-nats` with lazy connection management and maps its
//! failures onto bus I/O errors.

use async_nats::connection::State;
use async_nats::{Client, ConnectOptions, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BusClient, BusMessage, DeliveryModel, Subscription};
use crate::config::NatsArgs;
use crate::types::{Result, TransportError};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Timeout for establishing the initial connection
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// NATS-backed bus client
///
/// The connection is established on the first call to [`BusClient::connect`]
/// and kept for the life of the process.
pub struct NatsBus {
    args: NatsArgs,
    name: String,
    client: OnceCell<Client>,
}

impl NatsBus {
    /// Create a bus client; no connection is made until `connect`
    pub fn new(args: NatsArgs, name: &str) -> Self {
        Self {
            args,
            name: name.to_string(),
            client: OnceCell::new(),
        }
    }

    /// Get the client name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .get()
            .ok_or_else(|| TransportError::BusIo("Not connected to NATS".into()))
    }

    async fn open(&self) -> Result<Client> {
        info!("Connecting to NATS at {}", self.args.nats_url);

        let mut options = ConnectOptions::new()
            .name(&self.name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(CONNECTION_TIMEOUT);

        if let (Some(user), Some(pass)) = (&self.args.nats_user, &self.args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&self.args.nats_url)
            .await
            .map_err(|e| TransportError::BusIo(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", self.args.nats_url);
        Ok(client)
    }
}

#[async_trait]
impl BusClient for NatsBus {
    async fn connect(&self) -> Result<()> {
        self.client.get_or_try_init(|| self.open()).await?;
        Ok(())
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", Uuid::new_v4().simple())
    }

    async fn publish(&self, subject: &str, payload: Bytes, reply_to: &str) -> Result<()> {
        self.client()?
            .publish_with_reply(subject.to_string(), reply_to.to_string(), payload)
            .await
            .map_err(|e| TransportError::BusIo(format!("Publish failed: {}", e)))
    }

    async fn subscribe(
        &self,
        subject: &str,
        max_messages: Option<u64>,
    ) -> Result<Box<dyn Subscription>> {
        let client = self.client()?;
        let mut subscriber = client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TransportError::BusIo(format!("Subscribe failed: {}", e)))?;

        if let Some(max) = max_messages {
            subscriber
                .unsubscribe_after(max)
                .await
                .map_err(|e| TransportError::BusIo(format!("Unsubscribe-after failed: {}", e)))?;
        }

        debug!("Subscribed to {}", subject);
        Ok(Box::new(NatsSubscription {
            subject: subject.to_string(),
            subscriber,
            client: client.clone(),
            closed: false,
        }))
    }

    fn delivery_model(&self) -> DeliveryModel {
        // async-nats pushes every subscription's messages onto a channel
        DeliveryModel::PushQueue
    }
}

/// Subscription on a NATS connection
pub struct NatsSubscription {
    subject: String,
    subscriber: Subscriber,
    client: Client,
    closed: bool,
}

#[async_trait]
impl Subscription for NatsSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    /// Any state other than connected counts as stale, including the
    /// pending state of a reconnect that async-nats would recover from on
    /// its own; a pooled slot is then renewed once more than needed.
    fn is_valid(&self) -> bool {
        !self.closed && self.client.connection_state() == State::Connected
    }

    async fn next(&mut self) -> Option<BusMessage> {
        let message = self.subscriber.next().await;
        if message.is_none() {
            self.closed = true;
        }
        message.map(|m| BusMessage {
            subject: m.subject.to_string(),
            payload: m.payload,
        })
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.subscriber
            .unsubscribe()
            .await
            .map_err(|e| TransportError::BusIo(format!("Unsubscribe failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> NatsArgs {
        NatsArgs {
            nats_url: "nats://127.0.0.1:4222".into(),
            nats_user: None,
            nats_password: None,
        }
    }

    #[test]
    fn test_inboxes_are_unique_single_token_suffixes() {
        let bus = NatsBus::new(args(), "test");
        let a = bus.new_inbox();
        let b = bus.new_inbox();
        assert_ne!(a, b);
        assert!(a.starts_with("_INBOX."));
        assert_eq!(a.split('.').count(), 2);
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_bus_io() {
        let bus = NatsBus::new(args(), "test");
        let err = bus
            .publish("rpc.svc.call", Bytes::from_static(b"x"), "_INBOX.reply")
            .await
            .unwrap_err();
        assert!(err.is_retryable_io());
    }

    // Exchanges against a live server are covered by running the `nats-rpc`
    // binary against a local nats-server.
}
