//! NATS RPC client transport
//!
//! Carries request/response RPC over a publish/subscribe bus. A call is
//! published on a subject derived from its service and method; the server
//! answers on the request's reply subject with an ACK and a response, in
//! any order, or with a NACK to reject it. The client retries ack-timeouts
//! and bus failures and backs off on NACKs.
//!
//! ## Components
//!
//! - **Bus**: collaborator abstraction with NATS and in-memory clients
//! - **Subscription pool**: bounded, self-healing pool of reply inboxes
//! - **Multiplexer**: one wildcard subscription shared by all requests
//! - **Exchange**: the ACK/RESPONSE protocol over either receive strategy
//! - **Retry**: attempt budgets, NACK backoff with splay, reconnect delay
//! - **Client**: `send_request`, the entry point for the RPC layer

pub mod bus;
pub mod config;
pub mod muxer;
pub mod rpc;
pub mod subscription;
pub mod types;

pub use bus::{BusClient, BusMessage, DeliveryModel, MemoryBus, NatsBus, ScriptedReply};
pub use config::{ClientArgs, ClientConfig, NatsArgs, ReceiveStrategy};
pub use rpc::{NatsRpcClient, RequestOptions};
pub use types::{Result, TransportError};
