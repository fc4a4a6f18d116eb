//! Request/response over the bus
//!
//! - **messages**: ACK/NACK sentinels and per-call options
//! - **subject**: request subject derivation and cache
//! - **exchange**: the two-reply exchange and receive strategies
//! - **retry**: retry budgets and NACK backoff
//! - **client**: the `send_request` entry point

pub mod client;
pub mod exchange;
pub mod messages;
pub mod retry;
pub mod subject;

pub use client::NatsRpcClient;
pub use exchange::{ExchangeHandler, ExchangeOutcome, ReplyChannel};
pub use messages::{RequestOptions, ACK, NACK};
pub use retry::RetryPolicy;
pub use subject::{subscription_key, SubjectKeyCache};
