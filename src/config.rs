//! Configuration for the RPC client transport
//!
//! Process-wide settings come from environment variables through clap, so
//! the same definitions serve the library (`ClientArgs::from_env`) and the
//! `nats-rpc` binary (flattened into its CLI).

use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::types::{Result, TransportError};

/// Default retry budget for ack-timeouts and bus I/O failures
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default NACK backoff schedule in milliseconds
pub const DEFAULT_NACK_BACKOFF_INTERVALS: [u64; 5] = [0, 1, 3, 5, 10];

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

/// How replies are received
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyArg {
    /// Pick from the bus client's delivery model
    Auto,
    /// Pooled or per-request subscriptions with blocking receive
    Direct,
    /// One shared wildcard subscription with token dispatch
    Shared,
}

/// Reply receive strategy, fixed for the life of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStrategy {
    Direct,
    Shared,
}

/// RPC client settings
#[derive(Parser, Debug, Clone)]
pub struct ClientArgs {
    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Number of pooled reply subscriptions (0 disables pooling)
    #[arg(long, env = "PB_NATS_CLIENT_SUBSCRIPTION_POOL_SIZE", default_value = "0")]
    pub subscription_pool_size: usize,

    /// How long to wait for a free pooled subscription, in milliseconds
    #[arg(
        long,
        env = "PB_NATS_CLIENT_SUBSCRIPTION_ACQUIRE_TIMEOUT_MS",
        default_value = "100"
    )]
    pub subscription_acquire_timeout_ms: u64,

    /// Seconds to wait for the first reply (normally the ACK)
    #[arg(long, env = "PB_NATS_CLIENT_ACK_TIMEOUT", default_value = "5")]
    pub ack_timeout: u64,

    /// Seconds to wait for the second reply (normally the response)
    #[arg(long, env = "PB_NATS_CLIENT_RESPONSE_TIMEOUT", default_value = "60")]
    pub response_timeout: u64,

    /// Milliseconds to wait before retrying the Nth NACKed attempt
    #[arg(
        long,
        env = "PB_NATS_CLIENT_NACK_BACKOFF_INTERVALS",
        value_delimiter = ',',
        default_values_t = DEFAULT_NACK_BACKOFF_INTERVALS
    )]
    pub nack_backoff_intervals: Vec<u64>,

    /// Upper bound in milliseconds of the jitter added to NACK backoff
    #[arg(long, env = "PB_NATS_CLIENT_NACK_BACKOFF_SPLAY_LIMIT", default_value = "10")]
    pub nack_backoff_splay_limit: u64,

    /// Seconds to sleep after a bus I/O failure (defaults to the ack timeout)
    #[arg(long, env = "PB_NATS_CLIENT_RECONNECT_DELAY")]
    pub reconnect_delay: Option<u64>,

    /// Attempts allowed for ack-timeouts and for bus I/O failures
    #[arg(long, env = "PB_NATS_CLIENT_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Reply receive strategy
    #[arg(
        long,
        env = "PB_NATS_CLIENT_RECEIVE_STRATEGY",
        value_enum,
        default_value = "auto"
    )]
    pub receive_strategy: StrategyArg,

    /// Prefix prepended to every request subject (empty for none)
    #[arg(long, env = "PB_NATS_CLIENT_SUBJECT_PREFIX", default_value = "")]
    pub subject_prefix: String,
}

impl ClientArgs {
    /// Read the settings from the environment only, ignoring the process arguments
    pub fn from_env() -> Result<Self> {
        Self::try_parse_from(["nats-rpc-client"])
            .map_err(|e| TransportError::Config(e.to_string()))
    }

    /// Effective reconnect delay in seconds
    pub fn reconnect_delay_secs(&self) -> u64 {
        self.reconnect_delay.unwrap_or(self.ack_timeout)
    }

    /// Validate and convert into a typed [`ClientConfig`]
    pub fn into_config(self) -> Result<ClientConfig> {
        let config = ClientConfig {
            subscription_pool_size: self.subscription_pool_size,
            subscription_acquire_timeout: Duration::from_millis(
                self.subscription_acquire_timeout_ms,
            ),
            ack_timeout: Duration::from_secs(self.ack_timeout),
            response_timeout: Duration::from_secs(self.response_timeout),
            nack_backoff_intervals: self
                .nack_backoff_intervals
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            nack_backoff_splay_limit: Duration::from_millis(self.nack_backoff_splay_limit),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs()),
            max_attempts: self.max_attempts,
            receive_strategy: match self.receive_strategy {
                StrategyArg::Auto => None,
                StrategyArg::Direct => Some(ReceiveStrategy::Direct),
                StrategyArg::Shared => Some(ReceiveStrategy::Shared),
            },
            subject_prefix: self.subject_prefix,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Typed client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub subscription_pool_size: usize,
    pub subscription_acquire_timeout: Duration,
    pub ack_timeout: Duration,
    pub response_timeout: Duration,
    pub nack_backoff_intervals: Vec<Duration>,
    pub nack_backoff_splay_limit: Duration,
    pub reconnect_delay: Duration,
    pub max_attempts: u32,
    /// `None` selects from the bus client's delivery model
    pub receive_strategy: Option<ReceiveStrategy>,
    pub subject_prefix: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            subscription_pool_size: 0,
            subscription_acquire_timeout: Duration::from_millis(100),
            ack_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(60),
            nack_backoff_intervals: DEFAULT_NACK_BACKOFF_INTERVALS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            nack_backoff_splay_limit: Duration::from_millis(10),
            reconnect_delay: Duration::from_secs(5),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            receive_strategy: None,
            subject_prefix: String::new(),
        }
    }
}

impl ClientConfig {
    /// Whether replies go through the subscription pool
    pub fn uses_subscription_pool(&self) -> bool {
        self.subscription_pool_size > 0
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TransportError::Config(
                "PB_NATS_CLIENT_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.ack_timeout.is_zero() {
            return Err(TransportError::Config(
                "PB_NATS_CLIENT_ACK_TIMEOUT must be greater than zero".to_string(),
            ));
        }
        if self.response_timeout.is_zero() {
            return Err(TransportError::Config(
                "PB_NATS_CLIENT_RESPONSE_TIMEOUT must be greater than zero".to_string(),
            ));
        }
        if self.uses_subscription_pool() && self.subscription_acquire_timeout.is_zero() {
            return Err(TransportError::Config(
                "PB_NATS_CLIENT_SUBSCRIPTION_ACQUIRE_TIMEOUT_MS must be greater than zero"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_match_config_defaults() {
        let args = ClientArgs::try_parse_from(["test"]).unwrap();
        let config = args.into_config().unwrap();
        let defaults = ClientConfig::default();

        assert_eq!(config.subscription_pool_size, defaults.subscription_pool_size);
        assert_eq!(config.ack_timeout, defaults.ack_timeout);
        assert_eq!(config.response_timeout, defaults.response_timeout);
        assert_eq!(config.nack_backoff_intervals, defaults.nack_backoff_intervals);
        assert_eq!(config.nack_backoff_splay_limit, defaults.nack_backoff_splay_limit);
        assert_eq!(config.reconnect_delay, defaults.reconnect_delay);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.receive_strategy, None);
    }

    #[test]
    fn test_reconnect_delay_follows_ack_timeout() {
        let args = ClientArgs::try_parse_from(["test", "--ack-timeout", "2"]).unwrap();
        assert_eq!(args.reconnect_delay_secs(), 2);

        let args =
            ClientArgs::try_parse_from(["test", "--ack-timeout", "2", "--reconnect-delay", "7"])
                .unwrap();
        assert_eq!(args.reconnect_delay_secs(), 7);
    }

    #[test]
    fn test_backoff_intervals_are_comma_separated() {
        let args =
            ClientArgs::try_parse_from(["test", "--nack-backoff-intervals", "5,10,20"]).unwrap();
        assert_eq!(args.nack_backoff_intervals, vec![5, 10, 20]);
    }

    #[test]
    fn test_strategy_override() {
        let args = ClientArgs::try_parse_from(["test", "--receive-strategy", "shared"]).unwrap();
        let config = args.into_config().unwrap();
        assert_eq!(config.receive_strategy, Some(ReceiveStrategy::Shared));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let args = ClientArgs::try_parse_from(["test", "--max-attempts", "0"]).unwrap();
        assert!(matches!(
            args.into_config(),
            Err(TransportError::Config(_))
        ));
    }
}
