//! Environment-driven configuration
//!
//! Everything lives in one test: environment variables are process-wide.

use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use nats_rpc_client::{ClientArgs, ClientConfig, ReceiveStrategy};

const VARS: [&str; 8] = [
    "PB_NATS_CLIENT_SUBSCRIPTION_POOL_SIZE",
    "PB_NATS_CLIENT_ACK_TIMEOUT",
    "PB_NATS_CLIENT_RESPONSE_TIMEOUT",
    "PB_NATS_CLIENT_NACK_BACKOFF_INTERVALS",
    "PB_NATS_CLIENT_NACK_BACKOFF_SPLAY_LIMIT",
    "PB_NATS_CLIENT_RECONNECT_DELAY",
    "PB_NATS_CLIENT_RECEIVE_STRATEGY",
    "PB_NATS_CLIENT_MAX_ATTEMPTS",
];

#[test]
fn test_config_from_environment() {
    for var in VARS {
        std::env::remove_var(var);
    }

    // Defaults
    let config = assert_ok!(assert_ok!(ClientArgs::from_env()).into_config());
    let defaults = ClientConfig::default();
    assert_eq!(config.subscription_pool_size, 0);
    assert_eq!(config.ack_timeout, defaults.ack_timeout);
    assert_eq!(config.response_timeout, Duration::from_secs(60));
    assert_eq!(config.reconnect_delay, config.ack_timeout);
    assert_eq!(
        config.nack_backoff_intervals,
        [0, 1, 3, 5, 10].map(Duration::from_millis).to_vec()
    );
    assert!(!config.uses_subscription_pool());

    // Overrides
    std::env::set_var("PB_NATS_CLIENT_SUBSCRIPTION_POOL_SIZE", "4");
    std::env::set_var("PB_NATS_CLIENT_ACK_TIMEOUT", "2");
    std::env::set_var("PB_NATS_CLIENT_RESPONSE_TIMEOUT", "30");
    std::env::set_var("PB_NATS_CLIENT_NACK_BACKOFF_INTERVALS", "100,200,400");
    std::env::set_var("PB_NATS_CLIENT_NACK_BACKOFF_SPLAY_LIMIT", "25");
    std::env::set_var("PB_NATS_CLIENT_RECEIVE_STRATEGY", "direct");

    let args = assert_ok!(ClientArgs::from_env());
    assert_eq!(args.reconnect_delay_secs(), 2);
    let config = assert_ok!(args.into_config());
    assert_eq!(config.subscription_pool_size, 4);
    assert!(config.uses_subscription_pool());
    assert_eq!(config.ack_timeout, Duration::from_secs(2));
    assert_eq!(config.response_timeout, Duration::from_secs(30));
    assert_eq!(config.reconnect_delay, Duration::from_secs(2));
    assert_eq!(
        config.nack_backoff_intervals,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
    assert_eq!(config.nack_backoff_splay_limit, Duration::from_millis(25));
    assert_eq!(config.receive_strategy, Some(ReceiveStrategy::Direct));

    std::env::set_var("PB_NATS_CLIENT_RECONNECT_DELAY", "9");
    let config = assert_ok!(assert_ok!(ClientArgs::from_env()).into_config());
    assert_eq!(config.reconnect_delay, Duration::from_secs(9));

    // Invalid values
    std::env::set_var("PB_NATS_CLIENT_ACK_TIMEOUT", "soon");
    assert_err!(ClientArgs::from_env());
    std::env::set_var("PB_NATS_CLIENT_ACK_TIMEOUT", "0");
    assert_err!(assert_ok!(ClientArgs::from_env()).into_config());

    for var in VARS {
        std::env::remove_var(var);
    }
}
