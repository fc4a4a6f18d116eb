//! Error types for the RPC client transport

use std::time::Duration;

/// Main error type for transport operations
///
/// Ack-timeouts and NACKs are not errors at this level: they are exchange
/// outcomes that the retry controller turns into [`TransportError::RequestTimeout`]
/// once their budgets run out.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The subscription pool had no free resource within its acquire window
    #[error("Subscription pool exhausted after waiting {waited:?}")]
    AcquireTimeout { waited: Duration },

    /// Retry budget or NACK backoff schedule exhausted for `Service#method`
    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    /// ACK received but the response payload never arrived
    #[error("Response timed out: {0}")]
    ResponseTimeout(String),

    #[error("Bus I/O error: {0}")]
    BusIo(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Whether this is a connection-level failure the retry controller
    /// answers with a reconnect delay
    pub fn is_retryable_io(&self) -> bool {
        matches!(self, Self::BusIo(_))
    }
}

impl From<async_nats::Error> for TransportError {
    fn from(err: async_nats::Error) -> Self {
        Self::BusIo(err.to_string())
    }
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_bus_io_is_retryable() {
        assert!(TransportError::BusIo("reset".into()).is_retryable_io());
        assert!(!TransportError::RequestTimeout("Svc#call".into()).is_retryable_io());
        assert!(!TransportError::AcquireTimeout {
            waited: Duration::from_millis(100)
        }
        .is_retryable_io());
    }

    #[test]
    fn test_request_timeout_names_service_and_method() {
        let err = TransportError::RequestTimeout("Warehouse::ShipmentService#create".into());
        assert_eq!(
            err.to_string(),
            "Request timed out: Warehouse::ShipmentService#create"
        );
    }
}
