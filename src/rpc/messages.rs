//! Wire constants and per-call request options

use std::time::Duration;

use crate::config::ClientConfig;

/// Payload the server sends to acknowledge a request
pub const ACK: &[u8] = b"\x01";

/// Payload the server sends to reject a request
pub const NACK: &[u8] = b"\x02";

/// Options for a single RPC call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    pub service_name: String,
    pub method_name: String,
    /// How long to wait for the first reply
    pub ack_timeout: Duration,
    /// How long to wait for the second reply
    pub response_timeout: Duration,
}

impl RequestOptions {
    /// Options for `service#method` using the client-wide timeouts
    pub fn new(service_name: &str, method_name: &str, config: &ClientConfig) -> Self {
        Self {
            service_name: service_name.to_string(),
            method_name: method_name.to_string(),
            ack_timeout: config.ack_timeout,
            response_timeout: config.response_timeout,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// `Service#method`, used in error messages and logs
    pub fn service_and_method(&self) -> String {
        format!("{}#{}", self.service_name, self.method_name)
    }
}

pub(crate) fn is_ack(payload: &[u8]) -> bool {
    payload == ACK
}

pub(crate) fn is_nack(payload: &[u8]) -> bool {
    payload == NACK
}
