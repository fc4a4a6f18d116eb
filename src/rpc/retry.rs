//! Retry and backoff around the exchange
//!
//! - Ack-timeout: retry right away while the attempt budget lasts
//! - NACK: sleep `intervals[n] + splay` and retry; past the end of the
//!   schedule the request fails
//! - Bus I/O failure: log, sleep the reconnect delay, retry while a
//!   separate attempt budget lasts, then surface the error as is
//!
//! Everything else (response timeout, pool exhaustion) is surfaced at once.

use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::exchange::ExchangeOutcome;
use crate::config::ClientConfig;
use crate::types::{Result, TransportError};

/// Retry budgets and backoff schedule
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub nack_backoff_intervals: Vec<Duration>,
    pub nack_backoff_splay_limit: Duration,
    pub reconnect_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            nack_backoff_intervals: config.nack_backoff_intervals.clone(),
            nack_backoff_splay_limit: config.nack_backoff_splay_limit,
            reconnect_delay: config.reconnect_delay,
        }
    }

    /// Backoff before retrying after the `nack_retry`-th NACK, `None` once
    /// the schedule is exhausted
    pub fn nack_backoff(&self, nack_retry: usize) -> Option<Duration> {
        self.nack_backoff_intervals
            .get(nack_retry)
            .map(|interval| *interval + self.splay())
    }

    fn splay(&self) -> Duration {
        let limit = self.nack_backoff_splay_limit.as_millis() as u64;
        if limit == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..limit))
    }

    /// Drive `attempt` until it yields a response or a budget runs out
    ///
    /// `label` names the call (`Service#method`) in errors and logs.
    pub async fn run<F, Fut>(&self, label: &str, mut attempt: F) -> Result<Bytes>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ExchangeOutcome>>,
    {
        let mut ack_retries = self.max_attempts;
        let mut io_retries = self.max_attempts;
        let mut nack_retry = 0usize;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match attempt().await {
                Ok(ExchangeOutcome::Response(payload)) => {
                    debug!("{} answered after {} attempt(s)", label, attempts);
                    return Ok(payload);
                }
                Ok(ExchangeOutcome::AckTimeout) => {
                    ack_retries = ack_retries.saturating_sub(1);
                    if ack_retries > 0 {
                        debug!("{} not acknowledged, retrying ({} left)", label, ack_retries);
                        continue;
                    }
                    warn!("{} not acknowledged after {} attempt(s)", label, attempts);
                    return Err(TransportError::RequestTimeout(label.to_string()));
                }
                Ok(ExchangeOutcome::Nack) => {
                    let Some(backoff) = self.nack_backoff(nack_retry) else {
                        warn!("{} rejected, NACK backoff schedule exhausted", label);
                        return Err(TransportError::RequestTimeout(label.to_string()));
                    };
                    nack_retry += 1;
                    debug!("{} rejected, retrying in {:?}", label, backoff);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_retryable_io() => {
                    error!("{} failed on the bus: {}", label, e);
                    warn!(
                        "Bus I/O error, sleeping {:?} before retrying",
                        self.reconnect_delay
                    );
                    tokio::time::sleep(self.reconnect_delay).await;

                    io_retries = io_retries.saturating_sub(1);
                    if io_retries > 0 {
                        continue;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
