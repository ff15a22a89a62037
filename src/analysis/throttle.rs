//! Minimum-interval gate between outbound requests, plus the usage counters.
//!
//! A token bucket of one: a caller that arrives too early waits for its turn
//! instead of being rejected. The gate's async mutex is held across the wait,
//! so concurrent callers line up behind it and each sees the stamp left by the
//! one before. Counters sit behind their own lock and never wait on the gate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::types::TokenUsage;

/// Per-client usage. Reset only through [`Throttle::reset_counters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientUsageCounters {
    /// Every attempt counts, failed ones included.
    pub total_requests: u64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    /// When the previous request was issued.
    last_issued: Mutex<Option<Instant>>,
    // Lock order: `last_issued` before `counters`.
    counters: Mutex<ClientUsageCounters>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_issued: Mutex::new(None),
            counters: Mutex::new(ClientUsageCounters::default()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the interval since the previous request has elapsed, then
    /// stamp this request. Returns the request's sequence number.
    pub async fn acquire(&self) -> u64 {
        let mut last_issued = self.last_issued.lock().await;

        if let Some(last) = *last_issued {
            let ready_at = last + self.min_interval;
            let now = Instant::now();
            if ready_at > now {
                tracing::debug!(
                    wait_ms = (ready_at - now).as_millis() as u64,
                    "Throttling outbound request"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        *last_issued = Some(Instant::now());
        let mut counters = self.counters.lock().await;
        counters.total_requests += 1;
        counters.last_request_at = Some(Utc::now());
        counters.total_requests
    }

    pub async fn record_tokens(&self, usage: TokenUsage) {
        let mut counters = self.counters.lock().await;
        counters.prompt_tokens += usage.prompt_tokens;
        counters.completion_tokens += usage.completion_tokens;
    }

    pub async fn counters(&self) -> ClientUsageCounters {
        self.counters.lock().await.clone()
    }

    /// Clears the counters. The interval stamp survives so the gate still holds.
    pub async fn reset_counters(&self) {
        *self.counters.lock().await = ClientUsageCounters::default();
    }
}
