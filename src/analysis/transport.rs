use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use super::providers::{GenerationSettings, Gemini, OpenAiCompatible, ProviderAdapter};
use super::throttle::{ClientUsageCounters, Throttle};
use super::types::{FatalReason, PromptEnvelope, RetryReason, Transport, TransportOutcome};
use super::AnalysisError;
use crate::config::{AnalysisConfig, ProviderKind};

/// Body markers that turn a 429 into account-level quota exhaustion.
///
/// Best-effort: providers word this differently and may change the wording.
/// A miss degrades to a retryable 429, which still terminates after the
/// attempt ceiling.
const QUOTA_MARKERS: &[&str] = &[
    "exhausted",
    "insufficient_quota",
    "exceeded your current quota",
    "billing",
];

/// Longest body excerpt kept in error messages.
const MAX_ERROR_BODY: usize = 500;

/// HTTP transport behind a minimum-interval throttle.
///
/// One core shared by every provider; the adapter decides URL, auth header
/// and wire format.
pub struct ThrottledTransport<A: ProviderAdapter> {
    adapter: A,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    settings: GenerationSettings,
    throttle: Throttle,
}

impl<A: ProviderAdapter> ThrottledTransport<A> {
    pub fn new(adapter: A, api_key: &str, config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AnalysisError::Configuration(e.to_string()))?;

        Ok(Self {
            adapter,
            client,
            api_key: api_key.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            settings: GenerationSettings {
                model: config.model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
            throttle: Throttle::new(config.min_request_interval),
        })
    }

    pub fn provider_name(&self) -> &'static str {
        self.adapter.name()
    }

    async fn perform(&self, envelope: &PromptEnvelope) -> TransportOutcome {
        let request = self.adapter.build_request(
            &self.client,
            &self.base_url,
            &self.api_key,
            envelope,
            &self.settings,
        );

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return classify_send_error(&e),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return classify_send_error(&e),
        };

        if !status.is_success() {
            return classify_failure_status(status, &headers, &body);
        }

        match self.adapter.extract_reply(&body) {
            Ok((text, usage)) => {
                if let Some(usage) = usage {
                    self.throttle.record_tokens(usage).await;
                }
                TransportOutcome::Success { text, usage }
            }
            Err(message) => TransportOutcome::FatalFailure {
                reason: FatalReason::MalformedEnvelope { message },
            },
        }
    }
}

#[async_trait]
impl<A: ProviderAdapter> Transport for ThrottledTransport<A> {
    async fn send(&self, envelope: &PromptEnvelope) -> TransportOutcome {
        let sequence = self.throttle.acquire().await;
        let outcome = self.perform(envelope).await;
        tracing::debug!(
            provider = self.adapter.name(),
            task = %envelope.task,
            sequence,
            outcome = outcome.label(),
            "Transport attempt finished"
        );
        outcome
    }

    async fn usage(&self) -> ClientUsageCounters {
        self.throttle.counters().await
    }

    async fn reset_usage(&self) {
        self.throttle.reset_counters().await;
    }
}

/// Build the transport for the configured provider.
pub fn transport_for(
    config: &AnalysisConfig,
    api_key: &str,
) -> Result<Box<dyn Transport>, AnalysisError> {
    Ok(match config.provider {
        ProviderKind::OpenAiCompatible => {
            Box::new(ThrottledTransport::new(OpenAiCompatible, api_key, config)?)
        }
        ProviderKind::Gemini => Box::new(ThrottledTransport::new(Gemini, api_key, config)?),
    })
}

// ──────────────────────────────────────────────
// Classification
// ──────────────────────────────────────────────

/// Map a non-2xx response to an outcome.
///
/// A generic 429 suggests a delay only when the server sent `Retry-After`;
/// otherwise the retry policy's growing rate-limit backoff applies.
pub fn classify_failure_status(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> TransportOutcome {
    let excerpt = truncate_body(body);

    if status == StatusCode::TOO_MANY_REQUESTS {
        if is_quota_exhausted(body) {
            tracing::warn!(status = status.as_u16(), "AI quota exhausted");
            return TransportOutcome::QuotaExhausted { message: excerpt };
        }
        let retry_after = parse_retry_after(headers, Utc::now());
        tracing::info!(
            status = status.as_u16(),
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "Rate limited by AI service"
        );
        return TransportOutcome::RetryableFailure {
            reason: RetryReason::RateLimited { message: excerpt },
            suggested_delay: retry_after,
        };
    }

    tracing::warn!(status = status.as_u16(), "AI service returned an error status");
    TransportOutcome::FatalFailure {
        reason: FatalReason::HttpStatus {
            status: status.as_u16(),
            body: excerpt,
        },
    }
}

fn classify_send_error(e: &reqwest::Error) -> TransportOutcome {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        tracing::info!(error = %e, "Network failure talking to AI service");
        TransportOutcome::RetryableFailure {
            reason: RetryReason::Network {
                message: e.to_string(),
            },
            suggested_delay: None,
        }
    } else {
        TransportOutcome::FatalFailure {
            reason: FatalReason::MalformedEnvelope {
                message: e.to_string(),
            },
        }
    }
}

/// Substring heuristic over the 429 body. See [`QUOTA_MARKERS`].
pub fn is_quota_exhausted(body: &str) -> bool {
    let lower = body.to_lowercase();
    QUOTA_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Read `Retry-After` as delta-seconds or an HTTP date relative to `now`.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = raw.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(MAX_ERROR_BODY).collect();
    format!("{cut}…")
}

// ──────────────────────────────────────────────
// Scripted transport (tests and offline demos)
// ──────────────────────────────────────────────

/// Transport that replays queued outcomes instead of calling the network.
///
/// Goes through the same throttle as the HTTP transport. When the queue is
/// empty the last outcome repeats.
pub struct ScriptedTransport {
    script: StdMutex<VecDeque<TransportOutcome>>,
    last: StdMutex<Option<TransportOutcome>>,
    sent: StdMutex<Vec<PromptEnvelope>>,
    sent_at: StdMutex<Vec<tokio::time::Instant>>,
    throttle: Throttle,
}

impl ScriptedTransport {
    pub fn new(outcomes: Vec<TransportOutcome>) -> Self {
        Self::with_interval(outcomes, Duration::ZERO)
    }

    pub fn with_interval(outcomes: Vec<TransportOutcome>, min_interval: Duration) -> Self {
        Self {
            script: StdMutex::new(outcomes.into()),
            last: StdMutex::new(None),
            sent: StdMutex::new(Vec::new()),
            sent_at: StdMutex::new(Vec::new()),
            throttle: Throttle::new(min_interval),
        }
    }

    /// Replies with `text` on every call.
    pub fn always(text: &str) -> Self {
        Self::new(vec![TransportOutcome::Success {
            text: text.to_string(),
            usage: None,
        }])
    }

    pub fn attempts(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn sent_envelopes(&self) -> Vec<PromptEnvelope> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn send_instants(&self) -> Vec<tokio::time::Instant> {
        self.sent_at.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn next_outcome(&self) -> TransportOutcome {
        let next = self.script.lock().ok().and_then(|mut q| q.pop_front());
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(outcome) = next {
            *last = Some(outcome);
        }
        last.clone().unwrap_or_else(|| TransportOutcome::FatalFailure {
            reason: FatalReason::MalformedEnvelope {
                message: "scripted transport has no outcomes".into(),
            },
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, envelope: &PromptEnvelope) -> TransportOutcome {
        self.throttle.acquire().await;
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(envelope.clone());
        }
        if let Ok(mut sent_at) = self.sent_at.lock() {
            sent_at.push(tokio::time::Instant::now());
        }
        let outcome = self.next_outcome();
        if let TransportOutcome::Success {
            usage: Some(usage), ..
        } = &outcome
        {
            self.throttle.record_tokens(*usage).await;
        }
        outcome
    }

    async fn usage(&self) -> ClientUsageCounters {
        self.throttle.counters().await
    }

    async fn reset_usage(&self) {
        self.throttle.reset_counters().await;
    }
}
