use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "Similia";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum gap between two outbound requests from one client instance.
pub const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(500);

/// Wait after the first generic 429 that carries no `Retry-After` header.
/// Later attempts wait a multiple of it.
pub const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(5);

/// Total attempts (first call included) for one analysis request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff unit: attempt `n` waits `n * BACKOFF_UNIT` when the server gave no hint.
pub const BACKOFF_UNIT: Duration = Duration::from_secs(2);

/// Low temperature keeps repertorization output stable between runs.
pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "similia=info,warn"
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Unknown provider '{0}' (expected 'openai' or 'gemini')")]
    UnknownProvider(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Base URL must start with http:// or https://: {0}")]
    InvalidBaseUrl(String),
}

/// Which remote API dialect the transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// `/chat/completions` with bearer auth (OpenAI and compatible gateways).
    OpenAiCompatible,
    /// Google `generateContent`.
    Gemini,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAiCompatible => "openai",
            Self::Gemini => "gemini",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "openai" | "openai_compatible" | "openai-compatible" => Ok(Self::OpenAiCompatible),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAiCompatible => OPENAI_BASE_URL,
            Self::Gemini => GEMINI_BASE_URL,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAiCompatible => OPENAI_DEFAULT_MODEL,
            Self::Gemini => GEMINI_DEFAULT_MODEL,
        }
    }
}

/// Bounded backoff settings for the retry orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Network-failure backoff unit.
    pub backoff_unit: Duration,
    /// Rate-limit backoff unit, used when a 429 gave no `Retry-After`.
    pub rate_limit_unit: Duration,
}

impl RetryPolicy {
    /// Attempt count with the ceiling clamped to at least one call.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after failed attempt `attempt` (1-based) when no server hint exists.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }

    /// Delay after a rate-limited attempt `attempt` (1-based) without `Retry-After`.
    pub fn rate_limit_backoff_for(&self, attempt: u32) -> Duration {
        self.rate_limit_unit * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_unit: BACKOFF_UNIT,
            rate_limit_unit: DEFAULT_RATE_LIMIT_DELAY,
        }
    }
}

/// Settings for one analysis client. The API key is deliberately absent:
/// callers hand it to the transport at construction.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisConfig {
    pub provider: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    pub min_request_interval: Duration,
    pub retry: RetryPolicy,
}

impl AnalysisConfig {
    pub fn for_provider(provider: ProviderKind) -> Self {
        Self {
            provider,
            base_url: provider.default_base_url().to_string(),
            model: provider.default_model().to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            min_request_interval: MIN_REQUEST_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }

    /// Overlay non-secret `SIMILIA_*` environment variables.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup (tests pass a map here).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = lookup("SIMILIA_PROVIDER") {
            let kind = ProviderKind::parse(&provider)?;
            if kind != self.provider {
                self = Self {
                    retry: self.retry,
                    ..Self::for_provider(kind)
                };
            }
        }
        if let Some(url) = lookup("SIMILIA_BASE_URL") {
            self.base_url = url;
        }
        if let Some(model) = lookup("SIMILIA_MODEL") {
            self.model = model;
        }
        if let Some(raw) = lookup("SIMILIA_MAX_ATTEMPTS") {
            self.retry.max_attempts = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "SIMILIA_MAX_ATTEMPTS",
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup("SIMILIA_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "SIMILIA_TIMEOUT_SECS",
                value: raw.clone(),
            })?;
            self.request_timeout = Duration::from_secs(secs);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(self.base_url.clone()));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "model",
                value: self.model.clone(),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidValue {
                key: "temperature",
                value: self.temperature.to_string(),
            });
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_tokens",
                value: "0".into(),
            });
        }
        Ok(())
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self::for_provider(ProviderKind::OpenAiCompatible)
    }
}
