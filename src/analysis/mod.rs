pub mod types;
pub mod sanitize;
pub mod prompt;
pub mod throttle;
pub mod providers;
pub mod transport;
pub mod retry;
pub mod decoder;
pub mod store;
pub mod orchestrator;

#[cfg(test)]
mod scenario_tests;

pub use types::*;
pub use prompt::*;
pub use throttle::*;
pub use providers::*;
pub use transport::*;
pub use retry::*;
pub use decoder::*;
pub use store::*;
pub use orchestrator::*;

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;

/// Caller-visible failure of one analysis operation.
///
/// Each terminal transport outcome maps to exactly one variant; nothing
/// downstream of the transport re-classifies a failure.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("AI quota exhausted: {message}")]
    QuotaExhausted { message: String },

    #[error("AI service still rate limiting after {attempts} attempts: {message}")]
    RateLimited { message: String, attempts: u32 },

    #[error("AI service unreachable after {attempts} attempts: {message}")]
    NetworkFailure { message: String, attempts: u32 },

    #[error("Malformed AI service response: {0}")]
    MalformedTransportResponse(String),

    #[error("AI service returned error (status {status}): {body}")]
    ServiceError { status: u16, body: String },

    #[error("Could not decode AI reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("Invalid analysis request: {0}")]
    InvalidRequest(String),

    #[error("Could not save analysis result: {0}")]
    Storage(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<ConfigError> for AnalysisError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Stable, serializable error category for the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisErrorKind {
    QuotaExhausted,
    RateLimited,
    NetworkFailure,
    MalformedTransportResponse,
    ServiceError,
    Decode,
    InvalidRequest,
    Storage,
    Configuration,
}

impl AnalysisError {
    pub fn kind(&self) -> AnalysisErrorKind {
        match self {
            Self::QuotaExhausted { .. } => AnalysisErrorKind::QuotaExhausted,
            Self::RateLimited { .. } => AnalysisErrorKind::RateLimited,
            Self::NetworkFailure { .. } => AnalysisErrorKind::NetworkFailure,
            Self::MalformedTransportResponse(_) => AnalysisErrorKind::MalformedTransportResponse,
            Self::ServiceError { .. } => AnalysisErrorKind::ServiceError,
            Self::Decode(_) => AnalysisErrorKind::Decode,
            Self::InvalidRequest(_) => AnalysisErrorKind::InvalidRequest,
            Self::Storage(_) => AnalysisErrorKind::Storage,
            Self::Configuration(_) => AnalysisErrorKind::Configuration,
        }
    }

    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, Self::QuotaExhausted { .. })
    }

    /// Whether the wizard should offer "continue without AI".
    /// True for every failure on the model side of the pipeline.
    pub fn allows_manual_continuation(&self) -> bool {
        matches!(
            self,
            Self::QuotaExhausted { .. }
                | Self::RateLimited { .. }
                | Self::NetworkFailure { .. }
                | Self::MalformedTransportResponse(_)
                | Self::ServiceError { .. }
                | Self::Decode(_)
        )
    }

    /// User-facing guidance, where there is something the user can do.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::QuotaExhausted { .. } => Some(
                "The AI quota for this API key is used up. Continue the case manually, \
                 or check the provider's plan and billing settings before trying again.",
            ),
            Self::RateLimited { .. } => {
                Some("The AI service is busy. Wait a minute, then run the analysis again.")
            }
            Self::NetworkFailure { .. } => {
                Some("Check your internet connection, then run the analysis again.")
            }
            Self::ServiceError { status: 401 | 403, .. } => {
                Some("The AI service rejected the API key. Check the key in settings.")
            }
            Self::Configuration(_) => Some("Check the AI provider settings."),
            _ => None,
        }
    }
}
