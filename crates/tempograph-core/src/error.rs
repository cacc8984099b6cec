//! Error types for Tempograph

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Tempograph's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of inference provider failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Credentials rejected (401/403)
    Auth,
    /// Provider asked us to slow down (429)
    RateLimit,
    /// Transport failure, timeout, or transient server error
    Network,
    /// Account has no credits or exceeded its quota (402)
    Quota,
    /// Anything the classifier does not recognise
    Unknown,
}

impl ProviderErrorKind {
    /// Whether retrying the same call later can succeed without operator action
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Auth | Self::Quota)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Quota => "quota",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure from the inference provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error from inference provider: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Retry-after hint supplied by the provider, if any
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, message)
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimit,
            message: format!("rate limited, retry after {}s", retry_after.as_secs()),
            retry_after: Some(retry_after),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Network, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Quota, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unknown, message)
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::network(err.to_string())
        } else if err.is_decode() {
            Self::unknown(format!("Failed to decode provider response: {}", err))
        } else {
            Self::unknown(err.to_string())
        }
    }
}

/// Error taxonomy surfaced on rejected and degraded dispositions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ProviderAuth,
    ProviderRateLimit,
    ProviderNetwork,
    ProviderQuota,
    ProviderUnknown,
    CircuitOpen,
    StorageTimeout,
    StorageWriteFailure,
    EpisodeTimeout,
    LedgerFull,
    InvalidInput,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderAuth => "provider_auth",
            Self::ProviderRateLimit => "provider_rate_limit",
            Self::ProviderNetwork => "provider_network",
            Self::ProviderQuota => "provider_quota",
            Self::ProviderUnknown => "provider_unknown",
            Self::CircuitOpen => "circuit_open",
            Self::StorageTimeout => "storage_timeout",
            Self::StorageWriteFailure => "storage_write_failure",
            Self::EpisodeTimeout => "episode_timeout",
            Self::LedgerFull => "ledger_full",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "provider_auth" => Self::ProviderAuth,
            "provider_rate_limit" => Self::ProviderRateLimit,
            "provider_network" => Self::ProviderNetwork,
            "provider_quota" => Self::ProviderQuota,
            "provider_unknown" => Self::ProviderUnknown,
            "circuit_open" => Self::CircuitOpen,
            "storage_timeout" => Self::StorageTimeout,
            "storage_write_failure" => Self::StorageWriteFailure,
            "episode_timeout" => Self::EpisodeTimeout,
            "ledger_full" => Self::LedgerFull,
            "invalid_input" => Self::InvalidInput,
            "internal" => Self::Internal,
            _ => return None,
        })
    }

    /// Whether this category came from the inference provider side
    pub fn is_provider(&self) -> bool {
        matches!(
            self,
            Self::ProviderAuth
                | Self::ProviderRateLimit
                | Self::ProviderNetwork
                | Self::ProviderQuota
                | Self::ProviderUnknown
                | Self::CircuitOpen
        )
    }

    /// Whether another automatic attempt can succeed. Credential and quota
    /// failures need an operator, and a failed storage write is never replayed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ProviderAuth | Self::ProviderQuota | Self::StorageWriteFailure | Self::InvalidInput
        )
    }
}

impl From<ProviderErrorKind> for ErrorCategory {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::Auth => Self::ProviderAuth,
            ProviderErrorKind::RateLimit => Self::ProviderRateLimit,
            ProviderErrorKind::Network => Self::ProviderNetwork,
            ProviderErrorKind::Quota => Self::ProviderQuota,
            ProviderErrorKind::Unknown => Self::ProviderUnknown,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tempograph error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Provider errors (E100-E199)
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Inference provider circuit is open. Retry after {}s.", .retry_after.as_secs())]
    CircuitOpen { retry_after: Duration },

    // Storage errors (E400-E499)
    #[error("Storage operation '{0}' timed out")]
    StorageTimeout(String),

    #[error("Storage write failed: {0}. The batch was rolled back.")]
    StorageWriteFailure(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Ingestion errors (E1300-E1399)
    #[error("Episode processing timed out after {}s", .0.as_secs())]
    EpisodeTimeout(Duration),

    #[error("Retry ledger is full ({0} entries). Episode was not scheduled for retry.")]
    LedgerFull(usize),

    #[error("Episode '{0}' not found")]
    EpisodeNotFound(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Provider(_) => "E100",
            Self::CircuitOpen { .. } => "E101",
            Self::StorageTimeout(_) => "E400",
            Self::StorageWriteFailure(_) => "E401",
            Self::Database(_) => "E402",
            Self::EpisodeTimeout(_) => "E1300",
            Self::LedgerFull(_) => "E1301",
            Self::EpisodeNotFound(_) => "E1302",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Serialization(_) => "E801",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Map onto the user-visible error taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Provider(e) => e.kind.into(),
            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            Self::StorageTimeout(_) => ErrorCategory::StorageTimeout,
            Self::StorageWriteFailure(_) | Self::Database(_) => ErrorCategory::StorageWriteFailure,
            Self::EpisodeTimeout(_) => ErrorCategory::EpisodeTimeout,
            Self::LedgerFull(_) => ErrorCategory::LedgerFull,
            Self::InvalidInput(_) | Self::EpisodeNotFound(_) | Self::ConfigError(_) => {
                ErrorCategory::InvalidInput
            }
            Self::Serialization(_) | Self::Other(_) | Self::Io(_) => ErrorCategory::Internal,
        }
    }

    /// Suggested wait before the caller tries again, where one is known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Provider(e) => e.retry_after,
            Self::CircuitOpen { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether the inference provider is the source of this error
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::CircuitOpen { .. })
    }

    /// Whether the same work can succeed later without operator action
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_recoverable(),
            _ => self.category().is_retryable(),
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Provider(e) if e.kind == ProviderErrorKind::Auth => {
                Some("Set TEMPOGRAPH_API_KEY or OPENROUTER_API_KEY".to_string())
            }
            Self::Provider(e) if e.kind == ProviderErrorKind::Quota => {
                Some("Add credits to the inference provider account".to_string())
            }
            Self::CircuitOpen { retry_after } => {
                Some(format!("Wait {}s or restart to reset the circuit", retry_after.as_secs()))
            }
            Self::LedgerFull(_) => Some("Raise retry.max_ledger_size or drain the ledger".to_string()),
            Self::StorageTimeout(_) => Some("Raise storage.operation_timeout_secs".to_string()),
            _ => None,
        }
    }
}
