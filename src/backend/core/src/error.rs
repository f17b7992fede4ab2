//! Error handling for Tidepool.
//!
//! Only two kinds of error ever leave the process boundary: configuration
//! errors and dispatcher-construction errors. Everything raised while a job
//! runs is logged by the worker and counted, never propagated.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Tidepool operations.
pub type Result<T> = std::result::Result<T, TidepoolError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Configuration Errors (1000-1099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Dispatcher Errors (2000-2099)
    DispatcherConstructionFailed,
    DispatcherAlreadyRunning,
    WorkerIdGenerationFailed,

    // Submission Errors (3000-3099)
    UnknownJobKind,
    InvalidPayload,
    QueueClosed,
    QueueFull,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ConfigurationError => 1000,
            Self::MissingConfiguration => 1001,
            Self::InvalidConfiguration => 1002,

            Self::DispatcherConstructionFailed => 2000,
            Self::DispatcherAlreadyRunning => 2001,
            Self::WorkerIdGenerationFailed => 2002,

            Self::UnknownJobKind => 3000,
            Self::InvalidPayload => 3001,
            Self::QueueClosed => 3002,
            Self::QueueFull => 3003,
        }
    }

    /// Category name used as a metrics label.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "configuration",
            2000..=2099 => "dispatcher",
            _ => "submission",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Tidepool.
#[derive(Error, Debug)]
pub struct TidepoolError {
    code: ErrorCode,

    message: Cow<'static, str>,

    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for TidepoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl TidepoolError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with a code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// A required environment variable is absent.
    pub fn missing_configuration(key: &str) -> Self {
        Self::new(
            ErrorCode::MissingConfiguration,
            format!("{} is required and has no default", key),
        )
    }

    /// An environment variable is present but unusable.
    pub fn invalid_configuration(key: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidConfiguration,
            format!("{} is invalid: {}", key, reason),
        )
    }

    /// The dispatcher could not be constructed or started.
    pub fn dispatcher_construction(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DispatcherConstructionFailed, message.into())
    }

    /// A submission named a kind nobody registered.
    pub fn unknown_job_kind(kind: &str) -> Self {
        Self::new(ErrorCode::UnknownJobKind, format!("unknown job kind: {}", kind))
    }

    /// The submission queue has no consumer left.
    pub fn queue_closed() -> Self {
        Self::new(ErrorCode::QueueClosed, "submission queue is closed")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the message.
    pub fn message(&self) -> &str {
        &self.message
    }

    fn record_metrics(&self) {
        counter!(
            "tidepool_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations
// ═══════════════════════════════════════════════════════════════════════════════

impl From<config::ConfigError> for TidepoolError {
    fn from(error: config::ConfigError) -> Self {
        let code = match &error {
            config::ConfigError::NotFound(_) => ErrorCode::MissingConfiguration,
            config::ConfigError::Type { .. } => ErrorCode::InvalidConfiguration,
            _ => ErrorCode::ConfigurationError,
        };
        Self::new(code, "configuration could not be loaded").with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_categories() {
        assert_eq!(ErrorCode::MissingConfiguration.category(), "configuration");
        assert_eq!(ErrorCode::WorkerIdGenerationFailed.category(), "dispatcher");
        assert_eq!(ErrorCode::UnknownJobKind.category(), "submission");
        assert_eq!(ErrorCode::QueueFull.numeric_code(), 3003);
    }

    #[test]
    fn test_error_display() {
        let error = TidepoolError::missing_configuration("MAX_WORKERS");
        let display = error.to_string();
        assert!(display.contains("MissingConfiguration"));
        assert!(display.contains("MAX_WORKERS"));
    }

    #[test]
    fn test_config_error_keeps_source() {
        let error: TidepoolError = config::ConfigError::NotFound("max_workers".into()).into();
        assert_eq!(error.code(), ErrorCode::MissingConfiguration);
        assert!(std::error::Error::source(&error).is_some());
        assert!(error.to_string().contains("max_workers"));
    }
}
