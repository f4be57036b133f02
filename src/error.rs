//! Error types for chatshield.
//!
//! All errors are explicitly typed using thiserror. Policy rejections are not
//! errors; they are returned as `ContentFilterResult` values.

use thiserror::Error;

use crate::models::Severity;

/// Central error type for all chatshield operations.
#[derive(Debug, Error)]
pub enum ShieldError {
    /// Caller handed over a message that cannot be evaluated.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error (bad env values, inconsistent thresholds).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal state error (lock poisoning).
    #[error("Internal state error: {0}")]
    InternalState(String),

    /// Regex pattern compilation error.
    #[error("Regex pattern error: {0}")]
    RegexPattern(#[from] regex::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// "Send anyway" requested for a verdict that may not be overridden.
    #[error("Override not permitted for {severity:?} severity")]
    OverrideNotPermitted {
        /// Severity of the rejected verdict.
        severity: Severity,
    },
}

impl ShieldError {
    /// Log error with full context using tracing.
    pub fn log_with_context(&self, context: &ErrorContext) {
        match self {
            Self::InternalState(_) => {
                tracing::error!(
                    error = %self,
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    chat_id = ?context.chat_id,
                    operation = %context.operation,
                    "Critical error occurred"
                );
            }
            Self::InvalidInput(_) | Self::OverrideNotPermitted { .. } => {
                tracing::warn!(
                    error = %self,
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    chat_id = ?context.chat_id,
                    operation = %context.operation,
                    "Rejected request"
                );
            }
            Self::Config(_) | Self::RegexPattern(_) => {
                tracing::error!(
                    error = %self,
                    request_id = %context.request_id,
                    operation = %context.operation,
                    "Configuration error"
                );
            }
            Self::Json(_) | Self::Io(_) => {
                tracing::error!(
                    error = %self,
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Data processing error"
                );
            }
        }
    }

    /// Check if this error is critical and requires alerting
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::InternalState(_))
    }

    /// Get user-friendly error message (hides internal details)
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "Message could not be processed",
            Self::Config(_) => "Service configuration error",
            Self::InternalState(_) => "Internal service error",
            Self::RegexPattern(_) => "Invalid pattern configuration",
            Self::Json(_) => "Data format error",
            Self::Io(_) => "File system error",
            Self::OverrideNotPermitted { .. } => "This message cannot be sent",
        }
    }
}

/// Context information for error logging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Unique request identifier for correlation
    pub request_id: String,
    /// User ID if available
    pub user_id: Option<String>,
    /// Chat ID if available
    pub chat_id: Option<String>,
    /// Operation being performed
    pub operation: String,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            chat_id: None,
            operation: operation.into(),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Result type alias for chatshield operations.
pub type Result<T> = std::result::Result<T, ShieldError>;
