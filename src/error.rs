//! Application error types
//!
//! Every fallible payment operation returns [`AppResult`]. The error kind decides
//! whether the caller may retry and which HTTP status the API layer answers with.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::database::error::DatabaseError;

pub type AppResult<T> = Result<T, AppError>;

/// Bad caller input. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid phone number '{input}': {reason}")]
    InvalidPhone { input: String, reason: String },

    #[error("Amount must be at least {minimum}, got {amount}")]
    AmountTooSmall { amount: i64, minimum: i64 },

    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("Invalid {field}: {message}")]
    InvalidField { field: &'static str, message: String },
}

/// Failures talking to a third party.
#[derive(Debug, Clone, Error)]
pub enum ExternalError {
    /// Credential exchange failed. The next operation re-attempts the exchange.
    #[error("{provider} authentication failed: {message}")]
    Authentication { provider: String, message: String },

    #[error("{provider} error: {message}")]
    PaymentProvider {
        provider: String,
        message: String,
        code: Option<String>,
        is_retryable: bool,
    },

    #[error("{service} request timed out after {seconds} seconds")]
    Timeout { service: String, seconds: u64 },

    #[error("{service} rate limit exceeded")]
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
}

#[derive(Debug, Clone, Error)]
pub enum InfrastructureError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Storage error: {message}")]
    Database { message: String, is_retryable: bool },
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Validation(ValidationError),
    External(ExternalError),
    Infrastructure(InfrastructureError),
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub context: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn validation(error: ValidationError) -> Self {
        Self::new(AppErrorKind::Validation(error))
    }

    pub fn authentication(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::External(ExternalError::Authentication {
            provider: provider.into(),
            message: message.into(),
        }))
    }

    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        code: Option<String>,
        is_retryable: bool,
    ) -> Self {
        Self::new(AppErrorKind::External(ExternalError::PaymentProvider {
            provider: provider.into(),
            message: message.into(),
            code,
            is_retryable,
        }))
    }

    pub fn timeout(service: impl Into<String>, seconds: u64) -> Self {
        Self::new(AppErrorKind::External(ExternalError::Timeout {
            service: service.into(),
            seconds,
        }))
    }

    pub fn rate_limit(service: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self::new(AppErrorKind::External(ExternalError::RateLimit {
            service: service.into(),
            retry_after,
        }))
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: message.into(),
            },
        ))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.kind, AppErrorKind::Validation(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(
            self.kind,
            AppErrorKind::External(ExternalError::Authentication { .. })
        )
    }

    /// Whether repeating the same operation later may succeed.
    ///
    /// Callers decide if they actually retry: initiation is never repeated
    /// automatically because a second push prompts the payer again.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Validation(_) => false,
            AppErrorKind::External(ExternalError::Authentication { .. }) => true,
            AppErrorKind::External(ExternalError::PaymentProvider { is_retryable, .. }) => {
                *is_retryable
            }
            AppErrorKind::External(ExternalError::Timeout { .. }) => true,
            AppErrorKind::External(ExternalError::RateLimit { .. }) => true,
            AppErrorKind::Infrastructure(InfrastructureError::Configuration { .. }) => false,
            AppErrorKind::Infrastructure(InfrastructureError::Database { is_retryable, .. }) => {
                *is_retryable
            }
        }
    }

    /// Provider result code attached to a provider-reported failure, if any.
    pub fn provider_code(&self) -> Option<&str> {
        match &self.kind {
            AppErrorKind::External(ExternalError::PaymentProvider { code, .. }) => code.as_deref(),
            _ => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.kind {
            AppErrorKind::Validation(_) => StatusCode::BAD_REQUEST,
            AppErrorKind::External(ExternalError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            AppErrorKind::External(ExternalError::RateLimit { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AppErrorKind::External(_) => StatusCode::BAD_GATEWAY,
            AppErrorKind::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the website's visitors.
    pub fn public_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Validation(e) => e.to_string(),
            AppErrorKind::External(ExternalError::PaymentProvider { message, .. }) => {
                format!("Payment could not be completed: {}", message)
            }
            AppErrorKind::External(ExternalError::Timeout { .. }) => {
                "Payment provider did not respond in time. Please try again.".to_string()
            }
            AppErrorKind::External(ExternalError::RateLimit { .. }) => {
                "Too many payment requests. Please try again shortly.".to_string()
            }
            AppErrorKind::External(ExternalError::Authentication { .. }) => {
                "Payment service is temporarily unavailable. Please try again.".to_string()
            }
            AppErrorKind::Infrastructure(_) => "Internal server error".to_string(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match &self.kind {
            AppErrorKind::Validation(e) => e.to_string(),
            AppErrorKind::External(e) => e.to_string(),
            AppErrorKind::Infrastructure(e) => e.to_string(),
        };

        if let Some(context) = &self.context {
            write!(f, "{} ({})", message, context)
        } else {
            write!(f, "{}", message)
        }
    }
}

impl std::error::Error for AppError {}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::validation(err)
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            is_retryable: err.is_retryable(),
            message: err.to_string(),
        }))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = json!({
            "success": false,
            "error": self.public_message(),
        });
        if let Some(code) = self.provider_code() {
            body["provider_code"] = json!(code);
        }
        (status, Json(body)).into_response()
    }
}
