//! Error types for Parley services
//!
//! Provides a single error taxonomy for the session engine with:
//! - Distinct variants for matching conflicts, protocol errors and stale events
//! - Transient/permanent classification used by the billing retry loop
//! - HTTP status code mapping
//! - Structured error responses with machine-readable codes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionStatus;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    MissingField,

    // Resource errors (4xxx)
    SessionNotFound,

    // Conflict errors (5xxx)
    RequesterBusy,
    ProviderBusy,
    InvalidTransition,
    SessionNotActive,
    NotAParty,
    VersionConflict,

    // Rate limiting (6xxx)
    RateLimited,

    // Store errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External service errors (8xxx)
    WalletError,
    PricingError,
    CacheError,
    Timeout,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::MissingField => 1002,

            ErrorCode::SessionNotFound => 4001,

            ErrorCode::RequesterBusy => 5001,
            ErrorCode::ProviderBusy => 5002,
            ErrorCode::InvalidTransition => 5003,
            ErrorCode::SessionNotActive => 5004,
            ErrorCode::NotAParty => 5005,
            ErrorCode::VersionConflict => 5006,

            ErrorCode::RateLimited => 6001,

            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            ErrorCode::WalletError => 8001,
            ErrorCode::PricingError => 8002,
            ErrorCode::CacheError => 8003,
            ErrorCode::Timeout => 8004,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Required field missing: {field}")]
    MissingField { field: String },

    // Resource errors
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    // Matching conflicts
    #[error("Requester {requester_id} is busy in another session")]
    RequesterBusy { requester_id: String },

    #[error("Provider {provider_id} is busy in another session")]
    ProviderBusy { provider_id: String },

    // Protocol errors
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Session {id} is not active (status {status})")]
    SessionNotActive { id: String, status: SessionStatus },

    #[error("Party {party_id} does not belong to session {session_id}")]
    NotAParty {
        session_id: String,
        party_id: String,
    },

    #[error("Session {id} was modified concurrently (expected version {expected})")]
    VersionConflict { id: String, expected: i64 },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // Store errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External service errors
    #[error("Wallet ledger error: {message}")]
    Wallet { message: String },

    #[error("Pricing service error: {message}")]
    Pricing { message: String },

    #[error("Cache error: {message}")]
    CacheError { message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::MissingField { .. } => ErrorCode::MissingField,
            AppError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            AppError::RequesterBusy { .. } => ErrorCode::RequesterBusy,
            AppError::ProviderBusy { .. } => ErrorCode::ProviderBusy,
            AppError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            AppError::SessionNotActive { .. } => ErrorCode::SessionNotActive,
            AppError::NotAParty { .. } => ErrorCode::NotAParty,
            AppError::VersionConflict { .. } => ErrorCode::VersionConflict,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::Wallet { .. } => ErrorCode::WalletError,
            AppError::Pricing { .. } => ErrorCode::PricingError,
            AppError::CacheError { .. } => ErrorCode::CacheError,
            AppError::Timeout { .. } => ErrorCode::Timeout,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } | AppError::MissingField { .. } => StatusCode::BAD_REQUEST,

            // 403 Forbidden
            AppError::NotAParty { .. } => StatusCode::FORBIDDEN,

            // 404 Not Found
            AppError::SessionNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::RequesterBusy { .. }
            | AppError::ProviderBusy { .. }
            | AppError::SessionNotActive { .. }
            | AppError::VersionConflict { .. } => StatusCode::CONFLICT,

            // 422 Unprocessable Entity
            AppError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::Wallet { .. } | AppError::Pricing { .. } => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::CacheError { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Whether a retry of the same operation may succeed.
    ///
    /// Only the billing scheduler acts on this; user-facing calls surface
    /// every failure immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Timeout { .. }
                | AppError::DatabaseConnection { .. }
                | AppError::VersionConflict { .. }
                | AppError::Wallet { .. }
                | AppError::Pricing { .. }
                | AppError::CacheError { .. }
        )
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn from_error(err: &AppError) -> Self {
        Self {
            error: ErrorDetails {
                code: err.code(),
                message: err.to_string(),
                details: None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        if self.is_server_error() {
            tracing::error!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        (status, Json(ErrorResponse::from_error(&self))).into_response()
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::CacheError {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_errors_are_conflicts() {
        let err = AppError::RequesterBusy {
            requester_id: "r-1".into(),
        };
        assert_eq!(err.code(), ErrorCode::RequesterBusy);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(err.to_string().contains("r-1"));

        let err = AppError::ProviderBusy {
            provider_id: "p-1".into(),
        };
        assert_eq!(err.code().as_code(), 5002);
        assert!(err.is_client_error());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = AppError::InvalidTransition {
            from: SessionStatus::Pending,
            to: SessionStatus::Active,
        };
        assert_eq!(err.to_string(), "Invalid transition from pending to active");
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        let timeout = AppError::Timeout {
            operation: "wallet debit".into(),
            timeout_ms: 2000,
        };
        assert!(timeout.is_transient());
        assert!(timeout.is_server_error());

        let stale = AppError::SessionNotActive {
            id: "s".into(),
            status: SessionStatus::Ended,
        };
        assert!(!stale.is_transient());
    }
}
