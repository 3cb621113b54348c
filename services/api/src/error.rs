//! services/api/src/error.rs
//!
//! Defines the error types for the API service: `ApiError` for process-level
//! failures and `BookingError` for everything a request handler can return.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use booking_core::policy::PolicyViolation;
use booking_core::ports::PortError;
use serde::Serialize;
use tracing::error;

use crate::config::ConfigError;

/// The primary process-level error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents a failure while running the embedded migrations.
    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

/// Errors returned by the booking operations and their HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("{0}")]
    Validation(String),

    #[error("Individual session price is not configured for psychologist {0}")]
    PriceNotConfigured(uuid::Uuid),

    #[error("{0}")]
    NotFound(String),

    #[error("Payment {0} not found")]
    PaymentNotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Authentication required")]
    Unauthenticated,

    /// The slot was taken. When money was already captured it is kept as a credit.
    #[error("{message}")]
    Conflict {
        message: String,
        credit_transaction_id: Option<String>,
    },

    #[error("Payment callback signature is invalid")]
    InvalidSignature,

    /// A third-party call failed on a path where the caller asked for it explicitly.
    #[error("{0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BookingError {
    pub fn conflict(message: impl Into<String>) -> Self {
        BookingError::Conflict {
            message: message.into(),
            credit_transaction_id: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            BookingError::Validation(_) | BookingError::PriceNotConfigured(_) => {
                StatusCode::BAD_REQUEST
            }
            BookingError::NotFound(_) | BookingError::PaymentNotFound(_) => StatusCode::NOT_FOUND,
            BookingError::Forbidden(_) => StatusCode::FORBIDDEN,
            BookingError::Unauthenticated | BookingError::InvalidSignature => {
                StatusCode::UNAUTHORIZED
            }
            BookingError::Conflict { .. } => StatusCode::CONFLICT,
            BookingError::Upstream(_) | BookingError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "VALIDATION_ERROR",
            BookingError::PriceNotConfigured(_) => "PRICE_NOT_CONFIGURED",
            BookingError::NotFound(_) => "NOT_FOUND",
            BookingError::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            BookingError::Forbidden(_) => "FORBIDDEN",
            BookingError::Unauthenticated => "UNAUTHORIZED",
            BookingError::Conflict { .. } => "SLOT_CONFLICT",
            BookingError::InvalidSignature => "INVALID_SIGNATURE",
            BookingError::Upstream(_) => "UPSTREAM_ERROR",
            BookingError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<PortError> for BookingError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::NotFound(what) => BookingError::NotFound(what),
            PortError::Conflict(what) => BookingError::conflict(what),
            PortError::Unauthorized => BookingError::Unauthenticated,
            PortError::Unexpected(what) => BookingError::Internal(what),
        }
    }
}

impl From<PolicyViolation> for BookingError {
    fn from(v: PolicyViolation) -> Self {
        BookingError::Validation(v.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    credit_transaction_id: Option<String>,
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Internal details stay in the logs.
            BookingError::Internal(detail) => {
                error!("Request failed: {}", detail);
                "Something went wrong. Please try again.".to_string()
            }
            other => other.to_string(),
        };
        let credit_transaction_id = match &self {
            BookingError::Conflict {
                credit_transaction_id,
                ..
            } => credit_transaction_id.clone(),
            _ => None,
        };
        let body = ErrorBody {
            code: self.code(),
            message,
            credit_transaction_id,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_errors_map_onto_http_statuses() {
        let cases = [
            (PortError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (PortError::Conflict("x".into()), StatusCode::CONFLICT),
            (PortError::Unauthorized, StatusCode::UNAUTHORIZED),
            (PortError::Unexpected("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (port, status) in cases {
            assert_eq!(BookingError::from(port).status(), status);
        }
    }

    #[test]
    fn missing_price_is_a_client_error() {
        let err = BookingError::PriceNotConfigured(uuid::Uuid::nil());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "PRICE_NOT_CONFIGURED");
    }
}
