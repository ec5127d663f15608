use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::{error::DbErr, TransactionError};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Bad Request",
    "code": "out_of_stock",
    "message": "Out of stock: medicine 550e8400-e29b-41d4-a716-446655440000 has 1 available, 2 requested",
    "request_id": "req-abc123xyz",
    "timestamp": "2026-10-17T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Machine-readable reason the caller can branch on
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

/// Coarse classification used for logging and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed input, rejected before any side effect.
    Validation,
    /// Unknown medicine, coupon, order, payment or shipping method.
    NotFound,
    /// Illegal transition, exhausted/expired coupon, insufficient stock.
    StateConflict,
    /// Gateway amount mismatch or unverifiable webhook. Never auto-applied.
    ExternalIntegrity,
    /// Storage or network failure; retried by the caller.
    Infrastructure,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Out of stock: {0}")]
    OutOfStock(String),

    #[error("Invalid shipping method: {0}")]
    InvalidShippingMethod(String),

    #[error("Coupon not found: {0}")]
    CouponNotFound(String),

    #[error("Coupon expired: {0}")]
    CouponExpired(String),

    #[error("Coupon exhausted: {0}")]
    CouponExhausted(String),

    #[error("Coupon minimum not met: {0}")]
    CouponMinimumNotMet(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Order not payable: {0}")]
    OrderNotPayable(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Amount mismatch: {0}")]
    AmountMismatch(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<TransactionError<ServiceError>> for ServiceError {
    fn from(err: TransactionError<ServiceError>) -> Self {
        match err {
            TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
            TransactionError::Transaction(service_err) => service_err,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::ExternalServiceError(err.to_string())
    }
}

impl ServiceError {
    /// Wraps any database error.
    pub fn db_error(error: DbErr) -> Self {
        ServiceError::DatabaseError(error)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ValidationError(_) | Self::Unauthorized(_) | Self::Forbidden(_) => {
                ErrorCategory::Validation
            }
            Self::NotFound(_) | Self::CouponNotFound(_) => ErrorCategory::NotFound,
            Self::OutOfStock(_)
            | Self::InvalidShippingMethod(_)
            | Self::CouponExpired(_)
            | Self::CouponExhausted(_)
            | Self::CouponMinimumNotMet(_)
            | Self::InvalidStateTransition(_)
            | Self::OrderNotPayable(_)
            | Self::ConcurrentModification(_) => ErrorCategory::StateConflict,
            Self::AmountMismatch(_) | Self::InvalidSignature => ErrorCategory::ExternalIntegrity,
            Self::DatabaseError(_) | Self::ExternalServiceError(_) | Self::InternalError(_) => {
                ErrorCategory::Infrastructure
            }
        }
    }

    /// Stable snake_case code rendered in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::ValidationError(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::OutOfStock(_) => "out_of_stock",
            Self::InvalidShippingMethod(_) => "invalid_shipping_method",
            Self::CouponNotFound(_) => "coupon_not_found",
            Self::CouponExpired(_) => "coupon_expired",
            Self::CouponExhausted(_) => "coupon_exhausted",
            Self::CouponMinimumNotMet(_) => "coupon_minimum_not_met",
            Self::InvalidStateTransition(_) => "invalid_state_transition",
            Self::OrderNotPayable(_) => "order_not_payable",
            Self::ConcurrentModification(_) => "concurrent_modification",
            Self::AmountMismatch(_) => "amount_mismatch",
            Self::InvalidSignature => "invalid_signature",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::ExternalServiceError(_) => "external_service_error",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::OutOfStock(_)
            | Self::InvalidShippingMethod(_)
            | Self::CouponNotFound(_)
            | Self::CouponExpired(_)
            | Self::CouponExhausted(_)
            | Self::CouponMinimumNotMet(_)
            | Self::InvalidStateTransition(_)
            | Self::OrderNotPayable(_) => StatusCode::BAD_REQUEST,
            Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::AmountMismatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidSignature | Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Infrastructure errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            Self::ExternalServiceError(_) => "Payment gateway unavailable".to_string(),
            Self::ConcurrentModification(id) => {
                format!("Concurrent modification for ID {}", id)
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.category() == ErrorCategory::Infrastructure {
            tracing::error!(error = %self, "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
