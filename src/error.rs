use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::collections::HashMap;

use crate::payments::PaymentError;

/// The main error type for the HTTP surface
#[derive(Debug, thiserror::Error)]
pub enum CarepayError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// An upstream gateway answered with a failure.
    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(String),
}

/// Error context for additional error information
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Unique error ID for tracking
    pub error_id: Option<String>,
    pub details: Option<String>,
    /// Field-specific validation errors
    pub field_errors: HashMap<String, Vec<String>>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_id(mut self, id: impl Into<String>) -> Self {
        self.error_id = Some(id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details = Some(detail.into());
        self
    }

    pub fn with_field_error(mut self, field: impl Into<String>, error: impl Into<String>) -> Self {
        self.field_errors
            .entry(field.into())
            .or_default()
            .push(error.into());
        self
    }
}

/// Error with attached context
#[derive(Debug)]
pub struct ErrorWithContext {
    error: CarepayError,
    context: ErrorContext,
}

impl ErrorWithContext {
    pub fn new(error: CarepayError, context: ErrorContext) -> Self {
        Self { error, context }
    }

    pub fn error(&self) -> &CarepayError {
        &self.error
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }
}

impl std::fmt::Display for ErrorWithContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(ref details) = self.context.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorWithContext {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<ErrorWithContext> for CarepayError {
    fn from(err: ErrorWithContext) -> Self {
        err.error
    }
}

impl IntoResponse for ErrorWithContext {
    fn into_response(self) -> Response {
        self.error.into_response_with_context(Some(self.context))
    }
}

/// Standard error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<HashMap<String, Vec<String>>>,
}

impl CarepayError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn with_context(self, context: ErrorContext) -> ErrorWithContext {
        ErrorWithContext::new(self, context)
    }

    /// Convert to a response, attaching `context` when given.
    ///
    /// 5xx bodies never carry the internal message; it is logged with the
    /// error id instead.
    pub fn into_response_with_context(self, context: Option<ErrorContext>) -> Response {
        let status = self.status_code();
        let context = context.unwrap_or_default();

        let error_id = context
            .error_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let response = ErrorResponse {
            error: self.safe_message(),
            error_id: error_id.clone(),
            details: context.details,
            field_errors: (!context.field_errors.is_empty()).then_some(context.field_errors),
        };

        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request failed"
            );
        } else {
            tracing::debug!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request rejected"
            );
        }

        (status, Json(response)).into_response()
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            #[cfg(feature = "database")]
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Client errors keep their message; server errors get a generic one.
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Unauthorized(msg) => format!("Unauthorized: {}", msg),
            Self::Conflict(msg) => format!("Conflict: {}", msg),
            Self::RequestTimeout => "Request timeout".to_string(),

            Self::BadGateway(_) => "Payment gateway rejected the request".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),
            #[cfg(feature = "database")]
            Self::Database(_) => "Database error".to_string(),
        }
    }
}

impl IntoResponse for CarepayError {
    fn into_response(self) -> Response {
        self.into_response_with_context(None)
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, CarepayError>;

impl From<PaymentError> for CarepayError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidSignature { .. } => {
                CarepayError::Unauthorized("callback signature verification failed".to_string())
            }
            PaymentError::GatewayUnreachable { .. } => CarepayError::ServiceUnavailable(err.to_string()),
            PaymentError::GatewayRejected { .. } => CarepayError::BadGateway(err.to_string()),
            PaymentError::LedgerConflict { .. } | PaymentError::DuplicateAttempt { .. } => {
                CarepayError::Conflict(err.to_string())
            }
            PaymentError::AttemptNotFound { .. } | PaymentError::NoActiveSubscription { .. } => {
                CarepayError::NotFound(err.to_string())
            }
            PaymentError::Storage { message } => CarepayError::Internal(message),
            PaymentError::InvalidPayload { .. }
            | PaymentError::DuplicateCallback { .. }
            | PaymentError::UnsupportedGateway { .. }
            | PaymentError::InvalidTransition { .. }
            | PaymentError::Validation { .. } => CarepayError::BadRequest(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CarepayError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CarepayError::BadRequest(format!("JSON error: {}", err))
        } else {
            CarepayError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

#[cfg(feature = "database")]
impl From<sea_orm::DbErr> for CarepayError {
    fn from(err: sea_orm::DbErr) -> Self {
        CarepayError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::{Gateway, PaymentStatus};
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn payment_errors_map_to_status_codes() {
        let cases = [
            (
                PaymentError::InvalidSignature { gateway: Gateway::HostedCheckout },
                StatusCode::UNAUTHORIZED,
            ),
            (
                PaymentError::GatewayUnreachable {
                    gateway: Gateway::ChecksumQr,
                    message: "timed out".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                PaymentError::rejected(Gateway::ChecksumQr, "bad", "<html/>"),
                StatusCode::BAD_GATEWAY,
            ),
            (PaymentError::LedgerConflict { key: "MT1".to_string() }, StatusCode::CONFLICT),
            (
                PaymentError::AttemptNotFound { merchant_transaction_id: "MT1".to_string() },
                StatusCode::NOT_FOUND,
            ),
            (PaymentError::validation("amount", "zero"), StatusCode::BAD_REQUEST),
            (
                PaymentError::InvalidTransition {
                    from: PaymentStatus::Completed,
                    to: PaymentStatus::Failed,
                },
                StatusCode::BAD_REQUEST,
            ),
            (PaymentError::storage("disk"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (payment_error, expected) in cases {
            assert_eq!(CarepayError::from(payment_error).status_code(), expected);
        }
    }

    #[tokio::test]
    async fn server_errors_hide_details() {
        let response = CarepayError::internal("connection string postgres://secret").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
        assert!(json["error_id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn rejected_gateway_body_is_not_echoed() {
        let err: CarepayError = PaymentError::rejected(Gateway::ChecksumQr, "bad", "<html>secret</html>").into();
        let json = body_json(err.into_response()).await;
        assert!(!json["error"].as_str().unwrap().contains("secret"));
    }

    #[tokio::test]
    async fn client_errors_keep_message_and_context() {
        let response = CarepayError::bad_request("amount must be positive")
            .with_context(
                ErrorContext::new()
                    .with_error_id("err-1")
                    .with_field_error("amount_minor_units", "must be at least 1"),
            )
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Bad request: amount must be positive");
        assert_eq!(json["error_id"], "err-1");
        assert_eq!(json["field_errors"]["amount_minor_units"][0], "must be at least 1");
    }

    #[test]
    fn json_errors_are_bad_requests() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(CarepayError::from(err), CarepayError::BadRequest(_)));
    }
}
