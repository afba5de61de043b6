//! Payment-specific error types.
//!
//! Every failure in the payment core is a typed variant so that callers can
//! decide whether to retry, acknowledge a callback, or surface the error.

use thiserror::Error;

use super::types::{Gateway, PaymentStatus};

/// Errors produced by gateway adapters, the callback verifier and the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    // Callback authentication
    /// The callback signature was missing or did not match.
    #[error("Invalid {gateway} callback signature")]
    InvalidSignature { gateway: Gateway },
    /// An authenticated callback whose payload could not be understood.
    #[error("Invalid {gateway} callback payload: {message}")]
    InvalidPayload { gateway: Gateway, message: String },
    /// The callback refers to an attempt that already reached a terminal state.
    #[error("Duplicate callback for '{merchant_transaction_id}', already {status}")]
    DuplicateCallback {
        merchant_transaction_id: String,
        status: PaymentStatus,
    },

    // Gateway calls
    /// Network failure or timeout talking to the gateway.
    #[error("Gateway {gateway} unreachable: {message}")]
    GatewayUnreachable { gateway: Gateway, message: String },
    /// The gateway answered, but with an error or an unusable body.
    #[error(
        "Gateway {gateway} rejected the request: {message}{}",
        rejection_details(.code, .http_status)
    )]
    GatewayRejected {
        gateway: Gateway,
        message: String,
        code: Option<String>,
        http_status: Option<u16>,
        raw_body: String,
    },
    /// No adapter is registered for the requested gateway.
    #[error("Unsupported gateway: {gateway}")]
    UnsupportedGateway { gateway: String },

    // Ledger
    /// A concurrent writer changed the same record first.
    #[error("Concurrent ledger modification for '{key}'")]
    LedgerConflict { key: String },
    /// No attempt exists with this transaction id.
    #[error("Payment attempt not found: {merchant_transaction_id}")]
    AttemptNotFound { merchant_transaction_id: String },
    /// An attempt with this transaction id was already created.
    #[error("Payment attempt '{merchant_transaction_id}' already exists")]
    DuplicateAttempt { merchant_transaction_id: String },
    /// A state change that would move a payment backwards or out of a terminal state.
    #[error("Invalid payment transition {from} -> {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// The user has no active subscription to act on.
    #[error("No active subscription for '{user_id}'")]
    NoActiveSubscription { user_id: String },

    // General
    /// A request field failed validation.
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },
    /// The backing store failed.
    #[error("Payment storage error: {message}")]
    Storage { message: String },
}

fn rejection_details(code: &Option<String>, http_status: &Option<u16>) -> String {
    let mut details = String::new();
    if let Some(code) = code {
        details.push_str(&format!(" (code: {})", code));
    }
    if let Some(status) = http_status {
        details.push_str(&format!(" [HTTP {}]", status));
    }
    details
}

impl PaymentError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn rejected(gateway: Gateway, message: impl Into<String>, raw_body: impl Into<String>) -> Self {
        Self::GatewayRejected {
            gateway,
            message: message.into(),
            code: None,
            http_status: None,
            raw_body: raw_body.into(),
        }
    }

    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature { .. }
                | Self::InvalidPayload { .. }
                | Self::UnsupportedGateway { .. }
                | Self::AttemptNotFound { .. }
                | Self::DuplicateAttempt { .. }
                | Self::InvalidTransition { .. }
                | Self::NoActiveSubscription { .. }
                | Self::Validation { .. }
        )
    }

    /// Check if retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::GatewayUnreachable { .. } | Self::LedgerConflict { .. } => true,
            Self::GatewayRejected { http_status, .. } => {
                matches!(http_status, Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }

    /// Whether a callback that hit this error should still be acknowledged
    /// to the gateway, so it stops redelivering.
    #[must_use]
    pub fn is_acknowledgeable(&self) -> bool {
        matches!(self, Self::DuplicateCallback { .. })
    }
}

/// Result alias for the payment core.
pub type Result<T> = std::result::Result<T, PaymentError>;
