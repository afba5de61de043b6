//! Audit trail for payment operations.
//!
//! Every state change in the payment core emits a [`PaymentAuditEvent`].
//! The default sink writes them to `tracing`; signature failures go to the
//! `carepay::security` target at WARN so they can be alerted on separately.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

use super::types::{Gateway, PaymentStatus};

/// Audit event types for payment operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentAuditEvent {
    /// An attempt was recorded and sent to the gateway.
    AttemptInitiated {
        merchant_transaction_id: String,
        gateway: Gateway,
        user_id: String,
        amount_minor_units: u64,
    },
    /// The gateway refused or could not be reached during initiation.
    InitiationFailed {
        merchant_transaction_id: String,
        gateway: Gateway,
        error: String,
    },
    /// An authenticated callback arrived.
    CallbackReceived { gateway: Gateway, event_type: String },
    /// A callback failed signature verification.
    SignatureRejected { gateway: Gateway },
    /// An attempt changed status.
    AttemptSettled {
        merchant_transaction_id: String,
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// A callback or poll arrived for an already-terminal attempt.
    DuplicateDelivery {
        merchant_transaction_id: String,
        status: PaymentStatus,
    },
    /// The gateway reported a different amount than was requested.
    AmountMismatch {
        merchant_transaction_id: String,
        expected: u64,
        reported: u64,
    },
    /// A completed payment opened a subscription period.
    SubscriptionGranted {
        user_id: String,
        plan_slug: String,
        funding_attempt_id: String,
        period_end: DateTime<Utc>,
    },
    /// A subscription was cancelled, now or at the end of its period.
    SubscriptionCancelled {
        user_id: String,
        subscription_id: String,
        at_period_end: bool,
    },
    /// A pending end-of-period cancellation was withdrawn.
    SubscriptionResumed {
        user_id: String,
        subscription_id: String,
    },
}

impl PaymentAuditEvent {
    /// Event kind as a string for structured logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AttemptInitiated { .. } => "attempt_initiated",
            Self::InitiationFailed { .. } => "initiation_failed",
            Self::CallbackReceived { .. } => "callback_received",
            Self::SignatureRejected { .. } => "signature_rejected",
            Self::AttemptSettled { .. } => "attempt_settled",
            Self::DuplicateDelivery { .. } => "duplicate_delivery",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::SubscriptionGranted { .. } => "subscription_granted",
            Self::SubscriptionCancelled { .. } => "subscription_cancelled",
            Self::SubscriptionResumed { .. } => "subscription_resumed",
        }
    }
}

impl fmt::Display for PaymentAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttemptInitiated {
                merchant_transaction_id,
                gateway,
                user_id,
                amount_minor_units,
            } => write!(
                f,
                "Attempt initiated: txn={}, gateway={}, user={}, amount={}",
                merchant_transaction_id, gateway, user_id, amount_minor_units
            ),
            Self::InitiationFailed {
                merchant_transaction_id,
                gateway,
                error,
            } => write!(
                f,
                "Initiation failed: txn={}, gateway={}, error={}",
                merchant_transaction_id, gateway, error
            ),
            Self::CallbackReceived { gateway, event_type } => {
                write!(f, "Callback received: gateway={}, type={}", gateway, event_type)
            }
            Self::SignatureRejected { gateway } => {
                write!(f, "Callback signature rejected: gateway={}", gateway)
            }
            Self::AttemptSettled {
                merchant_transaction_id,
                from,
                to,
            } => write!(
                f,
                "Attempt settled: txn={}, {} -> {}",
                merchant_transaction_id, from, to
            ),
            Self::DuplicateDelivery {
                merchant_transaction_id,
                status,
            } => write!(
                f,
                "Duplicate delivery: txn={}, already {}",
                merchant_transaction_id, status
            ),
            Self::AmountMismatch {
                merchant_transaction_id,
                expected,
                reported,
            } => write!(
                f,
                "Amount mismatch: txn={}, expected={}, reported={}",
                merchant_transaction_id, expected, reported
            ),
            Self::SubscriptionGranted {
                user_id,
                plan_slug,
                funding_attempt_id,
                period_end,
            } => write!(
                f,
                "Subscription granted: user={}, plan={}, funded_by={}, until={}",
                user_id, plan_slug, funding_attempt_id, period_end
            ),
            Self::SubscriptionCancelled {
                user_id,
                subscription_id,
                at_period_end,
            } => write!(
                f,
                "Subscription cancelled: user={}, sub={}, at_period_end={}",
                user_id, subscription_id, at_period_end
            ),
            Self::SubscriptionResumed {
                user_id,
                subscription_id,
            } => write!(
                f,
                "Subscription resumed: user={}, sub={}",
                user_id, subscription_id
            ),
        }
    }
}

/// Trait for audit logging backends.
#[async_trait]
pub trait PaymentAuditLogger: Send + Sync {
    /// Record an event. Must not fail the surrounding operation.
    async fn log(&self, event: PaymentAuditEvent);
}

/// Audit logger that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl PaymentAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: PaymentAuditEvent) {}
}

/// Audit logger that writes to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl PaymentAuditLogger for TracingAuditLogger {
    async fn log(&self, event: PaymentAuditEvent) {
        match &event {
            PaymentAuditEvent::SignatureRejected { .. } => {
                tracing::warn!(target: "carepay::security", event_type = event.kind(), "{}", event);
            }
            PaymentAuditEvent::AmountMismatch { .. } | PaymentAuditEvent::InitiationFailed { .. } => {
                tracing::warn!(target: "carepay::payments::audit", event_type = event.kind(), "{}", event);
            }
            _ => {
                tracing::info!(target: "carepay::payments::audit", event_type = event.kind(), "{}", event);
            }
        }
    }
}

#[cfg(any(test, feature = "test-payments"))]
pub mod test {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Captures events for assertions.
    #[derive(Clone, Default)]
    pub struct RecordingAuditLogger {
        events: Arc<Mutex<Vec<PaymentAuditEvent>>>,
    }

    impl RecordingAuditLogger {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn events(&self) -> Vec<PaymentAuditEvent> {
            self.events.lock().await.clone()
        }

        pub async fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().await.iter().map(PaymentAuditEvent::kind).collect()
        }
    }

    #[async_trait]
    impl PaymentAuditLogger for RecordingAuditLogger {
        async fn log(&self, event: PaymentAuditEvent) {
            self.events.lock().await.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::RecordingAuditLogger;
    use super::*;

    #[tokio::test]
    async fn recording_logger_keeps_order() {
        let logger = RecordingAuditLogger::new();
        logger
            .log(PaymentAuditEvent::SignatureRejected {
                gateway: Gateway::HostedCheckout,
            })
            .await;
        logger
            .log(PaymentAuditEvent::DuplicateDelivery {
                merchant_transaction_id: "MT1".to_string(),
                status: PaymentStatus::Completed,
            })
            .await;

        assert_eq!(logger.kinds().await, vec!["signature_rejected", "duplicate_delivery"]);
    }

    #[tokio::test]
    async fn tracing_and_noop_loggers_accept_events() {
        let event = PaymentAuditEvent::AttemptSettled {
            merchant_transaction_id: "MT1".to_string(),
            from: PaymentStatus::Initiated,
            to: PaymentStatus::Completed,
        };
        TracingAuditLogger.log(event.clone()).await;
        NoOpAuditLogger.log(event).await;
    }

    #[test]
    fn display_names_the_transaction() {
        let event = PaymentAuditEvent::AmountMismatch {
            merchant_transaction_id: "MT9".to_string(),
            expected: 49_900,
            reported: 100,
        };
        let display = event.to_string();
        assert!(display.contains("MT9"));
        assert!(display.contains("49900"));
        assert!(display.contains("100"));
    }
}
