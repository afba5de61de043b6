//! Inbound gateway callbacks.
//!
//! Order of operations for every delivery:
//!
//! 1. authenticate the raw body against the gateway's signature header
//! 2. parse it into a [`GatewayStatusReport`]
//! 3. apply the report through the shared settlement path
//!
//! A body that fails step 1 is never parsed, and nothing it claims is logged.

use serde::Serialize;
use std::sync::Arc;

use super::audit::{PaymentAuditEvent, PaymentAuditLogger};
use super::error::{PaymentError, Result};
use super::gateway::GatewayRegistry;
use super::settlement::{SettlementResult, Settler};
use super::store::PaymentStore;
use super::types::{Gateway, PaymentStatus};

const TARGET: &str = "carepay::payments::callback";

/// What a callback delivery did. Every variant is acknowledged to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallbackOutcome {
    /// The attempt moved to `status`.
    Applied {
        merchant_transaction_id: String,
        status: PaymentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        subscription_id: Option<String>,
    },
    /// The attempt was already terminal.
    Duplicate {
        merchant_transaction_id: String,
        status: PaymentStatus,
    },
    /// Authentic, but not an event that changes payment state.
    Ignored { event_type: String },
}

impl From<SettlementResult> for CallbackOutcome {
    fn from(result: SettlementResult) -> Self {
        match result {
            SettlementResult::Applied {
                attempt,
                subscription,
            } => Self::Applied {
                merchant_transaction_id: attempt.merchant_transaction_id,
                status: attempt.status,
                subscription_id: subscription.map(|s| s.id),
            },
            SettlementResult::Duplicate {
                merchant_transaction_id,
                status,
            } => Self::Duplicate {
                merchant_transaction_id,
                status,
            },
        }
    }
}

/// Authenticates and applies gateway callbacks.
#[derive(Clone)]
pub struct CallbackVerifier {
    gateways: GatewayRegistry,
    settler: Settler,
    audit: Arc<dyn PaymentAuditLogger>,
}

impl CallbackVerifier {
    pub fn new(
        gateways: GatewayRegistry,
        store: Arc<dyn PaymentStore>,
        audit: Arc<dyn PaymentAuditLogger>,
    ) -> Self {
        Self {
            gateways,
            settler: Settler::new(store, audit.clone()),
            audit,
        }
    }

    /// Name of the header `gateway` signs callbacks with.
    pub fn signature_header(&self, gateway: Gateway) -> Result<String> {
        Ok(self.gateways.get(gateway)?.signature_header().to_string())
    }

    /// Handle one callback delivery.
    ///
    /// `raw_body` must be the bytes exactly as received.
    pub async fn handle(
        &self,
        gateway: Gateway,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<CallbackOutcome> {
        let adapter = self.gateways.get(gateway)?;

        let event = match adapter.authenticate_callback(raw_body, signature) {
            Ok(event) => event,
            Err(e @ PaymentError::InvalidSignature { .. }) => {
                tracing::warn!(
                    target: "carepay::security",
                    gateway = %gateway,
                    signature_present = signature.is_some(),
                    body_len = raw_body.len(),
                    "Rejected callback with invalid signature"
                );
                self.audit
                    .log(PaymentAuditEvent::SignatureRejected { gateway })
                    .await;
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(target: TARGET, gateway = %gateway, error = %e, "Unusable callback");
                return Err(e);
            }
        };

        self.audit
            .log(PaymentAuditEvent::CallbackReceived {
                gateway,
                event_type: event.event_type.clone(),
            })
            .await;

        let Some(report) = event.report else {
            tracing::debug!(
                target: TARGET,
                gateway = %gateway,
                event_type = %event.event_type,
                "Ignoring callback without payment state"
            );
            return Ok(CallbackOutcome::Ignored {
                event_type: event.event_type,
            });
        };

        let outcome: CallbackOutcome = self.settler.apply(&report).await?.into();

        tracing::info!(
            target: TARGET,
            gateway = %gateway,
            merchant_transaction_id = %report.merchant_transaction_id,
            event_type = %event.event_type,
            outcome = ?outcome,
            "Callback processed"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::audit::test::RecordingAuditLogger;
    use crate::payments::gateway::checksum::test::{callback_payload, signed_callback};
    use crate::payments::gateway::hosted::test::{payment_link_event, sign_webhook};
    use crate::payments::gateway::transport::test::MockTransport;
    use crate::payments::gateway::{
        ChecksumGateway, ChecksumGatewayConfig, HostedCheckoutConfig, HostedCheckoutGateway,
    };
    use crate::payments::ledger::SubscriptionStatus;
    use crate::payments::store::InMemoryPaymentStore;
    use crate::payments::types::{BillingCycle, PaymentAttempt, PaymentAttemptDraft};
    use chrono::Utc;

    fn checksum_config() -> ChecksumGatewayConfig {
        ChecksumGatewayConfig::new("MERCHANTUAT", "salt", "1")
    }

    fn hosted_config() -> HostedCheckoutConfig {
        HostedCheckoutConfig::new("key", "secret", "whsec")
    }

    struct Harness {
        store: InMemoryPaymentStore,
        audit: RecordingAuditLogger,
        verifier: CallbackVerifier,
    }

    async fn harness() -> Harness {
        let store = InMemoryPaymentStore::new();
        let audit = RecordingAuditLogger::new();
        let transport = Arc::new(MockTransport::new());
        let gateways = GatewayRegistry::new()
            .with_adapter(Arc::new(ChecksumGateway::new(checksum_config(), transport.clone())))
            .with_adapter(Arc::new(HostedCheckoutGateway::new(hosted_config(), transport)));

        for (id, gateway) in [("MT1", Gateway::ChecksumQr), ("MT2", Gateway::HostedCheckout)] {
            let draft = PaymentAttemptDraft {
                merchant_transaction_id: id.to_string(),
                gateway,
                amount_minor_units: 49_900,
                currency: "INR".to_string(),
                user_id: "u1".to_string(),
                plan_id: "premium".to_string(),
                billing_cycle: BillingCycle::Monthly,
            };
            store
                .insert_attempt(&PaymentAttempt::from_draft(&draft, Utc::now()))
                .await
                .unwrap();
        }

        let verifier = CallbackVerifier::new(gateways, Arc::new(store.clone()), Arc::new(audit.clone()));
        Harness { store, audit, verifier }
    }

    #[tokio::test]
    async fn valid_checksum_callback_completes_and_grants() {
        let h = harness().await;
        let (body, sig) = signed_callback(
            &checksum_config(),
            &callback_payload("MERCHANTUAT", "MT1", "PAYMENT_SUCCESS", 49_900),
        );

        let outcome = h.verifier.handle(Gateway::ChecksumQr, body.as_bytes(), Some(&sig)).await.unwrap();
        assert!(matches!(
            outcome,
            CallbackOutcome::Applied { status: PaymentStatus::Completed, subscription_id: Some(_), .. }
        ));

        let attempt = h.store.get_attempt("MT1").await.unwrap().unwrap();
        assert_eq!(attempt.status, PaymentStatus::Completed);
        let sub = h.store.get_active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.funding_attempt_id, "MT1");
    }

    #[tokio::test]
    async fn replayed_callback_is_acknowledged_without_new_grant() {
        let h = harness().await;
        let (body, sig) = signed_callback(
            &checksum_config(),
            &callback_payload("MERCHANTUAT", "MT1", "PAYMENT_SUCCESS", 49_900),
        );

        h.verifier.handle(Gateway::ChecksumQr, body.as_bytes(), Some(&sig)).await.unwrap();
        let second = h.verifier.handle(Gateway::ChecksumQr, body.as_bytes(), Some(&sig)).await.unwrap();

        assert_eq!(
            second,
            CallbackOutcome::Duplicate {
                merchant_transaction_id: "MT1".to_string(),
                status: PaymentStatus::Completed,
            }
        );
        assert_eq!(h.store.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn forged_callback_changes_nothing() {
        let h = harness().await;
        let body = serde_json::json!({ "response": "eyJjb2RlIjoiUEFZTUVOVF9TVUNDRVNTIn0=" }).to_string();

        let err = h
            .verifier
            .handle(Gateway::ChecksumQr, body.as_bytes(), Some("0000###1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidSignature { gateway: Gateway::ChecksumQr }));

        let err = h.verifier.handle(Gateway::HostedCheckout, b"{}", None).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidSignature { gateway: Gateway::HostedCheckout }));

        assert_eq!(h.store.get_attempt("MT1").await.unwrap().unwrap().status, PaymentStatus::Initiated);
        assert_eq!(h.store.subscription_count().await, 0);
        assert_eq!(h.audit.kinds().await, vec!["signature_rejected", "signature_rejected"]);
    }

    #[tokio::test]
    async fn failed_hosted_callback_records_failure() {
        let h = harness().await;
        let body = payment_link_event("payment_link.cancelled", "MT2", 0);
        let sig = sign_webhook(&hosted_config(), &body);

        let outcome = h
            .verifier
            .handle(Gateway::HostedCheckout, body.as_bytes(), Some(&sig))
            .await
            .unwrap();
        assert!(matches!(outcome, CallbackOutcome::Applied { status: PaymentStatus::Failed, subscription_id: None, .. }));
        assert!(h.store.get_active_subscription("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn irrelevant_events_are_ignored() {
        let h = harness().await;
        let body = r#"{"event":"refund.processed","payload":{}}"#;
        let sig = sign_webhook(&hosted_config(), body);

        let outcome = h
            .verifier
            .handle(Gateway::HostedCheckout, body.as_bytes(), Some(&sig))
            .await
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::Ignored { event_type: "refund.processed".to_string() });
    }

    #[tokio::test]
    async fn callback_for_unknown_attempt_is_not_found() {
        let h = harness().await;
        let (body, sig) = signed_callback(
            &checksum_config(),
            &callback_payload("MERCHANTUAT", "MT404", "PAYMENT_SUCCESS", 49_900),
        );
        assert!(matches!(
            h.verifier.handle(Gateway::ChecksumQr, body.as_bytes(), Some(&sig)).await,
            Err(PaymentError::AttemptNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_success_and_failure_settle_once() {
        let h = harness().await;
        let (ok_body, ok_sig) = signed_callback(
            &checksum_config(),
            &callback_payload("MERCHANTUAT", "MT1", "PAYMENT_SUCCESS", 49_900),
        );
        let (fail_body, fail_sig) = signed_callback(
            &checksum_config(),
            &callback_payload("MERCHANTUAT", "MT1", "PAYMENT_ERROR", 49_900),
        );

        let (a, b) = tokio::join!(
            h.verifier.handle(Gateway::ChecksumQr, ok_body.as_bytes(), Some(&ok_sig)),
            h.verifier.handle(Gateway::ChecksumQr, fail_body.as_bytes(), Some(&fail_sig)),
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, CallbackOutcome::Applied { .. }))
            .count();
        let duplicates = outcomes
            .iter()
            .filter(|o| matches!(o, CallbackOutcome::Duplicate { .. }))
            .count();
        assert_eq!((applied, duplicates), (1, 1));

        let final_status = h.store.get_attempt("MT1").await.unwrap().unwrap().status;
        assert!(final_status.is_terminal());
        let subs = h.store.subscription_count().await;
        assert_eq!(subs, usize::from(final_status == PaymentStatus::Completed));
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(CallbackOutcome::Duplicate {
            merchant_transaction_id: "MT1".to_string(),
            status: PaymentStatus::Completed,
        })
        .unwrap();
        assert_eq!(json["outcome"], "duplicate");
        assert_eq!(json["status"], "COMPLETED");
    }
}
