//! Applying verified gateway reports to the ledger.
//!
//! Callbacks and status polls both end here, so there is exactly one code
//! path that moves an attempt to a terminal state.

use chrono::Utc;
use std::sync::Arc;

use super::audit::{PaymentAuditEvent, PaymentAuditLogger};
use super::error::{PaymentError, Result};
use super::gateway::GatewayStatusReport;
use super::ledger::{Subscription, SubscriptionGrant};
use super::store::{PaymentStore, Settlement};
use super::types::{PaymentAttempt, PaymentStatus};

const TARGET: &str = "carepay::payments::settlement";

/// A lost race is retried once before it is surfaced.
const MAX_SETTLE_ATTEMPTS: usize = 2;

/// What applying a report did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementResult {
    Applied {
        attempt: PaymentAttempt,
        subscription: Option<Subscription>,
    },
    /// The attempt was already terminal; nothing changed.
    Duplicate {
        merchant_transaction_id: String,
        status: PaymentStatus,
    },
}

impl SettlementResult {
    #[must_use]
    pub fn status(&self) -> PaymentStatus {
        match self {
            Self::Applied { attempt, .. } => attempt.status,
            Self::Duplicate { status, .. } => *status,
        }
    }
}

#[derive(Clone)]
pub(crate) struct Settler {
    store: Arc<dyn PaymentStore>,
    audit: Arc<dyn PaymentAuditLogger>,
}

impl Settler {
    pub(crate) fn new(store: Arc<dyn PaymentStore>, audit: Arc<dyn PaymentAuditLogger>) -> Self {
        Self { store, audit }
    }

    pub(crate) async fn apply(&self, report: &GatewayStatusReport) -> Result<SettlementResult> {
        let txn = report.merchant_transaction_id.as_str();

        for round in 1..=MAX_SETTLE_ATTEMPTS {
            let attempt = self
                .store
                .get_attempt(txn)
                .await?
                .ok_or_else(|| PaymentError::AttemptNotFound {
                    merchant_transaction_id: txn.to_string(),
                })?;

            if attempt.gateway != report.gateway {
                return Err(PaymentError::InvalidPayload {
                    gateway: report.gateway,
                    message: format!("attempt '{}' was made through {}", txn, attempt.gateway),
                });
            }

            if attempt.status.is_terminal() {
                return Ok(self.duplicate(txn, attempt.status).await);
            }

            let status = self.target_status(&attempt, report).await;
            let now = Utc::now();
            let settlement = Settlement {
                merchant_transaction_id: txn.to_string(),
                expected_status: attempt.status,
                status,
                raw_gateway_payload: report.raw_payload.clone(),
                grant: (status == PaymentStatus::Completed)
                    .then(|| SubscriptionGrant::for_attempt(&attempt, now)),
                settled_at: now,
            };

            match self.store.settle(settlement).await {
                Ok(outcome) => {
                    self.audit
                        .log(PaymentAuditEvent::AttemptSettled {
                            merchant_transaction_id: txn.to_string(),
                            from: attempt.status,
                            to: outcome.attempt.status,
                        })
                        .await;

                    if let Some(sub) = &outcome.subscription {
                        self.audit
                            .log(PaymentAuditEvent::SubscriptionGranted {
                                user_id: sub.user_id.clone(),
                                plan_slug: sub.plan_slug.clone(),
                                funding_attempt_id: sub.funding_attempt_id.clone(),
                                period_end: sub.current_period_end,
                            })
                            .await;
                    }

                    return Ok(SettlementResult::Applied {
                        attempt: outcome.attempt,
                        subscription: outcome.subscription,
                    });
                }
                Err(PaymentError::DuplicateCallback { status, .. }) => {
                    return Ok(self.duplicate(txn, status).await);
                }
                Err(PaymentError::LedgerConflict { .. }) if round < MAX_SETTLE_ATTEMPTS => {
                    tracing::warn!(
                        target: TARGET,
                        merchant_transaction_id = txn,
                        "Concurrent settlement, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(PaymentError::LedgerConflict {
            key: txn.to_string(),
        })
    }

    /// The status a report moves `attempt` to. A completed payment for the
    /// wrong amount is recorded as failed.
    async fn target_status(&self, attempt: &PaymentAttempt, report: &GatewayStatusReport) -> PaymentStatus {
        let status = report.outcome.status();
        if status != PaymentStatus::Completed {
            return status;
        }

        match report.amount_minor_units {
            Some(reported) if reported != attempt.amount_minor_units => {
                self.audit
                    .log(PaymentAuditEvent::AmountMismatch {
                        merchant_transaction_id: attempt.merchant_transaction_id.clone(),
                        expected: attempt.amount_minor_units,
                        reported,
                    })
                    .await;
                PaymentStatus::Failed
            }
            _ => status,
        }
    }

    async fn duplicate(&self, txn: &str, status: PaymentStatus) -> SettlementResult {
        self.audit
            .log(PaymentAuditEvent::DuplicateDelivery {
                merchant_transaction_id: txn.to_string(),
                status,
            })
            .await;
        SettlementResult::Duplicate {
            merchant_transaction_id: txn.to_string(),
            status,
        }
    }
}
