//! Payment orchestration: pricing, initiation and status polling.

use chrono::Utc;
use std::sync::Arc;

use super::audit::{PaymentAuditEvent, PaymentAuditLogger};
use super::error::{PaymentError, Result};
use super::gateway::{GatewayRegistry, InitiatedPayment};
use super::plans::{Plans, PriceQuote};
use super::settlement::{SettlementResult, Settler};
use super::store::PaymentStore;
use super::types::{
    BillingCycle, CheckoutRequest, PaymentAttempt, PaymentAttemptDraft, PaymentStatus,
    validate_transaction_id,
};

const TARGET: &str = "carepay::payments::service";

/// Entry point for starting payments and checking on them.
///
/// Initiation only ever records `Initiated`. Attempts reach a terminal state
/// through a verified callback or through [`poll_status`](Self::poll_status).
/// Every amount charged comes from the plan catalog.
#[derive(Clone)]
pub struct PaymentService {
    gateways: GatewayRegistry,
    store: Arc<dyn PaymentStore>,
    settler: Settler,
    audit: Arc<dyn PaymentAuditLogger>,
    plans: Arc<Plans>,
}

impl PaymentService {
    pub fn new(
        gateways: GatewayRegistry,
        store: Arc<dyn PaymentStore>,
        audit: Arc<dyn PaymentAuditLogger>,
    ) -> Self {
        Self {
            settler: Settler::new(store.clone(), audit.clone()),
            gateways,
            store,
            audit,
            plans: Arc::new(Plans::new()),
        }
    }

    #[must_use]
    pub fn with_plans(mut self, plans: Plans) -> Self {
        self.plans = Arc::new(plans);
        self
    }

    #[must_use]
    pub fn plans(&self) -> &Plans {
        &self.plans
    }

    /// The price `user_id` would pay for one period of `plan_id`.
    ///
    /// A user who has never held a subscription gets the plan's first-time
    /// price when one is configured.
    pub async fn quote(
        &self,
        user_id: &str,
        plan_id: &str,
        billing_cycle: BillingCycle,
    ) -> Result<PriceQuote> {
        let plan = self.plans.require(plan_id)?;
        let first_time = self.store.list_subscriptions(user_id).await?.is_empty();
        Ok(PriceQuote::for_plan(plan, billing_cycle, first_time))
    }

    /// Price the request from the catalog, then initiate it for `user_id`.
    pub async fn checkout(
        &self,
        user_id: &str,
        request: &CheckoutRequest,
    ) -> Result<InitiatedPayment> {
        validate_transaction_id(&request.merchant_transaction_id)?;
        let quote = self
            .quote(user_id, &request.plan_id, request.billing_cycle)
            .await?;

        let draft = PaymentAttemptDraft {
            merchant_transaction_id: request.merchant_transaction_id.clone(),
            gateway: request.gateway,
            amount_minor_units: quote.amount_minor_units,
            currency: quote.currency,
            user_id: user_id.to_string(),
            plan_id: request.plan_id.clone(),
            billing_cycle: request.billing_cycle,
        };
        draft.validate()?;
        self.start(&draft).await
    }

    /// Initiate a fully specified draft.
    ///
    /// The draft's amount and currency must equal the catalog quote for its
    /// user, plan and cycle.
    pub async fn initiate(&self, draft: &PaymentAttemptDraft) -> Result<InitiatedPayment> {
        draft.validate()?;

        let quote = self
            .quote(&draft.user_id, &draft.plan_id, draft.billing_cycle)
            .await?;
        if draft.amount_minor_units != quote.amount_minor_units || draft.currency != quote.currency {
            tracing::warn!(
                target: TARGET,
                merchant_transaction_id = %draft.merchant_transaction_id,
                plan_id = %draft.plan_id,
                requested = draft.amount_minor_units,
                expected = quote.amount_minor_units,
                "Draft amount does not match the plan price"
            );
            return Err(PaymentError::validation(
                "amount_minor_units",
                format!(
                    "plan '{}' ({}) costs {} {}",
                    quote.plan_id, quote.billing_cycle, quote.amount_minor_units, quote.currency
                ),
            ));
        }

        self.start(draft).await
    }

    /// Record the attempt, then ask the gateway for a redirect target.
    ///
    /// The attempt row is written before the outbound call, so an attempt
    /// exists for every initiation even when the gateway call fails.
    async fn start(&self, draft: &PaymentAttemptDraft) -> Result<InitiatedPayment> {
        let adapter = self.gateways.get(draft.gateway)?;

        let attempt = PaymentAttempt::from_draft(draft, Utc::now());
        self.store.insert_attempt(&attempt).await?;

        match adapter.initiate(draft).await {
            Ok(initiated) => {
                self.audit
                    .log(PaymentAuditEvent::AttemptInitiated {
                        merchant_transaction_id: draft.merchant_transaction_id.clone(),
                        gateway: draft.gateway,
                        user_id: draft.user_id.clone(),
                        amount_minor_units: draft.amount_minor_units,
                    })
                    .await;
                Ok(initiated)
            }
            Err(e) => {
                tracing::warn!(
                    target: TARGET,
                    merchant_transaction_id = %draft.merchant_transaction_id,
                    gateway = %draft.gateway,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Payment initiation failed"
                );
                self.audit
                    .log(PaymentAuditEvent::InitiationFailed {
                        merchant_transaction_id: draft.merchant_transaction_id.clone(),
                        gateway: draft.gateway,
                        error: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Current status of an attempt, asking the gateway when it is not yet terminal.
    pub async fn poll_status(&self, merchant_transaction_id: &str) -> Result<PaymentStatus> {
        validate_transaction_id(merchant_transaction_id)?;

        let attempt = self.require_attempt(merchant_transaction_id).await?;
        if attempt.status.is_terminal() {
            return Ok(attempt.status);
        }

        let adapter = self.gateways.get(attempt.gateway)?;
        let report = adapter.poll_status(merchant_transaction_id).await?;

        tracing::debug!(
            target: TARGET,
            merchant_transaction_id,
            outcome = ?report.outcome,
            "Gateway status polled"
        );

        let result = self.settler.apply(&report).await?;
        if let SettlementResult::Applied { subscription: Some(sub), .. } = &result {
            tracing::info!(
                target: TARGET,
                merchant_transaction_id,
                subscription_id = %sub.id,
                "Status poll granted subscription"
            );
        }
        Ok(result.status())
    }

    pub async fn get_attempt(&self, merchant_transaction_id: &str) -> Result<Option<PaymentAttempt>> {
        self.store.get_attempt(merchant_transaction_id).await
    }

    /// All attempts for a user, newest first.
    pub async fn attempts_for_user(&self, user_id: &str) -> Result<Vec<PaymentAttempt>> {
        self.store.list_attempts_for_user(user_id).await
    }

    async fn require_attempt(&self, merchant_transaction_id: &str) -> Result<PaymentAttempt> {
        self.store
            .get_attempt(merchant_transaction_id)
            .await?
            .ok_or_else(|| PaymentError::AttemptNotFound {
                merchant_transaction_id: merchant_transaction_id.to_string(),
            })
    }
}
