//! Subscription ledger.
//!
//! Subscriptions are created only as a side effect of a completed payment
//! and are keyed by the attempt that funded them, so replaying the same
//! payment can never produce a second active period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::audit::{PaymentAuditEvent, PaymentAuditLogger};
use super::error::{PaymentError, Result};
use super::store::{GrantOutcome, PaymentStore};
use super::types::{BillingCycle, PaymentAttempt, PaymentStatus};

const TARGET: &str = "carepay::payments::ledger";

const SECONDS_PER_DAY: i64 = 86_400;

/// Subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "EXPIRED" => Ok(Self::Expired),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(PaymentError::storage(format!(
                "unknown subscription status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A paid access period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub plan_slug: String,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    /// The payment attempt that paid for this period.
    pub funding_attempt_id: String,
    /// Stays active until `current_period_end`, then expires without renewal.
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Active and inside its period at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && now < self.current_period_end
    }

    /// Days left in the period at `now`, counting a partial day as a whole
    /// one. Never negative.
    #[must_use]
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        let seconds = (self.current_period_end - now).num_seconds();
        if seconds <= 0 {
            return 0;
        }
        (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
    }
}

/// A request to open a new period, funded by one completed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionGrant {
    pub user_id: String,
    pub plan_slug: String,
    pub billing_cycle: BillingCycle,
    pub funding_attempt_id: String,
    pub granted_at: DateTime<Utc>,
}

impl SubscriptionGrant {
    #[must_use]
    pub fn for_attempt(attempt: &PaymentAttempt, granted_at: DateTime<Utc>) -> Self {
        Self {
            user_id: attempt.user_id.clone(),
            plan_slug: attempt.plan_id.clone(),
            billing_cycle: attempt.billing_cycle,
            funding_attempt_id: attempt.merchant_transaction_id.clone(),
            granted_at,
        }
    }

    /// The active record this grant creates. The period starts at grant time.
    #[must_use]
    pub fn to_subscription(&self) -> Subscription {
        Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id.clone(),
            plan_slug: self.plan_slug.clone(),
            billing_cycle: self.billing_cycle,
            status: SubscriptionStatus::Active,
            current_period_start: self.granted_at,
            current_period_end: self.granted_at + self.billing_cycle.period(),
            funding_attempt_id: self.funding_attempt_id.clone(),
            cancel_at_period_end: false,
            cancelled_at: None,
            created_at: self.granted_at,
            updated_at: self.granted_at,
        }
    }
}

/// Read-side summary of a user's subscription state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSummary {
    pub is_active: bool,
    pub is_expired: bool,
    pub is_cancelled: bool,
    /// Active now, but will not continue past the current period.
    pub cancel_at_period_end: bool,
    pub days_until_expiry: i64,
    /// No active period, but there is history to renew from.
    pub can_renew: bool,
    pub subscription: Option<Subscription>,
}

/// Owns subscription state transitions.
#[derive(Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn PaymentStore>,
    audit: Arc<dyn PaymentAuditLogger>,
}

impl SubscriptionLedger {
    pub fn new(store: Arc<dyn PaymentStore>, audit: Arc<dyn PaymentAuditLogger>) -> Self {
        Self { store, audit }
    }

    /// Open a period for a completed payment.
    ///
    /// Calling this again for the same `funding_attempt_id` returns the
    /// subscription it already created.
    pub async fn grant(
        &self,
        user_id: &str,
        plan_slug: &str,
        billing_cycle: BillingCycle,
        funding_attempt_id: &str,
    ) -> Result<Subscription> {
        let attempt = self
            .store
            .get_attempt(funding_attempt_id)
            .await?
            .ok_or_else(|| PaymentError::AttemptNotFound {
                merchant_transaction_id: funding_attempt_id.to_string(),
            })?;

        if attempt.status != PaymentStatus::Completed {
            return Err(PaymentError::validation(
                "funding_attempt_id",
                format!("attempt '{}' is {}, not COMPLETED", funding_attempt_id, attempt.status),
            ));
        }
        if attempt.user_id != user_id {
            return Err(PaymentError::validation(
                "funding_attempt_id",
                format!("attempt '{}' belongs to another user", funding_attempt_id),
            ));
        }

        let grant = SubscriptionGrant {
            user_id: user_id.to_string(),
            plan_slug: plan_slug.to_string(),
            billing_cycle,
            funding_attempt_id: funding_attempt_id.to_string(),
            granted_at: Utc::now(),
        };

        match self.store.grant_subscription(&grant).await? {
            GrantOutcome::Granted(subscription) => {
                self.audit
                    .log(PaymentAuditEvent::SubscriptionGranted {
                        user_id: subscription.user_id.clone(),
                        plan_slug: subscription.plan_slug.clone(),
                        funding_attempt_id: subscription.funding_attempt_id.clone(),
                        period_end: subscription.current_period_end,
                    })
                    .await;
                Ok(subscription)
            }
            GrantOutcome::AlreadyGranted(subscription) => {
                tracing::debug!(
                    target: TARGET,
                    funding_attempt_id,
                    subscription_id = %subscription.id,
                    "Grant already applied"
                );
                Ok(subscription)
            }
        }
    }

    /// The user's subscription if it is active right now.
    pub async fn get_active(&self, user_id: &str) -> Result<Option<Subscription>> {
        self.get_active_at(user_id, Utc::now()).await
    }

    /// [`get_active`](Self::get_active) evaluated at `now`.
    ///
    /// An active record whose period has ended is expired on the way out.
    pub async fn get_active_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<Option<Subscription>> {
        let Some(subscription) = self.store.get_active_subscription(user_id).await? else {
            return Ok(None);
        };
        let subscription = self.expire_if_past_at(subscription, now).await?;
        Ok((subscription.status == SubscriptionStatus::Active).then_some(subscription))
    }

    /// Mark `subscription` expired if its period has ended.
    pub async fn expire_if_past(&self, subscription: Subscription) -> Result<Subscription> {
        self.expire_if_past_at(subscription, Utc::now()).await
    }

    /// [`expire_if_past`](Self::expire_if_past) evaluated at `now`.
    pub async fn expire_if_past_at(
        &self,
        subscription: Subscription,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        if subscription.status != SubscriptionStatus::Active || now < subscription.current_period_end {
            return Ok(subscription);
        }

        let updated = self
            .store
            .transition_subscription(
                &subscription.id,
                SubscriptionStatus::Active,
                SubscriptionStatus::Expired,
                now,
            )
            .await?;

        match updated {
            Some(expired) => {
                tracing::info!(
                    target: TARGET,
                    subscription_id = %expired.id,
                    user_id = %expired.user_id,
                    period_end = %expired.current_period_end,
                    "Subscription expired"
                );
                Ok(expired)
            }
            // Someone else moved it first; report what the clock says.
            None => Ok(Subscription {
                status: SubscriptionStatus::Expired,
                ..subscription
            }),
        }
    }

    /// Cancel the user's active subscription.
    ///
    /// By default the paid period is kept: the record stays `Active` with
    /// `cancel_at_period_end` set and expires at `current_period_end`.
    /// `immediate` ends access now by moving the record to `Cancelled`.
    pub async fn cancel(&self, user_id: &str, immediate: bool) -> Result<Subscription> {
        self.cancel_at(user_id, immediate, Utc::now()).await
    }

    /// [`cancel`](Self::cancel) evaluated at `now`.
    pub async fn cancel_at(
        &self,
        user_id: &str,
        immediate: bool,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let active = self.require_active(user_id, now).await?;

        let updated = if immediate {
            self.store
                .transition_subscription(
                    &active.id,
                    SubscriptionStatus::Active,
                    SubscriptionStatus::Cancelled,
                    now,
                )
                .await?
        } else {
            self.store
                .set_cancel_at_period_end(&active.id, true, now)
                .await?
        };
        let cancelled = updated.ok_or_else(|| PaymentError::LedgerConflict {
            key: active.id.clone(),
        })?;

        self.audit
            .log(PaymentAuditEvent::SubscriptionCancelled {
                user_id: user_id.to_string(),
                subscription_id: cancelled.id.clone(),
                at_period_end: !immediate,
            })
            .await;

        Ok(cancelled)
    }

    /// Withdraw a pending end-of-period cancellation.
    pub async fn resume(&self, user_id: &str) -> Result<Subscription> {
        let now = Utc::now();
        let active = self.require_active(user_id, now).await?;
        if !active.cancel_at_period_end {
            return Ok(active);
        }

        let resumed = self
            .store
            .set_cancel_at_period_end(&active.id, false, now)
            .await?
            .ok_or_else(|| PaymentError::LedgerConflict {
                key: active.id.clone(),
            })?;

        self.audit
            .log(PaymentAuditEvent::SubscriptionResumed {
                user_id: user_id.to_string(),
                subscription_id: resumed.id.clone(),
            })
            .await;

        Ok(resumed)
    }

    async fn require_active(&self, user_id: &str, now: DateTime<Utc>) -> Result<Subscription> {
        self.get_active_at(user_id, now)
            .await?
            .ok_or_else(|| PaymentError::NoActiveSubscription {
                user_id: user_id.to_string(),
            })
    }

    /// Summary of the user's current subscription state.
    pub async fn status_summary(&self, user_id: &str) -> Result<SubscriptionSummary> {
        self.status_summary_at(user_id, Utc::now()).await
    }

    pub async fn status_summary_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<SubscriptionSummary> {
        if let Some(active) = self.get_active_at(user_id, now).await? {
            return Ok(SubscriptionSummary {
                is_active: true,
                is_expired: false,
                is_cancelled: false,
                cancel_at_period_end: active.cancel_at_period_end,
                days_until_expiry: active.days_until_expiry(now),
                can_renew: false,
                subscription: Some(active),
            });
        }

        let latest = self.store.list_subscriptions(user_id).await?.into_iter().next();
        let status = latest.as_ref().map(|s| s.status);
        Ok(SubscriptionSummary {
            is_active: false,
            is_expired: status == Some(SubscriptionStatus::Expired),
            is_cancelled: status == Some(SubscriptionStatus::Cancelled),
            cancel_at_period_end: latest.as_ref().is_some_and(|s| s.cancel_at_period_end),
            days_until_expiry: 0,
            can_renew: latest.is_some(),
            subscription: latest,
        })
    }

    /// Every subscription record for the user, newest first.
    pub async fn history(&self, user_id: &str) -> Result<Vec<Subscription>> {
        self.store.list_subscriptions(user_id).await
    }
}
