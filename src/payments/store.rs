//! Persistence for payment attempts and subscriptions.
//!
//! Implementations must make [`PaymentStore::settle`] atomic: the attempt's
//! status change and any subscription grant it funds commit together or not
//! at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::{PaymentError, Result};
use super::ledger::{Subscription, SubscriptionGrant, SubscriptionStatus};
use super::types::{PaymentAttempt, PaymentStatus};

/// A verified status change to apply to one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub merchant_transaction_id: String,
    /// Status the attempt must already be in. Guards against lost updates.
    pub expected_status: PaymentStatus,
    pub status: PaymentStatus,
    pub raw_gateway_payload: String,
    /// Present only when `status` is `Completed`.
    pub grant: Option<SubscriptionGrant>,
    pub settled_at: DateTime<Utc>,
}

/// What a successful settlement changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleOutcome {
    pub attempt: PaymentAttempt,
    pub subscription: Option<Subscription>,
}

/// Result of a subscription grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// A new active period was created.
    Granted(Subscription),
    /// This funding attempt already produced a subscription.
    AlreadyGranted(Subscription),
}

impl GrantOutcome {
    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        match self {
            Self::Granted(s) | Self::AlreadyGranted(s) => s,
        }
    }

    #[must_use]
    pub fn into_subscription(self) -> Subscription {
        match self {
            Self::Granted(s) | Self::AlreadyGranted(s) => s,
        }
    }
}

/// Storage backend for the payment core.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Insert a new attempt. Fails with `DuplicateAttempt` if the id exists.
    async fn insert_attempt(&self, attempt: &PaymentAttempt) -> Result<()>;

    async fn get_attempt(&self, merchant_transaction_id: &str) -> Result<Option<PaymentAttempt>>;

    /// All attempts for a user, newest first.
    async fn list_attempts_for_user(&self, user_id: &str) -> Result<Vec<PaymentAttempt>>;

    /// Atomically apply a status change and its grant.
    ///
    /// - `AttemptNotFound` if the attempt does not exist
    /// - `DuplicateCallback` if the attempt is already terminal
    /// - `LedgerConflict` if the attempt is no longer in `expected_status`
    /// - `InvalidTransition` if the move is not allowed
    async fn settle(&self, settlement: Settlement) -> Result<SettleOutcome>;

    /// Create the subscription funded by `grant.funding_attempt_id`,
    /// superseding any active one. Idempotent per funding attempt.
    async fn grant_subscription(&self, grant: &SubscriptionGrant) -> Result<GrantOutcome>;

    /// The user's `Active` subscription record, if any, regardless of period end.
    async fn get_active_subscription(&self, user_id: &str) -> Result<Option<Subscription>>;

    /// All subscription records for a user, newest first.
    async fn list_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>>;

    /// Compare-and-set a subscription's status. Moving to `Cancelled` also
    /// stamps `cancelled_at`.
    ///
    /// Returns the updated record, or `None` if it was not in `from`.
    async fn transition_subscription(
        &self,
        subscription_id: &str,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Subscription>>;

    /// Set or clear a pending end-of-period cancellation on an `Active`
    /// subscription. Setting it stamps `cancelled_at`; clearing removes it.
    ///
    /// Returns the updated record, or `None` if it is no longer active.
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Subscription>>;
}

#[derive(Default)]
struct Tables {
    attempts: HashMap<String, PaymentAttempt>,
    subscriptions: HashMap<String, Subscription>,
}

impl Tables {
    fn grant(&mut self, grant: &SubscriptionGrant) -> GrantOutcome {
        if let Some(existing) = self
            .subscriptions
            .values()
            .find(|s| s.funding_attempt_id == grant.funding_attempt_id)
        {
            return GrantOutcome::AlreadyGranted(existing.clone());
        }

        for sub in self.subscriptions.values_mut() {
            if sub.user_id == grant.user_id && sub.status == SubscriptionStatus::Active {
                sub.status = SubscriptionStatus::Expired;
                sub.updated_at = grant.granted_at;
            }
        }

        let subscription = grant.to_subscription();
        self.subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        GrantOutcome::Granted(subscription)
    }
}

/// In-memory store.
///
/// One lock guards both tables, so a settlement and its grant are a single
/// critical section. Cloning shares the data.
#[derive(Clone, Default)]
pub struct InMemoryPaymentStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryPaymentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored attempts.
    pub async fn attempt_count(&self) -> usize {
        self.tables.read().await.attempts.len()
    }

    /// Number of stored subscription records, in any status.
    pub async fn subscription_count(&self) -> usize {
        self.tables.read().await.subscriptions.len()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert_attempt(&self, attempt: &PaymentAttempt) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.attempts.contains_key(&attempt.merchant_transaction_id) {
            return Err(PaymentError::DuplicateAttempt {
                merchant_transaction_id: attempt.merchant_transaction_id.clone(),
            });
        }
        tables
            .attempts
            .insert(attempt.merchant_transaction_id.clone(), attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, merchant_transaction_id: &str) -> Result<Option<PaymentAttempt>> {
        Ok(self
            .tables
            .read()
            .await
            .attempts
            .get(merchant_transaction_id)
            .cloned())
    }

    async fn list_attempts_for_user(&self, user_id: &str) -> Result<Vec<PaymentAttempt>> {
        let tables = self.tables.read().await;
        let mut attempts: Vec<_> = tables
            .attempts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(attempts)
    }

    async fn settle(&self, settlement: Settlement) -> Result<SettleOutcome> {
        let mut tables = self.tables.write().await;

        let current = tables
            .attempts
            .get(&settlement.merchant_transaction_id)
            .ok_or_else(|| PaymentError::AttemptNotFound {
                merchant_transaction_id: settlement.merchant_transaction_id.clone(),
            })?;

        if current.status.is_terminal() {
            return Err(PaymentError::DuplicateCallback {
                merchant_transaction_id: settlement.merchant_transaction_id,
                status: current.status,
            });
        }
        if current.status != settlement.expected_status {
            return Err(PaymentError::LedgerConflict {
                key: settlement.merchant_transaction_id,
            });
        }
        current.status.validate_transition(settlement.status)?;

        let subscription = match (&settlement.grant, settlement.status) {
            (Some(grant), PaymentStatus::Completed) => Some(tables.grant(grant).into_subscription()),
            _ => None,
        };

        let attempt = match tables.attempts.get_mut(&settlement.merchant_transaction_id) {
            Some(attempt) => attempt,
            None => {
                return Err(PaymentError::AttemptNotFound {
                    merchant_transaction_id: settlement.merchant_transaction_id,
                });
            }
        };
        attempt.status = settlement.status;
        attempt.raw_gateway_payload = Some(settlement.raw_gateway_payload);
        attempt.updated_at = settlement.settled_at;

        Ok(SettleOutcome {
            attempt: attempt.clone(),
            subscription,
        })
    }

    async fn grant_subscription(&self, grant: &SubscriptionGrant) -> Result<GrantOutcome> {
        Ok(self.tables.write().await.grant(grant))
    }

    async fn get_active_subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
        Ok(self
            .tables
            .read()
            .await
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
            .cloned())
    }

    async fn list_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>> {
        let tables = self.tables.read().await;
        let mut subs: Vec<_> = tables
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subs)
    }

    async fn transition_subscription(
        &self,
        subscription_id: &str,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let mut tables = self.tables.write().await;
        match tables.subscriptions.get_mut(subscription_id) {
            Some(sub) if sub.status == from => {
                sub.status = to;
                sub.updated_at = at;
                if to == SubscriptionStatus::Cancelled {
                    sub.cancelled_at = Some(at);
                }
                Ok(Some(sub.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let mut tables = self.tables.write().await;
        match tables.subscriptions.get_mut(subscription_id) {
            Some(sub) if sub.status == SubscriptionStatus::Active => {
                sub.cancel_at_period_end = cancel_at_period_end;
                sub.cancelled_at = cancel_at_period_end.then_some(at);
                sub.updated_at = at;
                Ok(Some(sub.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{BillingCycle, Gateway, PaymentAttemptDraft};

    fn attempt(id: &str, user: &str) -> PaymentAttempt {
        PaymentAttempt::from_draft(
            &PaymentAttemptDraft {
                merchant_transaction_id: id.to_string(),
                gateway: Gateway::ChecksumQr,
                amount_minor_units: 49_900,
                currency: "INR".to_string(),
                user_id: user.to_string(),
                plan_id: "premium".to_string(),
                billing_cycle: BillingCycle::Monthly,
            },
            Utc::now(),
        )
    }

    fn settlement(attempt: &PaymentAttempt, status: PaymentStatus) -> Settlement {
        Settlement {
            merchant_transaction_id: attempt.merchant_transaction_id.clone(),
            expected_status: attempt.status,
            status,
            raw_gateway_payload: "{}".to_string(),
            grant: (status == PaymentStatus::Completed)
                .then(|| SubscriptionGrant::for_attempt(attempt, Utc::now())),
            settled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = InMemoryPaymentStore::new();
        let a = attempt("MT1", "u1");
        store.insert_attempt(&a).await.unwrap();
        assert!(matches!(
            store.insert_attempt(&a).await,
            Err(PaymentError::DuplicateAttempt { .. })
        ));
        assert_eq!(store.attempt_count().await, 1);
    }

    #[tokio::test]
    async fn settle_completes_and_grants_together() {
        let store = InMemoryPaymentStore::new();
        let a = attempt("MT1", "u1");
        store.insert_attempt(&a).await.unwrap();

        let outcome = store.settle(settlement(&a, PaymentStatus::Completed)).await.unwrap();
        assert_eq!(outcome.attempt.status, PaymentStatus::Completed);
        assert_eq!(outcome.attempt.raw_gateway_payload.as_deref(), Some("{}"));
        let sub = outcome.subscription.unwrap();
        assert_eq!(sub.funding_attempt_id, "MT1");
        assert_eq!(sub.status, SubscriptionStatus::Active);

        assert_eq!(
            store.get_active_subscription("u1").await.unwrap().map(|s| s.id),
            Some(sub.id)
        );
    }

    #[tokio::test]
    async fn settle_terminal_attempt_is_duplicate() {
        let store = InMemoryPaymentStore::new();
        let a = attempt("MT1", "u1");
        store.insert_attempt(&a).await.unwrap();
        store.settle(settlement(&a, PaymentStatus::Failed)).await.unwrap();

        let err = store.settle(settlement(&a, PaymentStatus::Completed)).await.unwrap_err();
        assert!(matches!(err, PaymentError::DuplicateCallback { status: PaymentStatus::Failed, .. }));
        assert!(store.get_active_subscription("u1").await.unwrap().is_none());
        assert_eq!(store.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn settle_with_stale_expectation_conflicts() {
        let store = InMemoryPaymentStore::new();
        let a = attempt("MT1", "u1");
        store.insert_attempt(&a).await.unwrap();
        store.settle(settlement(&a, PaymentStatus::Processing)).await.unwrap();

        // Still expects Initiated.
        let err = store.settle(settlement(&a, PaymentStatus::Completed)).await.unwrap_err();
        assert!(matches!(err, PaymentError::LedgerConflict { .. }));
    }

    #[tokio::test]
    async fn settle_unknown_attempt() {
        let store = InMemoryPaymentStore::new();
        let a = attempt("MT404", "u1");
        assert!(matches!(
            store.settle(settlement(&a, PaymentStatus::Completed)).await,
            Err(PaymentError::AttemptNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn grant_is_idempotent_and_supersedes() {
        let store = InMemoryPaymentStore::new();
        let first = SubscriptionGrant::for_attempt(&attempt("MT1", "u1"), Utc::now());
        let second = SubscriptionGrant::for_attempt(&attempt("MT2", "u1"), Utc::now());

        let g1 = store.grant_subscription(&first).await.unwrap();
        assert!(matches!(g1, GrantOutcome::Granted(_)));
        let again = store.grant_subscription(&first).await.unwrap();
        assert!(matches!(again, GrantOutcome::AlreadyGranted(_)));
        assert_eq!(again.subscription().id, g1.subscription().id);

        let g2 = store.grant_subscription(&second).await.unwrap();
        let subs = store.list_subscriptions("u1").await.unwrap();
        assert_eq!(subs.len(), 2);
        let active: Vec<_> = subs.iter().filter(|s| s.status == SubscriptionStatus::Active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, g2.subscription().id);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = InMemoryPaymentStore::new();
        let sub = store
            .grant_subscription(&SubscriptionGrant::for_attempt(&attempt("MT1", "u1"), Utc::now()))
            .await
            .unwrap()
            .into_subscription();

        let now = Utc::now();
        let expired = store
            .transition_subscription(&sub.id, SubscriptionStatus::Active, SubscriptionStatus::Expired, now)
            .await
            .unwrap();
        assert_eq!(expired.map(|s| s.status), Some(SubscriptionStatus::Expired));

        let again = store
            .transition_subscription(&sub.id, SubscriptionStatus::Active, SubscriptionStatus::Cancelled, now)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn pending_cancellation_only_on_active_records() {
        let store = InMemoryPaymentStore::new();
        let sub = store
            .grant_subscription(&SubscriptionGrant::for_attempt(&attempt("MT1", "u1"), Utc::now()))
            .await
            .unwrap()
            .into_subscription();
        assert!(!sub.cancel_at_period_end);

        let now = Utc::now();
        let pending = store.set_cancel_at_period_end(&sub.id, true, now).await.unwrap().unwrap();
        assert!(pending.cancel_at_period_end);
        assert_eq!(pending.cancelled_at, Some(now));
        assert_eq!(pending.status, SubscriptionStatus::Active);

        let resumed = store.set_cancel_at_period_end(&sub.id, false, now).await.unwrap().unwrap();
        assert!(!resumed.cancel_at_period_end);
        assert!(resumed.cancelled_at.is_none());

        let cancelled = store
            .transition_subscription(&sub.id, SubscriptionStatus::Active, SubscriptionStatus::Cancelled, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.cancelled_at, Some(now));
        assert!(store.set_cancel_at_period_end(&sub.id, true, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_attempts_is_per_user() {
        let store = InMemoryPaymentStore::new();
        store.insert_attempt(&attempt("MT1", "u1")).await.unwrap();
        store.insert_attempt(&attempt("MT2", "u2")).await.unwrap();
        store.insert_attempt(&attempt("MT3", "u1")).await.unwrap();

        let ids: Vec<_> = store
            .list_attempts_for_user("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.merchant_transaction_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"MT1".to_string()));
        assert!(ids.contains(&"MT3".to_string()));
    }
}
