//! SeaORM-backed payment storage.
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE payment_attempts (
//!     merchant_transaction_id VARCHAR(64) PRIMARY KEY,
//!     gateway                 VARCHAR(32) NOT NULL,
//!     amount_minor_units      BIGINT NOT NULL,
//!     currency                CHAR(3) NOT NULL,
//!     user_id                 VARCHAR NOT NULL,
//!     plan_id                 VARCHAR NOT NULL,
//!     billing_cycle           VARCHAR(16) NOT NULL,
//!     status                  VARCHAR(16) NOT NULL,
//!     raw_gateway_payload     TEXT,
//!     created_at              TIMESTAMPTZ NOT NULL,
//!     updated_at              TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE subscriptions (
//!     id                   VARCHAR(36) PRIMARY KEY,
//!     user_id              VARCHAR NOT NULL,
//!     plan_slug            VARCHAR NOT NULL,
//!     billing_cycle        VARCHAR(16) NOT NULL,
//!     status               VARCHAR(16) NOT NULL,
//!     current_period_start TIMESTAMPTZ NOT NULL,
//!     current_period_end   TIMESTAMPTZ NOT NULL,
//!     funding_attempt_id   VARCHAR(64) NOT NULL UNIQUE,
//!     cancel_at_period_end BOOLEAN NOT NULL DEFAULT FALSE,
//!     cancelled_at         TIMESTAMPTZ,
//!     created_at           TIMESTAMPTZ NOT NULL,
//!     updated_at           TIMESTAMPTZ NOT NULL
//! );
//! CREATE UNIQUE INDEX subscriptions_one_active
//!     ON subscriptions (user_id) WHERE status = 'ACTIVE';
//! ```
//!
//! The partial index makes a second concurrent grant for the same user fail
//! on insert; that failure is reported as `LedgerConflict`. [`create_schema`]
//! creates both tables and the index.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Schema, Set, SqlErr, TransactionTrait, sea_query::Expr,
};

use super::error::{PaymentError, Result};
use super::ledger::{Subscription, SubscriptionGrant, SubscriptionStatus};
use super::store::{GrantOutcome, PaymentStore, SettleOutcome, Settlement};
use super::types::{PaymentAttempt, PaymentStatus};

const TARGET: &str = "carepay::payments::store";

mod entity {
    pub mod payment_attempt {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "payment_attempts")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub merchant_transaction_id: String,
            pub gateway: String,
            pub amount_minor_units: i64,
            pub currency: String,
            pub user_id: String,
            pub plan_id: String,
            pub billing_cycle: String,
            pub status: String,
            #[sea_orm(column_type = "Text", nullable)]
            pub raw_gateway_payload: Option<String>,
            pub created_at: DateTimeWithTimeZone,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod subscription {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "subscriptions")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            pub user_id: String,
            pub plan_slug: String,
            pub billing_cycle: String,
            pub status: String,
            pub current_period_start: DateTimeWithTimeZone,
            pub current_period_end: DateTimeWithTimeZone,
            #[sea_orm(unique)]
            pub funding_attempt_id: String,
            #[sea_orm(default_value = false)]
            pub cancel_at_period_end: bool,
            #[sea_orm(nullable)]
            pub cancelled_at: Option<DateTimeWithTimeZone>,
            pub created_at: DateTimeWithTimeZone,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{payment_attempt, subscription};

fn db_err(e: DbErr) -> PaymentError {
    PaymentError::storage(e.to_string())
}

/// Map a write failure, treating unique-constraint violations as a lost race on `key`.
fn write_err(e: DbErr, key: &str) -> PaymentError {
    match e.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(detail)) => {
            tracing::debug!(target: TARGET, key, detail = %detail, "Unique constraint violated");
            PaymentError::LedgerConflict { key: key.to_string() }
        }
        _ => db_err(e),
    }
}

const ONE_ACTIVE_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS subscriptions_one_active \
     ON subscriptions (user_id) WHERE status = 'ACTIVE'";

const ATTEMPTS_BY_USER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS payment_attempts_user_id ON payment_attempts (user_id)";

/// Create the payment tables and their indexes if they do not exist.
///
/// Works on PostgreSQL and SQLite; both support the partial index that keeps
/// one `ACTIVE` subscription per user.
pub async fn create_schema(db: &DatabaseConnection) -> Result<()> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut attempts = schema.create_table_from_entity(payment_attempt::Entity);
    attempts.if_not_exists();
    db.execute(backend.build(&attempts)).await.map_err(db_err)?;

    let mut subscriptions = schema.create_table_from_entity(subscription::Entity);
    subscriptions.if_not_exists();
    db.execute(backend.build(&subscriptions)).await.map_err(db_err)?;

    db.execute_unprepared(ATTEMPTS_BY_USER_INDEX).await.map_err(db_err)?;
    db.execute_unprepared(ONE_ACTIVE_INDEX).await.map_err(db_err)?;

    tracing::debug!(target: TARGET, backend = ?backend, "Payment schema ready");
    Ok(())
}

fn amount_to_column(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| {
        PaymentError::validation("amount_minor_units", format!("{} does not fit the amount column", value))
    })
}

fn timestamp(at: DateTime<Utc>) -> DateTime<FixedOffset> {
    at.fixed_offset()
}

fn attempt_from_model(model: payment_attempt::Model) -> Result<PaymentAttempt> {
    Ok(PaymentAttempt {
        gateway: model.gateway.parse()?,
        amount_minor_units: u64::try_from(model.amount_minor_units)
            .map_err(|_| PaymentError::storage("negative amount in payment_attempts"))?,
        currency: model.currency,
        user_id: model.user_id,
        plan_id: model.plan_id,
        billing_cycle: model.billing_cycle.parse()?,
        status: model.status.parse()?,
        raw_gateway_payload: model.raw_gateway_payload,
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
        merchant_transaction_id: model.merchant_transaction_id,
    })
}

fn attempt_to_active_model(attempt: &PaymentAttempt) -> Result<payment_attempt::ActiveModel> {
    Ok(payment_attempt::ActiveModel {
        merchant_transaction_id: Set(attempt.merchant_transaction_id.clone()),
        gateway: Set(attempt.gateway.as_str().to_string()),
        amount_minor_units: Set(amount_to_column(attempt.amount_minor_units)?),
        currency: Set(attempt.currency.clone()),
        user_id: Set(attempt.user_id.clone()),
        plan_id: Set(attempt.plan_id.clone()),
        billing_cycle: Set(attempt.billing_cycle.as_str().to_string()),
        status: Set(attempt.status.as_str().to_string()),
        raw_gateway_payload: Set(attempt.raw_gateway_payload.clone()),
        created_at: Set(timestamp(attempt.created_at)),
        updated_at: Set(timestamp(attempt.updated_at)),
    })
}

fn subscription_from_model(model: subscription::Model) -> Result<Subscription> {
    Ok(Subscription {
        id: model.id,
        user_id: model.user_id,
        plan_slug: model.plan_slug,
        billing_cycle: model.billing_cycle.parse()?,
        status: SubscriptionStatus::parse(&model.status)?,
        current_period_start: model.current_period_start.with_timezone(&Utc),
        current_period_end: model.current_period_end.with_timezone(&Utc),
        funding_attempt_id: model.funding_attempt_id,
        cancel_at_period_end: model.cancel_at_period_end,
        cancelled_at: model.cancelled_at.map(|at| at.with_timezone(&Utc)),
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    })
}

fn subscription_to_active_model(sub: &Subscription) -> subscription::ActiveModel {
    subscription::ActiveModel {
        id: Set(sub.id.clone()),
        user_id: Set(sub.user_id.clone()),
        plan_slug: Set(sub.plan_slug.clone()),
        billing_cycle: Set(sub.billing_cycle.as_str().to_string()),
        status: Set(sub.status.as_str().to_string()),
        current_period_start: Set(sub.current_period_start.fixed_offset()),
        current_period_end: Set(sub.current_period_end.fixed_offset()),
        funding_attempt_id: Set(sub.funding_attempt_id.clone()),
        cancel_at_period_end: Set(sub.cancel_at_period_end),
        cancelled_at: Set(sub.cancelled_at.map(timestamp)),
        created_at: Set(timestamp(sub.created_at)),
        updated_at: Set(timestamp(sub.updated_at)),
    }
}

/// Grant inside an open transaction. The caller commits.
async fn grant_in(txn: &DatabaseTransaction, grant: &SubscriptionGrant) -> Result<GrantOutcome> {
    let existing = subscription::Entity::find()
        .filter(subscription::Column::FundingAttemptId.eq(grant.funding_attempt_id.as_str()))
        .one(txn)
        .await
        .map_err(db_err)?;
    if let Some(model) = existing {
        return Ok(GrantOutcome::AlreadyGranted(subscription_from_model(model)?));
    }

    subscription::Entity::update_many()
        .col_expr(
            subscription::Column::Status,
            Expr::value(SubscriptionStatus::Expired.as_str()),
        )
        .col_expr(
            subscription::Column::UpdatedAt,
            Expr::value(timestamp(grant.granted_at)),
        )
        .filter(subscription::Column::UserId.eq(grant.user_id.as_str()))
        .filter(subscription::Column::Status.eq(SubscriptionStatus::Active.as_str()))
        .exec(txn)
        .await
        .map_err(db_err)?;

    let subscription = grant.to_subscription();
    subscription::Entity::insert(subscription_to_active_model(&subscription))
        .exec(txn)
        .await
        .map_err(|e| write_err(e, &grant.funding_attempt_id))?;

    Ok(GrantOutcome::Granted(subscription))
}

/// SeaORM implementation of [`PaymentStore`].
///
/// `settle` and `grant_subscription` each run in one database transaction.
#[derive(Clone, Debug)]
pub struct SeaOrmPaymentStore {
    db: DatabaseConnection,
}

impl SeaOrmPaymentStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn find_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>> {
        subscription::Entity::find_by_id(subscription_id)
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(subscription_from_model)
            .transpose()
    }
}

#[async_trait]
impl PaymentStore for SeaOrmPaymentStore {
    async fn insert_attempt(&self, attempt: &PaymentAttempt) -> Result<()> {
        payment_attempt::Entity::insert(attempt_to_active_model(attempt)?)
            .exec(&self.db)
            .await
            .map_err(|e| match e.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => PaymentError::DuplicateAttempt {
                    merchant_transaction_id: attempt.merchant_transaction_id.clone(),
                },
                _ => db_err(e),
            })?;
        Ok(())
    }

    async fn get_attempt(&self, merchant_transaction_id: &str) -> Result<Option<PaymentAttempt>> {
        payment_attempt::Entity::find_by_id(merchant_transaction_id)
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(attempt_from_model)
            .transpose()
    }

    async fn list_attempts_for_user(&self, user_id: &str) -> Result<Vec<PaymentAttempt>> {
        payment_attempt::Entity::find()
            .filter(payment_attempt::Column::UserId.eq(user_id))
            .order_by_desc(payment_attempt::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(attempt_from_model)
            .collect()
    }

    async fn settle(&self, settlement: Settlement) -> Result<SettleOutcome> {
        let txn_id = settlement.merchant_transaction_id.as_str();
        let txn = self.db.begin().await.map_err(db_err)?;

        let current = payment_attempt::Entity::find_by_id(txn_id)
            .one(&txn)
            .await
            .map_err(db_err)?
            .map(attempt_from_model)
            .transpose()?
            .ok_or_else(|| PaymentError::AttemptNotFound {
                merchant_transaction_id: txn_id.to_string(),
            })?;

        if current.status.is_terminal() {
            txn.rollback().await.map_err(db_err)?;
            return Err(PaymentError::DuplicateCallback {
                merchant_transaction_id: txn_id.to_string(),
                status: current.status,
            });
        }
        if current.status != settlement.expected_status {
            txn.rollback().await.map_err(db_err)?;
            return Err(PaymentError::LedgerConflict {
                key: txn_id.to_string(),
            });
        }
        current.status.validate_transition(settlement.status)?;

        // Guarded on the expected status so a concurrent writer makes this a no-op.
        let updated = payment_attempt::Entity::update_many()
            .col_expr(
                payment_attempt::Column::Status,
                Expr::value(settlement.status.as_str()),
            )
            .col_expr(
                payment_attempt::Column::RawGatewayPayload,
                Expr::value(settlement.raw_gateway_payload.clone()),
            )
            .col_expr(
                payment_attempt::Column::UpdatedAt,
                Expr::value(timestamp(settlement.settled_at)),
            )
            .filter(payment_attempt::Column::MerchantTransactionId.eq(txn_id))
            .filter(payment_attempt::Column::Status.eq(settlement.expected_status.as_str()))
            .exec(&txn)
            .await
            .map_err(db_err)?;

        if updated.rows_affected == 0 {
            txn.rollback().await.map_err(db_err)?;
            tracing::debug!(target: TARGET, merchant_transaction_id = txn_id, "Settlement lost a race");
            return Err(PaymentError::LedgerConflict {
                key: txn_id.to_string(),
            });
        }

        let subscription = match (&settlement.grant, settlement.status) {
            (Some(grant), PaymentStatus::Completed) => Some(grant_in(&txn, grant).await?.into_subscription()),
            _ => None,
        };

        txn.commit().await.map_err(db_err)?;

        Ok(SettleOutcome {
            attempt: PaymentAttempt {
                status: settlement.status,
                raw_gateway_payload: Some(settlement.raw_gateway_payload),
                updated_at: settlement.settled_at,
                ..current
            },
            subscription,
        })
    }

    async fn grant_subscription(&self, grant: &SubscriptionGrant) -> Result<GrantOutcome> {
        let txn = self.db.begin().await.map_err(db_err)?;
        let outcome = grant_in(&txn, grant).await?;
        txn.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    async fn get_active_subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
        subscription::Entity::find()
            .filter(subscription::Column::UserId.eq(user_id))
            .filter(subscription::Column::Status.eq(SubscriptionStatus::Active.as_str()))
            .order_by_desc(subscription::Column::CreatedAt)
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(subscription_from_model)
            .transpose()
    }

    async fn list_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>> {
        subscription::Entity::find()
            .filter(subscription::Column::UserId.eq(user_id))
            .order_by_desc(subscription::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(subscription_from_model)
            .collect()
    }

    async fn transition_subscription(
        &self,
        subscription_id: &str,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let mut update = subscription::Entity::update_many()
            .col_expr(subscription::Column::Status, Expr::value(to.as_str()))
            .col_expr(subscription::Column::UpdatedAt, Expr::value(timestamp(at)))
            .filter(subscription::Column::Id.eq(subscription_id))
            .filter(subscription::Column::Status.eq(from.as_str()));
        if to == SubscriptionStatus::Cancelled {
            update = update.col_expr(
                subscription::Column::CancelledAt,
                Expr::value(Some(timestamp(at))),
            );
        }

        let updated = update.exec(&self.db).await.map_err(db_err)?;
        if updated.rows_affected == 0 {
            return Ok(None);
        }
        self.find_subscription(subscription_id).await
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let cancelled_at: Option<DateTime<FixedOffset>> = cancel_at_period_end.then(|| timestamp(at));
        let updated = subscription::Entity::update_many()
            .col_expr(
                subscription::Column::CancelAtPeriodEnd,
                Expr::value(cancel_at_period_end),
            )
            .col_expr(subscription::Column::CancelledAt, Expr::value(cancelled_at))
            .col_expr(subscription::Column::UpdatedAt, Expr::value(timestamp(at)))
            .filter(subscription::Column::Id.eq(subscription_id))
            .filter(subscription::Column::Status.eq(SubscriptionStatus::Active.as_str()))
            .exec(&self.db)
            .await
            .map_err(db_err)?;

        if updated.rows_affected == 0 {
            return Ok(None);
        }
        self.find_subscription(subscription_id).await
    }
}
