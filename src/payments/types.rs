//! Core payment domain types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::PaymentError;

/// Maximum length of a merchant transaction id.
pub const MAX_TRANSACTION_ID_LEN: usize = 64;

/// Largest amount that fits the signed 64-bit columns of the SQL store.
pub const MAX_AMOUNT_MINOR_UNITS: u64 = i64::MAX as u64;

/// The external payment providers this crate can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Gateway {
    /// Checksum-signed base64 payloads (QR / pay-page flow).
    ChecksumQr,
    /// HMAC-signed webhooks and hosted payment links.
    HostedCheckout,
}

impl Gateway {
    /// All supported gateways.
    pub const ALL: [Gateway; 2] = [Gateway::ChecksumQr, Gateway::HostedCheckout];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChecksumQr => "CHECKSUM_QR",
            Self::HostedCheckout => "HOSTED_CHECKOUT",
        }
    }

    /// URL path segment used for this gateway's callback route.
    #[must_use]
    pub fn slug(&self) -> &'static str {
        match self {
            Self::ChecksumQr => "checksum-qr",
            Self::HostedCheckout => "hosted-checkout",
        }
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gateway {
    type Err = PaymentError;

    /// Accepts either the wire name (`CHECKSUM_QR`) or the route slug (`checksum-qr`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Gateway::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s) || g.slug() == s)
            .ok_or_else(|| PaymentError::UnsupportedGateway {
                gateway: s.to_string(),
            })
    }
}

/// How often a subscription renews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingCycle {
    Monthly,
    Annual,
}

impl BillingCycle {
    /// Length of one paid period.
    #[must_use]
    pub fn period(&self) -> Duration {
        match self {
            Self::Monthly => Duration::days(30),
            Self::Annual => Duration::days(365),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "MONTHLY",
            Self::Annual => "ANNUAL",
        }
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingCycle {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MONTHLY" => Ok(Self::Monthly),
            "ANNUAL" | "YEARLY" => Ok(Self::Annual),
            _ => Err(PaymentError::Validation {
                field: "billing_cycle".to_string(),
                message: format!("unknown billing cycle '{}'", s),
            }),
        }
    }
}

/// Lifecycle of a single payment attempt.
///
/// `Initiated` and `Processing` may move forward; `Completed` and `Failed`
/// are terminal and never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Initiated,
    Processing,
    Completed,
    Failed,
}

impl PaymentStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// | from       | allowed targets                          |
    /// |------------|------------------------------------------|
    /// | Initiated  | Initiated, Processing, Completed, Failed |
    /// | Processing | Processing, Completed, Failed            |
    /// | Completed  | (none)                                   |
    /// | Failed     | (none)                                   |
    #[must_use]
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        match self {
            Self::Initiated => true,
            Self::Processing => next != Self::Initiated,
            Self::Completed | Self::Failed => false,
        }
    }

    /// Like [`can_transition_to`](Self::can_transition_to), as a `Result`.
    pub fn validate_transition(&self, next: PaymentStatus) -> Result<(), PaymentError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(PaymentError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIATED" => Ok(Self::Initiated),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(PaymentError::Storage {
                message: format!("unknown payment status '{}'", other),
            }),
        }
    }
}

/// A checkout as the client asks for it: a plan and a cycle, never a price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub merchant_transaction_id: String,
    pub gateway: Gateway,
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
}

/// Everything needed to start a payment, before anything is persisted.
///
/// The amount and currency must match the plan catalog's price for this
/// user; [`PaymentService`](super::PaymentService) rejects a draft that
/// does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttemptDraft {
    /// Client-generated idempotency key for the whole attempt.
    pub merchant_transaction_id: String,
    pub gateway: Gateway,
    /// Amount in the currency's smallest unit (paise, cents).
    pub amount_minor_units: u64,
    /// ISO-4217 code.
    pub currency: String,
    pub user_id: String,
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
}

impl PaymentAttemptDraft {
    /// Check field constraints before anything is written or sent out.
    pub fn validate(&self) -> Result<(), PaymentError> {
        validate_transaction_id(&self.merchant_transaction_id)?;

        if self.amount_minor_units == 0 {
            return Err(PaymentError::validation(
                "amount_minor_units",
                "amount must be at least 1 minor unit",
            ));
        }

        if self.amount_minor_units > MAX_AMOUNT_MINOR_UNITS {
            return Err(PaymentError::validation(
                "amount_minor_units",
                format!("amount must be at most {}", MAX_AMOUNT_MINOR_UNITS),
            ));
        }

        if self.currency.len() != 3 || !self.currency.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(PaymentError::validation(
                "currency",
                format!("'{}' is not an ISO-4217 code", self.currency),
            ));
        }

        if self.user_id.trim().is_empty() {
            return Err(PaymentError::validation("user_id", "must not be empty"));
        }

        if self.plan_id.trim().is_empty() {
            return Err(PaymentError::validation("plan_id", "must not be empty"));
        }

        Ok(())
    }
}

/// Transaction ids travel in URLs and signed payloads, so keep them to a
/// conservative alphabet.
pub fn validate_transaction_id(id: &str) -> Result<(), PaymentError> {
    if id.is_empty() {
        return Err(PaymentError::validation(
            "merchant_transaction_id",
            "must not be empty",
        ));
    }

    if id.len() > MAX_TRANSACTION_ID_LEN {
        return Err(PaymentError::validation(
            "merchant_transaction_id",
            format!("must be at most {} characters", MAX_TRANSACTION_ID_LEN),
        ));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PaymentError::validation(
            "merchant_transaction_id",
            "may only contain ASCII letters, digits, '-' and '_'",
        ));
    }

    Ok(())
}

/// A persisted payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub merchant_transaction_id: String,
    pub gateway: Gateway,
    pub amount_minor_units: u64,
    pub currency: String,
    pub user_id: String,
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
    pub status: PaymentStatus,
    /// Last verified gateway payload, stored verbatim.
    pub raw_gateway_payload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAttempt {
    /// A fresh `Initiated` attempt for the given draft.
    #[must_use]
    pub fn from_draft(draft: &PaymentAttemptDraft, now: DateTime<Utc>) -> Self {
        Self {
            merchant_transaction_id: draft.merchant_transaction_id.clone(),
            gateway: draft.gateway,
            amount_minor_units: draft.amount_minor_units,
            currency: draft.currency.clone(),
            user_id: draft.user_id.clone(),
            plan_id: draft.plan_id.clone(),
            billing_cycle: draft.billing_cycle,
            status: PaymentStatus::Initiated,
            raw_gateway_payload: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> PaymentAttemptDraft {
        PaymentAttemptDraft {
            merchant_transaction_id: "MT-7850590068188104".to_string(),
            gateway: Gateway::ChecksumQr,
            amount_minor_units: 49_900,
            currency: "INR".to_string(),
            user_id: "user_1".to_string(),
            plan_id: "premium".to_string(),
            billing_cycle: BillingCycle::Monthly,
        }
    }

    #[test]
    fn terminal_states_never_move() {
        use PaymentStatus::*;
        for terminal in [Completed, Failed] {
            assert!(terminal.is_terminal());
            for next in [Initiated, Processing, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
                assert!(terminal.validate_transition(next).is_err());
            }
        }
    }

    #[test]
    fn forward_transitions_allowed() {
        use PaymentStatus::*;
        assert!(Initiated.can_transition_to(Processing));
        assert!(Initiated.can_transition_to(Completed));
        assert!(Initiated.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Initiated));
    }

    #[test]
    fn billing_cycle_periods() {
        assert_eq!(BillingCycle::Monthly.period(), Duration::days(30));
        assert_eq!(BillingCycle::Annual.period(), Duration::days(365));
        assert_eq!("yearly".parse::<BillingCycle>().unwrap(), BillingCycle::Annual);
        assert!("weekly".parse::<BillingCycle>().is_err());
    }

    #[test]
    fn gateway_parses_wire_name_and_slug() {
        assert_eq!("CHECKSUM_QR".parse::<Gateway>().unwrap(), Gateway::ChecksumQr);
        assert_eq!("hosted-checkout".parse::<Gateway>().unwrap(), Gateway::HostedCheckout);
        assert!(matches!(
            "paypal".parse::<Gateway>(),
            Err(PaymentError::UnsupportedGateway { .. })
        ));
    }

    #[test]
    fn draft_validation() {
        assert!(draft().validate().is_ok());

        let mut d = draft();
        d.amount_minor_units = 0;
        assert!(matches!(d.validate(), Err(PaymentError::Validation { field, .. }) if field == "amount_minor_units"));

        let mut d = draft();
        d.amount_minor_units = MAX_AMOUNT_MINOR_UNITS + 1;
        assert!(matches!(d.validate(), Err(PaymentError::Validation { field, .. }) if field == "amount_minor_units"));
        d.amount_minor_units = MAX_AMOUNT_MINOR_UNITS;
        assert!(d.validate().is_ok());

        let mut d = draft();
        d.currency = "inr".to_string();
        assert!(d.validate().is_err());

        let mut d = draft();
        d.merchant_transaction_id = "has space".to_string();
        assert!(d.validate().is_err());

        let mut d = draft();
        d.merchant_transaction_id = "x".repeat(MAX_TRANSACTION_ID_LEN + 1);
        assert!(d.validate().is_err());

        let mut d = draft();
        d.user_id = " ".to_string();
        assert!(d.validate().is_err());
    }

    #[test]
    fn attempt_from_draft_starts_initiated() {
        let now = Utc::now();
        let attempt = PaymentAttempt::from_draft(&draft(), now);
        assert_eq!(attempt.status, PaymentStatus::Initiated);
        assert_eq!(attempt.created_at, now);
        assert!(attempt.raw_gateway_payload.is_none());
    }
}
