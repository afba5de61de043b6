//! Hosted-checkout gateway adapter.
//!
//! Payments are created as hosted payment links (basic-auth with the key
//! pair). Webhooks are signed with hex `HMAC-SHA256(webhook_secret, body)`.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::transport::{GatewayRequest, GatewayResponse, GatewayTransport};
use super::{
    CallbackEvent, GatewayAdapter, GatewayStatusReport, InitiatedPayment, PaymentOutcome,
    decode_json, send_with_timeout,
};
use crate::payments::error::{PaymentError, Result};
use crate::payments::signature;
use crate::payments::types::{Gateway, PaymentAttemptDraft, validate_transaction_id};
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};

const TARGET: &str = "carepay::payments::gateway::hosted";

const PAYMENT_LINKS_PATH: &str = "/v1/payment_links";

/// Configuration for the hosted-checkout gateway.
#[derive(Clone)]
pub struct HostedCheckoutConfig {
    pub key_id: String,
    pub key_secret: SecretString,
    pub webhook_secret: SecretString,
    pub base_url: String,
    /// Header carrying the webhook signature.
    pub signature_header: String,
    /// Where the provider sends the browser after payment.
    pub redirect_url: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for HostedCheckoutConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedCheckoutConfig")
            .field("key_id", &self.key_id)
            .field("key_secret", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("signature_header", &self.signature_header)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HostedCheckoutConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.razorpay.com";
    pub const DEFAULT_SIGNATURE_HEADER: &'static str = "X-Razorpay-Signature";

    pub fn new(
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            key_secret: SecretString::from(key_secret.into()),
            webhook_secret: SecretString::from(webhook_secret.into()),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            signature_header: Self::DEFAULT_SIGNATURE_HEADER.to_string(),
            redirect_url: String::new(),
            timeout: Duration::from_secs(crate::config::DEFAULT_GATEWAY_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_redirect_url(mut self, url: impl Into<String>) -> Self {
        self.redirect_url = url.into();
        self
    }

    #[must_use]
    pub fn with_signature_header(mut self, header: impl Into<String>) -> Self {
        self.signature_header = header.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load from `CAREPAY_HOSTED_*` variables.
    ///
    /// Returns `None` unless the key pair and the webhook secret are all set.
    pub fn from_env() -> Option<Self> {
        let key_id = get_env_with_prefix("HOSTED_KEY_ID")?;
        let key_secret = get_env_with_prefix("HOSTED_KEY_SECRET")?;
        let webhook_secret = get_env_with_prefix("HOSTED_WEBHOOK_SECRET")?;

        let mut config = Self::new(key_id, key_secret, webhook_secret);
        if let Some(v) = get_env_with_prefix("HOSTED_BASE_URL") {
            config.base_url = v;
        }
        if let Some(v) = get_env_with_prefix("HOSTED_SIGNATURE_HEADER") {
            config.signature_header = v;
        }
        if let Some(v) = get_env_with_prefix("HOSTED_REDIRECT_URL") {
            config.redirect_url = v;
        }
        if let Some(secs) = parse_env_with_prefix::<u64>("HOSTED_TIMEOUT_SECONDS") {
            config.timeout = Duration::from_secs(secs);
        }
        Some(config)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.key_id.trim().is_empty() {
            return Err("hosted checkout key_id must not be empty".to_string());
        }
        if self.key_secret.expose_secret().is_empty() {
            return Err("hosted checkout key_secret must not be empty".to_string());
        }
        if self.webhook_secret.expose_secret().is_empty() {
            return Err("hosted checkout webhook_secret must not be empty".to_string());
        }
        if axum::http::HeaderName::from_bytes(self.signature_header.as_bytes()).is_err() {
            return Err(format!(
                "hosted checkout signature_header '{}' is not a valid header name",
                self.signature_header
            ));
        }
        for (name, value) in [("base_url", &self.base_url), ("redirect_url", &self.redirect_url)] {
            url::Url::parse(value)
                .map_err(|e| format!("hosted checkout {} '{}' is invalid: {}", name, value, e))?;
        }
        crate::config::validate_gateway_timeout(self.timeout)
    }
}

// Wire types

#[derive(Serialize)]
struct CreateLink<'a> {
    amount: u64,
    currency: &'a str,
    accept_partial: bool,
    reference_id: &'a str,
    description: String,
    callback_url: &'a str,
    callback_method: &'static str,
    notes: LinkNotes<'a>,
}

#[derive(Serialize)]
struct LinkNotes<'a> {
    merchant_transaction_id: &'a str,
    user_id: &'a str,
    plan_id: &'a str,
    billing_cycle: &'a str,
}

#[derive(Deserialize)]
struct PaymentLink {
    id: String,
    #[serde(default)]
    short_url: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reference_id: Option<String>,
    #[serde(default)]
    amount_paid: Option<u64>,
}

#[derive(Deserialize)]
struct PaymentLinkList {
    #[serde(default)]
    payment_links: Vec<PaymentLink>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct WebhookBody {
    event: String,
    #[serde(default)]
    payload: WebhookPayload,
}

#[derive(Deserialize, Default)]
struct WebhookPayload {
    #[serde(default)]
    payment: Option<Wrapped<WebhookPayment>>,
    #[serde(default)]
    payment_link: Option<Wrapped<WebhookPaymentLink>>,
}

#[derive(Deserialize)]
struct Wrapped<T> {
    entity: T,
}

#[derive(Deserialize)]
struct WebhookPayment {
    id: String,
    #[serde(default)]
    amount: Option<u64>,
    #[serde(default)]
    notes: serde_json::Value,
}

#[derive(Deserialize)]
struct WebhookPaymentLink {
    #[serde(default)]
    reference_id: Option<String>,
    #[serde(default)]
    amount_paid: Option<u64>,
}

/// Map a webhook event name to an outcome. Unknown events map to `None`.
///
/// `payment.failed` is one declined try; the link stays payable, so only the
/// link itself being cancelled or expiring ends the attempt as failed.
#[must_use]
pub fn outcome_for_event(event: &str) -> Option<PaymentOutcome> {
    match event {
        "payment.captured" | "payment_link.paid" | "order.paid" => Some(PaymentOutcome::Completed),
        "payment_link.cancelled" | "payment_link.expired" => Some(PaymentOutcome::Failed),
        "payment.failed" | "payment.authorized" => Some(PaymentOutcome::Processing),
        _ => None,
    }
}

fn outcome_for_link_status(status: &str) -> PaymentOutcome {
    match status {
        "paid" => PaymentOutcome::Completed,
        "cancelled" | "expired" => PaymentOutcome::Failed,
        _ => PaymentOutcome::Processing,
    }
}

/// Adapter for the hosted-checkout gateway.
pub struct HostedCheckoutGateway {
    config: HostedCheckoutConfig,
    transport: Arc<dyn GatewayTransport>,
}

impl HostedCheckoutGateway {
    pub fn new(config: HostedCheckoutConfig, transport: Arc<dyn GatewayTransport>) -> Self {
        Self { config, transport }
    }

    #[must_use]
    pub fn config(&self) -> &HostedCheckoutConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorization(&self) -> String {
        let credentials = format!("{}:{}", self.config.key_id, self.config.key_secret.expose_secret());
        format!("Basic {}", BASE64.encode(credentials))
    }

    /// Build the authenticated payment-link request for `draft`.
    pub fn build_initiate_request(&self, draft: &PaymentAttemptDraft) -> Result<GatewayRequest> {
        let cycle = draft.billing_cycle.as_str();
        let body = CreateLink {
            amount: draft.amount_minor_units,
            currency: &draft.currency,
            accept_partial: false,
            reference_id: &draft.merchant_transaction_id,
            description: format!("{} plan ({})", draft.plan_id, cycle.to_ascii_lowercase()),
            callback_url: &self.config.redirect_url,
            callback_method: "get",
            notes: LinkNotes {
                merchant_transaction_id: &draft.merchant_transaction_id,
                user_id: &draft.user_id,
                plan_id: &draft.plan_id,
                billing_cycle: cycle,
            },
        };
        let body = serde_json::to_string(&body)
            .map_err(|e| PaymentError::validation("payload", e.to_string()))?;

        Ok(GatewayRequest::post_json(self.url(PAYMENT_LINKS_PATH), body)
            .header("Authorization", self.authorization()))
    }

    fn rejection(&self, response: &GatewayResponse, fallback: &str) -> PaymentError {
        let detail = serde_json::from_str::<ErrorBody>(&response.body).ok().map(|b| b.error);
        let (code, message) = match detail {
            Some(d) => (d.code, d.description),
            None => (None, None),
        };
        PaymentError::GatewayRejected {
            gateway: Gateway::HostedCheckout,
            message: message.unwrap_or_else(|| fallback.to_string()),
            code,
            http_status: Some(response.status),
            raw_body: response.body.clone(),
        }
    }
}

#[async_trait]
impl GatewayAdapter for HostedCheckoutGateway {
    fn gateway(&self) -> Gateway {
        Gateway::HostedCheckout
    }

    fn signature_header(&self) -> &str {
        &self.config.signature_header
    }

    async fn initiate(&self, draft: &PaymentAttemptDraft) -> Result<InitiatedPayment> {
        let request = self.build_initiate_request(draft)?;

        tracing::debug!(
            target: TARGET,
            merchant_transaction_id = %draft.merchant_transaction_id,
            amount = draft.amount_minor_units,
            "Creating payment link"
        );

        let response = send_with_timeout(
            Gateway::HostedCheckout,
            self.transport.as_ref(),
            request,
            self.config.timeout,
        )
        .await?;

        if !response.is_success() {
            return Err(self.rejection(&response, "payment link creation failed"));
        }

        let link: PaymentLink = decode_json(Gateway::HostedCheckout, &response)?;
        let redirect_url = link
            .short_url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                PaymentError::rejected(
                    Gateway::HostedCheckout,
                    "payment link has no URL",
                    response.body.clone(),
                )
            })?;

        Ok(InitiatedPayment {
            merchant_transaction_id: draft.merchant_transaction_id.clone(),
            redirect_url,
            gateway_reference: Some(link.id),
        })
    }

    async fn poll_status(&self, merchant_transaction_id: &str) -> Result<GatewayStatusReport> {
        validate_transaction_id(merchant_transaction_id)?;

        let url = format!(
            "{}?reference_id={}",
            self.url(PAYMENT_LINKS_PATH),
            urlencoding::encode(merchant_transaction_id)
        );
        let request = GatewayRequest::get(url).header("Authorization", self.authorization());

        let response = send_with_timeout(
            Gateway::HostedCheckout,
            self.transport.as_ref(),
            request,
            self.config.timeout,
        )
        .await?;

        if !response.is_success() {
            return Err(self.rejection(&response, "payment link lookup failed"));
        }

        let list: PaymentLinkList = decode_json(Gateway::HostedCheckout, &response)?;
        let link = list
            .payment_links
            .into_iter()
            .find(|l| l.reference_id.as_deref() == Some(merchant_transaction_id))
            .ok_or_else(|| {
                PaymentError::rejected(
                    Gateway::HostedCheckout,
                    format!("no payment link for '{}'", merchant_transaction_id),
                    response.body.clone(),
                )
            })?;

        let status = link.status.unwrap_or_default();
        let outcome = outcome_for_link_status(&status);

        Ok(GatewayStatusReport {
            gateway: Gateway::HostedCheckout,
            merchant_transaction_id: merchant_transaction_id.to_string(),
            outcome,
            amount_minor_units: link.amount_paid.filter(|_| outcome == PaymentOutcome::Completed),
            gateway_reference: Some(link.id),
            gateway_code: Some(status),
            raw_payload: response.body,
        })
    }

    fn authenticate_callback(&self, raw_body: &[u8], supplied: Option<&str>) -> Result<CallbackEvent> {
        let verified = supplied.is_some_and(|sig| {
            signature::verify_hosted_checkout(raw_body, self.config.webhook_secret.expose_secret(), sig)
        });
        if !verified {
            return Err(PaymentError::InvalidSignature {
                gateway: Gateway::HostedCheckout,
            });
        }

        let payload_err = |message: String| PaymentError::InvalidPayload {
            gateway: Gateway::HostedCheckout,
            message,
        };

        let raw_payload = std::str::from_utf8(raw_body)
            .map_err(|_| payload_err("body is not UTF-8".to_string()))?
            .to_string();
        let body: WebhookBody = serde_json::from_str(&raw_payload)
            .map_err(|e| payload_err(format!("body is not a webhook event: {}", e)))?;

        let Some(outcome) = outcome_for_event(&body.event) else {
            return Ok(CallbackEvent {
                gateway: Gateway::HostedCheckout,
                event_type: body.event,
                report: None,
            });
        };

        let payment = body.payload.payment.map(|w| w.entity);
        let link = body.payload.payment_link.map(|w| w.entity);

        let from_notes = payment.as_ref().and_then(|p| {
            p.notes
                .get("merchant_transaction_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });
        let merchant_transaction_id = link
            .as_ref()
            .and_then(|l| l.reference_id.clone())
            .or(from_notes)
            .ok_or_else(|| payload_err(format!("'{}' event has no transaction reference", body.event)))?;

        let amount_minor_units = link
            .as_ref()
            .and_then(|l| l.amount_paid)
            .filter(|paid| *paid > 0)
            .or_else(|| payment.as_ref().and_then(|p| p.amount));

        Ok(CallbackEvent {
            gateway: Gateway::HostedCheckout,
            event_type: body.event.clone(),
            report: Some(GatewayStatusReport {
                gateway: Gateway::HostedCheckout,
                merchant_transaction_id,
                outcome,
                amount_minor_units,
                gateway_reference: payment.map(|p| p.id),
                gateway_code: Some(body.event),
                raw_payload,
            }),
        })
    }
}

/// Webhook fixtures for tests.
#[cfg(any(test, feature = "test-payments"))]
pub mod test {
    use super::*;

    /// Sign `body` with the configured webhook secret.
    pub fn sign_webhook(config: &HostedCheckoutConfig, body: &str) -> String {
        signature::sign_hosted_checkout(body.as_bytes(), config.webhook_secret.expose_secret())
    }

    /// A `payment_link.*` webhook body for `merchant_transaction_id`.
    pub fn payment_link_event(event: &str, merchant_transaction_id: &str, amount_paid: u64) -> String {
        serde_json::json!({
            "entity": "event",
            "event": event,
            "contains": ["payment_link", "payment"],
            "payload": {
                "payment_link": {
                    "entity": {
                        "id": "plink_ExjpAUN3gVHrPJ",
                        "reference_id": merchant_transaction_id,
                        "amount_paid": amount_paid,
                        "status": if event == "payment_link.paid" { "paid" } else { "cancelled" },
                    }
                },
                "payment": {
                    "entity": {
                        "id": "pay_Fjg3FCHbHRtmfl",
                        "amount": amount_paid,
                        "status": "captured",
                        "notes": { "merchant_transaction_id": merchant_transaction_id },
                    }
                }
            },
            "created_at": 1_602_000_000
        })
        .to_string()
    }
}
