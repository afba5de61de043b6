//! Checksum / QR gateway adapter.
//!
//! Requests carry a base64 JSON payload signed with
//! `SHA256(payload + route + secret)###index` in the `X-VERIFY` header.
//! Callbacks arrive as `{"response": "<base64 JSON>"}` signed the same way
//! over the callback route.

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

const TARGET: &str = "carepay::payments::gateway::checksum";

/// Header carrying checksum signatures, both directions.
pub const VERIFY_HEADER: &str = "X-VERIFY";
const MERCHANT_HEADER: &str = "X-MERCHANT-ID";

/// Configuration for the checksum gateway.
#[derive(Clone)]
pub struct ChecksumGatewayConfig {
    pub merchant_id: String,
    /// Salt appended to every signed string.
    pub secret_key: SecretString,
    /// Identifies which salt was used; sent after `###`.
    pub key_index: String,
    pub base_url: String,
    pub pay_path: String,
    pub status_path_prefix: String,
    /// Route the gateway signs callbacks against.
    pub callback_path: String,
    /// Browser return URL; transaction, plan and cycle are appended as query parameters.
    pub redirect_url: String,
    /// Server-to-server callback URL.
    pub callback_url: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for ChecksumGatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumGatewayConfig")
            .field("merchant_id", &self.merchant_id)
            .field("secret_key", &"[REDACTED]")
            .field("key_index", &self.key_index)
            .field("base_url", &self.base_url)
            .field("callback_path", &self.callback_path)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ChecksumGatewayConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.phonepe.com/apis/hermes";
    pub const DEFAULT_PAY_PATH: &'static str = "/pg/v1/pay";
    pub const DEFAULT_STATUS_PATH_PREFIX: &'static str = "/pg/v1/status";
    pub const DEFAULT_CALLBACK_PATH: &'static str = "/api/webhooks/checksum-qr";

    /// Config with protocol defaults; URLs still need to be set.
    pub fn new(merchant_id: impl Into<String>, secret_key: impl Into<String>, key_index: impl Into<String>) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            secret_key: SecretString::from(secret_key.into()),
            key_index: key_index.into(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            pay_path: Self::DEFAULT_PAY_PATH.to_string(),
            status_path_prefix: Self::DEFAULT_STATUS_PATH_PREFIX.to_string(),
            callback_path: Self::DEFAULT_CALLBACK_PATH.to_string(),
            redirect_url: String::new(),
            callback_url: String::new(),
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
    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = url.into();
        self
    }

    #[must_use]
    pub fn with_callback_path(mut self, path: impl Into<String>) -> Self {
        self.callback_path = path.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load from `CAREPAY_CHECKSUM_*` variables.
    ///
    /// Returns `None` unless both the merchant id and the secret key are set.
    pub fn from_env() -> Option<Self> {
        let merchant_id = get_env_with_prefix("CHECKSUM_MERCHANT_ID")?;
        let secret_key = get_env_with_prefix("CHECKSUM_SECRET_KEY")?;
        let key_index = get_env_with_prefix("CHECKSUM_KEY_INDEX").unwrap_or_else(|| "1".to_string());

        let mut config = Self::new(merchant_id, secret_key, key_index);
        if let Some(v) = get_env_with_prefix("CHECKSUM_BASE_URL") {
            config.base_url = v;
        }
        if let Some(v) = get_env_with_prefix("CHECKSUM_PAY_PATH") {
            config.pay_path = v;
        }
        if let Some(v) = get_env_with_prefix("CHECKSUM_STATUS_PATH_PREFIX") {
            config.status_path_prefix = v;
        }
        if let Some(v) = get_env_with_prefix("CHECKSUM_CALLBACK_PATH") {
            config.callback_path = v;
        }
        if let Some(v) = get_env_with_prefix("CHECKSUM_REDIRECT_URL") {
            config.redirect_url = v;
        }
        if let Some(v) = get_env_with_prefix("CHECKSUM_CALLBACK_URL") {
            config.callback_url = v;
        }
        if let Some(secs) = parse_env_with_prefix::<u64>("CHECKSUM_TIMEOUT_SECONDS") {
            config.timeout = Duration::from_secs(secs);
        }
        Some(config)
    }

    /// Check the settings the adapter relies on.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.merchant_id.trim().is_empty() {
            return Err("checksum gateway merchant_id must not be empty".to_string());
        }
        if self.secret_key.expose_secret().is_empty() {
            return Err("checksum gateway secret_key must not be empty".to_string());
        }
        if self.key_index.is_empty() || self.key_index.contains(signature::CHECKSUM_SEPARATOR) {
            return Err(format!("checksum gateway key_index '{}' is invalid", self.key_index));
        }
        for (name, value) in [
            ("base_url", &self.base_url),
            ("redirect_url", &self.redirect_url),
            ("callback_url", &self.callback_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| format!("checksum gateway {} '{}' is invalid: {}", name, value, e))?;
        }
        for (name, value) in [
            ("pay_path", &self.pay_path),
            ("status_path_prefix", &self.status_path_prefix),
            ("callback_path", &self.callback_path),
        ] {
            if !value.starts_with('/') {
                return Err(format!("checksum gateway {} must start with '/'", name));
            }
        }
        crate::config::validate_gateway_timeout(self.timeout)
    }
}

// Wire types

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayPayload<'a> {
    merchant_id: &'a str,
    merchant_transaction_id: &'a str,
    merchant_user_id: &'a str,
    amount: u64,
    redirect_url: String,
    redirect_mode: &'static str,
    callback_url: &'a str,
    payment_instrument: PaymentInstrument,
}

#[derive(Serialize)]
struct PaymentInstrument {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct SignedRequest<'a> {
    request: &'a str,
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayData {
    instrument_response: Option<InstrumentResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentResponse {
    redirect_info: Option<RedirectInfo>,
}

#[derive(Deserialize)]
struct RedirectInfo {
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionData {
    merchant_id: Option<String>,
    merchant_transaction_id: Option<String>,
    transaction_id: Option<String>,
    amount: Option<u64>,
    state: Option<String>,
}

#[derive(Deserialize)]
struct CallbackBody {
    response: String,
}

/// Map a gateway response code to an outcome. Unknown codes map to `None`.
#[must_use]
pub fn outcome_for_code(code: &str) -> Option<PaymentOutcome> {
    match code {
        "PAYMENT_SUCCESS" => Some(PaymentOutcome::Completed),
        "PAYMENT_PENDING" => Some(PaymentOutcome::Processing),
        "PAYMENT_ERROR" | "PAYMENT_DECLINED" | "TIMED_OUT" | "PAYMENT_CANCELLED" => {
            Some(PaymentOutcome::Failed)
        }
        _ => None,
    }
}

fn outcome_for_state(state: &str) -> Option<PaymentOutcome> {
    match state {
        "COMPLETED" => Some(PaymentOutcome::Completed),
        "PENDING" => Some(PaymentOutcome::Processing),
        "FAILED" => Some(PaymentOutcome::Failed),
        _ => None,
    }
}

/// Adapter for the checksum / QR gateway.
pub struct ChecksumGateway {
    config: ChecksumGatewayConfig,
    transport: Arc<dyn GatewayTransport>,
}

impl ChecksumGateway {
    pub fn new(config: ChecksumGatewayConfig, transport: Arc<dyn GatewayTransport>) -> Self {
        Self { config, transport }
    }

    #[must_use]
    pub fn config(&self) -> &ChecksumGatewayConfig {
        &self.config
    }

    fn secret(&self) -> &str {
        self.config.secret_key.expose_secret()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn status_path(&self, merchant_transaction_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.status_path_prefix.trim_end_matches('/'),
            self.config.merchant_id,
            merchant_transaction_id
        )
    }

    fn redirect_url_for(&self, draft: &PaymentAttemptDraft) -> Result<String> {
        let mut url = url::Url::parse(&self.config.redirect_url).map_err(|e| {
            PaymentError::validation("redirect_url", format!("invalid redirect URL: {}", e))
        })?;
        url.query_pairs_mut()
            .append_pair("orderId", &draft.merchant_transaction_id)
            .append_pair("plan", &draft.plan_id)
            .append_pair("cycle", &draft.billing_cycle.as_str().to_ascii_lowercase());
        Ok(url.into())
    }

    /// Build the signed pay request for `draft`.
    pub fn build_initiate_request(&self, draft: &PaymentAttemptDraft) -> Result<GatewayRequest> {
        let payload = PayPayload {
            merchant_id: &self.config.merchant_id,
            merchant_transaction_id: &draft.merchant_transaction_id,
            merchant_user_id: &draft.user_id,
            amount: draft.amount_minor_units,
            redirect_url: self.redirect_url_for(draft)?,
            redirect_mode: "REDIRECT",
            callback_url: &self.config.callback_url,
            payment_instrument: PaymentInstrument { kind: "PAY_PAGE" },
        };
        let payload_bytes = serde_json::to_vec(&payload)
            .map_err(|e| PaymentError::validation("payload", e.to_string()))?;

        let (encoded, x_verify) = signature::sign_checksum_protocol(
            &payload_bytes,
            &self.config.pay_path,
            self.secret(),
            &self.config.key_index,
        );

        let body = serde_json::to_string(&SignedRequest { request: &encoded })
            .map_err(|e| PaymentError::validation("payload", e.to_string()))?;

        Ok(GatewayRequest::post_json(self.url(&self.config.pay_path), body)
            .header("Accept", "application/json")
            .header(VERIFY_HEADER, x_verify)
            .header(MERCHANT_HEADER, self.config.merchant_id.clone()))
    }

    fn rejection(&self, response: &GatewayResponse, fallback: &str) -> PaymentError {
        let envelope = serde_json::from_str::<Envelope<serde_json::Value>>(&response.body).ok();
        let (code, message) = match envelope {
            Some(env) => (env.code, env.message),
            None => (None, None),
        };
        PaymentError::GatewayRejected {
            gateway: Gateway::ChecksumQr,
            message: message.unwrap_or_else(|| fallback.to_string()),
            code,
            http_status: Some(response.status),
            raw_body: response.body.clone(),
        }
    }

    fn report_from(
        &self,
        envelope: Envelope<TransactionData>,
        raw_payload: String,
    ) -> Option<(GatewayStatusReport, Option<String>)> {
        let data = envelope.data?;
        let outcome = envelope
            .code
            .as_deref()
            .and_then(outcome_for_code)
            .or_else(|| data.state.as_deref().and_then(outcome_for_state))?;

        let merchant_transaction_id = data.merchant_transaction_id?;
        Some((
            GatewayStatusReport {
                gateway: Gateway::ChecksumQr,
                merchant_transaction_id,
                outcome,
                amount_minor_units: data.amount,
                gateway_reference: data.transaction_id,
                gateway_code: envelope.code,
                raw_payload,
            },
            data.merchant_id,
        ))
    }
}

#[async_trait]
impl GatewayAdapter for ChecksumGateway {
    fn gateway(&self) -> Gateway {
        Gateway::ChecksumQr
    }

    fn signature_header(&self) -> &str {
        VERIFY_HEADER
    }

    async fn initiate(&self, draft: &PaymentAttemptDraft) -> Result<InitiatedPayment> {
        let request = self.build_initiate_request(draft)?;

        tracing::debug!(
            target: TARGET,
            merchant_transaction_id = %draft.merchant_transaction_id,
            amount = draft.amount_minor_units,
            "Sending pay request"
        );

        let response =
            send_with_timeout(Gateway::ChecksumQr, self.transport.as_ref(), request, self.config.timeout).await?;

        if !response.is_success() {
            return Err(self.rejection(&response, "pay request failed"));
        }

        let envelope: Envelope<PayData> = decode_json(Gateway::ChecksumQr, &response)?;
        if !envelope.success {
            return Err(self.rejection(&response, "pay request was not accepted"));
        }

        let redirect_url = envelope
            .data
            .and_then(|d| d.instrument_response)
            .and_then(|i| i.redirect_info)
            .map(|r| r.url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                PaymentError::GatewayRejected {
                    gateway: Gateway::ChecksumQr,
                    message: "response has no redirect URL".to_string(),
                    code: envelope.code.clone(),
                    http_status: Some(response.status),
                    raw_body: response.body.clone(),
                }
            })?;

        Ok(InitiatedPayment {
            merchant_transaction_id: draft.merchant_transaction_id.clone(),
            redirect_url,
            gateway_reference: None,
        })
    }

    async fn poll_status(&self, merchant_transaction_id: &str) -> Result<GatewayStatusReport> {
        validate_transaction_id(merchant_transaction_id)?;

        let path = self.status_path(merchant_transaction_id);
        let x_verify = signature::sign_checksum_route(&path, self.secret(), &self.config.key_index);
        let request = GatewayRequest::get(self.url(&path))
            .header("Content-Type", "application/json")
            .header(VERIFY_HEADER, x_verify)
            .header(MERCHANT_HEADER, self.config.merchant_id.clone());

        let response =
            send_with_timeout(Gateway::ChecksumQr, self.transport.as_ref(), request, self.config.timeout).await?;

        if !response.is_success() {
            return Err(self.rejection(&response, "status check failed"));
        }

        let envelope: Envelope<TransactionData> = decode_json(Gateway::ChecksumQr, &response)?;
        let success = envelope.success;
        let code = envelope.code.clone();

        let known_code = code.as_deref().and_then(outcome_for_code).is_some();
        if !success && !known_code {
            return Err(self.rejection(&response, "status check was not accepted"));
        }

        let (mut report, _) = match self.report_from(envelope, response.body.clone()) {
            Some(found) => found,
            None if success => {
                // Accepted, but nothing we recognise yet.
                (
                    GatewayStatusReport {
                        gateway: Gateway::ChecksumQr,
                        merchant_transaction_id: merchant_transaction_id.to_string(),
                        outcome: PaymentOutcome::Processing,
                        amount_minor_units: None,
                        gateway_reference: None,
                        gateway_code: code,
                        raw_payload: response.body.clone(),
                    },
                    None,
                )
            }
            None => return Err(self.rejection(&response, "status response has no transaction data")),
        };

        if report.merchant_transaction_id != merchant_transaction_id {
            return Err(PaymentError::rejected(
                Gateway::ChecksumQr,
                format!(
                    "status response is for '{}', expected '{}'",
                    report.merchant_transaction_id, merchant_transaction_id
                ),
                response.body,
            ));
        }
        report.raw_payload = response.body;

        Ok(report)
    }

    fn authenticate_callback(&self, raw_body: &[u8], supplied: Option<&str>) -> Result<CallbackEvent> {
        let invalid = || PaymentError::InvalidSignature {
            gateway: Gateway::ChecksumQr,
        };

        let Some(supplied) = supplied else {
            return Err(invalid());
        };

        // The signed material is the base64 string inside the envelope.
        let body: CallbackBody = serde_json::from_slice(raw_body).map_err(|_| invalid())?;

        if !signature::verify_checksum_protocol(
            &body.response,
            &self.config.callback_path,
            self.secret(),
            &self.config.key_index,
            supplied,
        ) {
            return Err(invalid());
        }

        let payload_err = |message: String| PaymentError::InvalidPayload {
            gateway: Gateway::ChecksumQr,
            message,
        };

        let decoded = BASE64
            .decode(body.response.as_bytes())
            .map_err(|e| payload_err(format!("response is not base64: {}", e)))?;
        let raw_payload = String::from_utf8(decoded)
            .map_err(|_| payload_err("response is not UTF-8".to_string()))?;
        let envelope: Envelope<TransactionData> = serde_json::from_str(&raw_payload)
            .map_err(|e| payload_err(format!("response is not valid JSON: {}", e)))?;

        let event_type = envelope.code.clone().unwrap_or_else(|| "UNKNOWN".to_string());
        let recognised = envelope.code.as_deref().and_then(outcome_for_code).is_some();
        if !recognised {
            return Ok(CallbackEvent {
                gateway: Gateway::ChecksumQr,
                event_type,
                report: None,
            });
        }

        let (report, merchant_id) = self
            .report_from(envelope, raw_payload)
            .ok_or_else(|| payload_err("callback has no merchantTransactionId".to_string()))?;

        if let Some(merchant_id) = merchant_id {
            if merchant_id != self.config.merchant_id {
                return Err(payload_err(format!("callback is for merchant '{}'", merchant_id)));
            }
        }

        Ok(CallbackEvent {
            gateway: Gateway::ChecksumQr,
            event_type,
            report: Some(report),
        })
    }
}

/// Signing helpers for building gateway-side fixtures in tests.
#[cfg(any(test, feature = "test-payments"))]
pub mod test {
    use super::*;

    /// Build a signed callback body and its `X-VERIFY` value, as the gateway would.
    pub fn signed_callback(config: &ChecksumGatewayConfig, payload: &serde_json::Value) -> (String, String) {
        let bytes = serde_json::to_vec(payload).unwrap();
        let (encoded, x_verify) = signature::sign_checksum_protocol(
            &bytes,
            &config.callback_path,
            config.secret_key.expose_secret(),
            &config.key_index,
        );
        let body = serde_json::json!({ "response": encoded }).to_string();
        (body, x_verify)
    }

    /// A callback payload in the gateway's shape.
    pub fn callback_payload(
        merchant_id: &str,
        merchant_transaction_id: &str,
        code: &str,
        amount: u64,
    ) -> serde_json::Value {
        serde_json::json!({
            "success": code == "PAYMENT_SUCCESS",
            "code": code,
            "message": "Callback",
            "data": {
                "merchantId": merchant_id,
                "merchantTransactionId": merchant_transaction_id,
                "transactionId": format!("T{}", merchant_transaction_id),
                "amount": amount,
                "state": match code {
                    "PAYMENT_SUCCESS" => "COMPLETED",
                    "PAYMENT_PENDING" => "PENDING",
                    _ => "FAILED",
                },
                "responseCode": code,
            }
        })
    }
}
