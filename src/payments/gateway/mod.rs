//! Gateway adapters.
//!
//! Each supported provider implements [`GatewayAdapter`]: build and sign the
//! outbound initiation request, poll status, and authenticate inbound
//! callbacks. Adapters never touch persistence; they only translate between
//! provider wire formats and [`GatewayStatusReport`].

pub mod checksum;
pub mod hosted;
pub mod transport;

pub use checksum::{ChecksumGateway, ChecksumGatewayConfig};
pub use hosted::{HostedCheckoutConfig, HostedCheckoutGateway};
pub use transport::{
    GatewayRequest, GatewayResponse, GatewayTransport, HttpMethod, ReqwestTransport,
    TransportError,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::error::{PaymentError, Result};
use super::types::{Gateway, PaymentAttemptDraft, PaymentStatus};

/// Result of a successful initiation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatedPayment {
    pub merchant_transaction_id: String,
    /// Where to send the user to pay.
    pub redirect_url: String,
    /// Provider-side id, when the provider returns one.
    pub gateway_reference: Option<String>,
}

/// Payment outcome as reported by a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentOutcome {
    Processing,
    Completed,
    Failed,
}

impl PaymentOutcome {
    #[must_use]
    pub fn status(&self) -> PaymentStatus {
        match self {
            Self::Processing => PaymentStatus::Processing,
            Self::Completed => PaymentStatus::Completed,
            Self::Failed => PaymentStatus::Failed,
        }
    }
}

/// A verified statement from a gateway about one transaction.
///
/// Produced both by status polls and by authenticated callbacks, and applied
/// to the ledger by the same code path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStatusReport {
    pub gateway: Gateway,
    pub merchant_transaction_id: String,
    pub outcome: PaymentOutcome,
    /// Amount the gateway says was paid, if it says.
    pub amount_minor_units: Option<u64>,
    pub gateway_reference: Option<String>,
    /// Provider code or event name behind `outcome`.
    pub gateway_code: Option<String>,
    /// The authenticated payload, verbatim.
    pub raw_payload: String,
}

/// An authenticated callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEvent {
    pub gateway: Gateway,
    pub event_type: String,
    /// `None` for events that carry no payment state change.
    pub report: Option<GatewayStatusReport>,
}

/// A payment provider.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    /// Which gateway this adapter speaks for.
    fn gateway(&self) -> Gateway;

    /// Header carrying the callback signature.
    fn signature_header(&self) -> &str;

    /// Create the payment at the provider and return the redirect target.
    ///
    /// Never reports success on its own: a failed call is an error, and a
    /// successful call only means the user can now be sent to pay.
    async fn initiate(&self, draft: &PaymentAttemptDraft) -> Result<InitiatedPayment>;

    /// Ask the provider for the current state of a transaction.
    async fn poll_status(&self, merchant_transaction_id: &str) -> Result<GatewayStatusReport>;

    /// Verify the callback signature over the raw body, then parse it.
    ///
    /// Nothing in the body is trusted until the signature matches.
    fn authenticate_callback(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<CallbackEvent>;
}

/// Adapters keyed by gateway.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    adapters: HashMap<Gateway, Arc<dyn GatewayAdapter>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same gateway.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn GatewayAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn GatewayAdapter>) {
        self.adapters.insert(adapter.gateway(), adapter);
    }

    pub fn get(&self, gateway: Gateway) -> Result<Arc<dyn GatewayAdapter>> {
        self.adapters
            .get(&gateway)
            .cloned()
            .ok_or_else(|| PaymentError::UnsupportedGateway {
                gateway: gateway.to_string(),
            })
    }

    #[must_use]
    pub fn gateways(&self) -> Vec<Gateway> {
        let mut gateways: Vec<_> = self.adapters.keys().copied().collect();
        gateways.sort_by_key(|g| g.as_str());
        gateways
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Send through `transport`, bounded by `timeout`.
///
/// Timeouts and network failures become `GatewayUnreachable`.
pub(crate) async fn send_with_timeout(
    gateway: Gateway,
    transport: &dyn GatewayTransport,
    request: GatewayRequest,
    timeout: Duration,
) -> Result<GatewayResponse> {
    let url = request.url.clone();
    let result = tokio::time::timeout(timeout, transport.send(request)).await;

    let error = match result {
        Ok(Ok(response)) => return Ok(response),
        Ok(Err(e)) => e,
        Err(_elapsed) => TransportError::Timeout,
    };

    tracing::warn!(
        target: "carepay::payments::gateway",
        gateway = %gateway,
        url = %url,
        error = %error,
        "Gateway call failed"
    );

    Err(PaymentError::GatewayUnreachable {
        gateway,
        message: error.to_string(),
    })
}

/// Decode a JSON body, mapping anything unusable to `GatewayRejected` with the raw body attached.
pub(crate) fn decode_json<T: DeserializeOwned>(gateway: Gateway, response: &GatewayResponse) -> Result<T> {
    serde_json::from_str(&response.body).map_err(|e| PaymentError::GatewayRejected {
        gateway,
        message: format!("malformed response: {}", e),
        code: None,
        http_status: Some(response.status),
        raw_body: response.body.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::transport::test::MockTransport;
    use super::*;

    #[derive(Debug, serde::Deserialize)]
    struct Probe {
        ok: bool,
    }

    #[tokio::test]
    async fn transport_failures_are_unreachable() {
        let mock = MockTransport::new();
        mock.fail_with(TransportError::Connect("refused".to_string()));

        let err = send_with_timeout(
            Gateway::ChecksumQr,
            &mock,
            GatewayRequest::get("https://gw.test"),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PaymentError::GatewayUnreachable { gateway: Gateway::ChecksumQr, .. }));
        assert!(err.is_retryable());
    }

    struct Stalled;

    #[async_trait]
    impl GatewayTransport for Stalled {
        async fn send(&self, _request: GatewayRequest) -> std::result::Result<GatewayResponse, TransportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(GatewayResponse::new(200, "{}"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_gateway_times_out() {
        let err = send_with_timeout(
            Gateway::HostedCheckout,
            &Stalled,
            GatewayRequest::get("https://gw.test"),
            Duration::from_secs(15),
        )
        .await
        .unwrap_err();

        match err {
            PaymentError::GatewayUnreachable { message, .. } => assert!(message.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_rejected_with_raw_body() {
        let response = GatewayResponse::new(200, "<html>bad gateway</html>");
        let err = decode_json::<Probe>(Gateway::ChecksumQr, &response).unwrap_err();
        match err {
            PaymentError::GatewayRejected { raw_body, http_status, .. } => {
                assert_eq!(raw_body, "<html>bad gateway</html>");
                assert_eq!(http_status, Some(200));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let ok: Probe = decode_json(Gateway::ChecksumQr, &GatewayResponse::new(200, r#"{"ok":true}"#)).unwrap();
        assert!(ok.ok);
    }

    #[test]
    fn registry_lookup() {
        let registry = GatewayRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get(Gateway::ChecksumQr),
            Err(PaymentError::UnsupportedGateway { .. })
        ));
    }
}
