use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::response::{CreatedResponse, JsonResponse};
use super::routes::RouteModule;
use crate::app::AppContext;
use crate::auth::AuthUser;
use crate::error::{CarepayError, Result};
use crate::payments::{
    BillingCycle, CheckoutRequest, Gateway, InitiatedPayment, PaymentAttempt, PaymentStatus, Plan,
    PriceQuote, Subscription, SubscriptionSummary,
};

/// Checkout, status polling, gateway callbacks and the signed-in user's
/// subscription views.
///
/// Everything under `/api/me` and `/api/payments` acts for the bearer
/// token's subject. Callbacks are authenticated by gateway signature only.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaymentRoutes;

impl RouteModule for PaymentRoutes {
    fn routes(&self) -> Router<AppContext> {
        Router::new()
            .route("/api/plans", get(list_plans))
            .route("/api/payments", post(checkout))
            .route("/api/payments/{merchant_transaction_id}/status", get(payment_status))
            .route("/api/webhooks/{gateway}", post(gateway_callback))
            .route("/api/me/quote", get(quote))
            .route("/api/me/payments", get(payment_history))
            .route("/api/me/subscription", get(subscription_summary))
            .route("/api/me/subscription/cancel", post(cancel_subscription))
            .route("/api/me/subscription/resume", post(resume_subscription))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStatusResponse {
    pub merchant_transaction_id: String,
    pub status: PaymentStatus,
}

#[derive(Debug, Deserialize)]
struct QuoteParams {
    plan_id: String,
    billing_cycle: BillingCycle,
}

#[derive(Debug, Default, Deserialize)]
struct CancelParams {
    /// End access now instead of at the end of the paid period.
    #[serde(default)]
    immediate: bool,
}

async fn list_plans(State(ctx): State<AppContext>) -> JsonResponse<Vec<Plan>> {
    let plans: Vec<Plan> = ctx.payments()?.plans().sorted().into_iter().cloned().collect();
    Ok(Json(plans))
}

async fn quote(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Query(params): Query<QuoteParams>,
) -> JsonResponse<PriceQuote> {
    let quote = ctx
        .payments()?
        .quote(&user.user_id, &params.plan_id, params.billing_cycle)
        .await?;
    Ok(Json(quote))
}

/// Start a checkout priced from the plan catalog.
async fn checkout(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<CreatedResponse<InitiatedPayment>> {
    let initiated = ctx.payments()?.checkout(&user.user_id, &request).await?;
    let location = format!("/api/payments/{}/status", initiated.merchant_transaction_id);
    Ok(CreatedResponse::new(initiated, location))
}

/// Another user's attempt answers 404, the same as a missing one.
async fn payment_status(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Path(merchant_transaction_id): Path<String>,
) -> JsonResponse<PaymentStatusResponse> {
    let payments = ctx.payments()?;
    let owned = payments
        .get_attempt(&merchant_transaction_id)
        .await?
        .is_some_and(|attempt| attempt.user_id == user.user_id);
    if !owned {
        return Err(CarepayError::not_found(format!(
            "Payment attempt not found: {}",
            merchant_transaction_id
        )));
    }

    let status = payments.poll_status(&merchant_transaction_id).await?;
    Ok(Json(PaymentStatusResponse {
        merchant_transaction_id,
        status,
    }))
}

/// Callback endpoint. The body is taken as raw bytes so the signature is
/// checked against exactly what the gateway sent.
async fn gateway_callback(
    State(ctx): State<AppContext>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let gateway: Gateway = gateway
        .parse()
        .map_err(|_| CarepayError::not_found(format!("no callback route for '{}'", gateway)))?;

    let verifier = ctx.callbacks()?;
    let header = verifier.signature_header(gateway)?;
    let signature = headers.get(header.as_str()).and_then(|v| v.to_str().ok());

    match verifier.handle(gateway, &body, signature).await {
        Ok(outcome) => Ok(Json(outcome).into_response()),
        Err(e) if e.is_acknowledgeable() => {
            Ok(Json(serde_json::json!({ "outcome": "acknowledged" })).into_response())
        }
        Err(e) => Err(e.into()),
    }
}

async fn payment_history(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
) -> JsonResponse<Vec<PaymentAttempt>> {
    Ok(Json(ctx.payments()?.attempts_for_user(&user.user_id).await?))
}

async fn subscription_summary(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
) -> JsonResponse<SubscriptionSummary> {
    Ok(Json(ctx.ledger()?.status_summary(&user.user_id).await?))
}

/// Cancel at the end of the paid period, or now with `?immediate=true`.
async fn cancel_subscription(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Query(params): Query<CancelParams>,
) -> JsonResponse<Subscription> {
    Ok(Json(ctx.ledger()?.cancel(&user.user_id, params.immediate).await?))
}

async fn resume_subscription(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
) -> JsonResponse<Subscription> {
    Ok(Json(ctx.ledger()?.resume(&user.user_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, JwtAuthProvider};
    use crate::payments::audit::test::RecordingAuditLogger;
    use crate::payments::gateway::checksum::test::{callback_payload, signed_callback};
    use crate::payments::gateway::transport::test::MockTransport;
    use crate::payments::gateway::checksum::VERIFY_HEADER;
    use crate::payments::{
        ChecksumGateway, ChecksumGatewayConfig, GatewayRegistry, InMemoryPaymentStore, PaymentAttemptDraft,
        PaymentStore, Plans,
    };
    use crate::testing;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use std::sync::Arc;

    const SECRET: &str = "an-hs256-secret-of-at-least-32-bytes";

    fn checksum_config() -> ChecksumGatewayConfig {
        ChecksumGatewayConfig::new("MERCHANTUAT", "salt", "1")
            .with_redirect_url("https://app.test/payment/success")
            .with_callback_url("https://api.test/api/webhooks/checksum-qr")
    }

    fn bearer(user_id: &str) -> String {
        let token = JwtAuthProvider::new(&AuthConfig::new(SECRET))
            .issue(user_id, Duration::minutes(5))
            .unwrap();
        format!("Bearer {}", token)
    }

    fn router_with_store(transport: &MockTransport, store: Arc<InMemoryPaymentStore>) -> Router {
        let gateways = GatewayRegistry::new().with_adapter(Arc::new(ChecksumGateway::new(
            checksum_config(),
            Arc::new(transport.clone()),
        )));
        let plans = Plans::builder()
            .plan("premium")
            .monthly_price(84_900)
            .annual_price(849_000)
            .first_time_monthly_price(49_900)
            .done()
            .build();
        let ctx = AppContext::builder()
            .with_auth_config(&AuthConfig::new(SECRET))
            .with_plans(plans)
            .with_gateways(gateways)
            .with_payment_store(store)
            .with_audit_logger(Arc::new(RecordingAuditLogger::new()))
            .build();
        PaymentRoutes.routes().with_state(ctx)
    }

    fn router(transport: &MockTransport) -> Router {
        router_with_store(transport, Arc::new(InMemoryPaymentStore::new()))
    }

    #[tokio::test]
    async fn unknown_gateway_slug_is_not_found() {
        testing::post(router(&MockTransport::new()), "/api/webhooks/paypal")
            .raw_body("{}")
            .execute()
            .await
            .assert_not_found();
    }

    #[tokio::test]
    async fn unsigned_callback_is_unauthorized() {
        testing::post(router(&MockTransport::new()), "/api/webhooks/checksum-qr")
            .raw_body(r#"{"response":"e30="}"#)
            .execute()
            .await
            .assert_unauthorized();
    }

    #[tokio::test]
    async fn callback_for_unknown_attempt_is_not_found() {
        let payload = callback_payload("MERCHANTUAT", "MT404", "PAYMENT_SUCCESS", 84_900);
        let (body, signature) = signed_callback(&checksum_config(), &payload);

        testing::post(router(&MockTransport::new()), "/api/webhooks/checksum-qr")
            .header(VERIFY_HEADER, &signature)
            .raw_body(body)
            .execute()
            .await
            .assert_not_found();
    }

    #[tokio::test]
    async fn missing_services_answer_unavailable() {
        let app = PaymentRoutes.routes().with_state(AppContext::new());
        testing::get(app, "/api/me/subscription")
            .header("authorization", &bearer("u1"))
            .execute()
            .await
            .assert_unavailable();
    }

    #[tokio::test]
    async fn user_routes_require_a_token() {
        for (method, path) in [
            ("GET", "/api/me/subscription"),
            ("GET", "/api/me/payments"),
            ("POST", "/api/me/subscription/cancel"),
            ("POST", "/api/me/subscription/resume"),
            ("GET", "/api/payments/MT1/status"),
        ] {
            let app = router(&MockTransport::new());
            let request = match method {
                "GET" => testing::get(app, path),
                _ => testing::post(app, path),
            };
            request.execute().await.assert_unauthorized();
        }

        testing::post(router(&MockTransport::new()), "/api/me/subscription/cancel")
            .header("authorization", "Bearer forged.token.value")
            .execute()
            .await
            .assert_unauthorized();
    }

    #[tokio::test]
    async fn cancel_without_subscription_is_not_found() {
        testing::post(router(&MockTransport::new()), "/api/me/subscription/cancel")
            .header("authorization", &bearer("u1"))
            .execute()
            .await
            .assert_not_found();
    }

    #[tokio::test]
    async fn status_of_another_users_attempt_is_not_found() {
        let store = Arc::new(InMemoryPaymentStore::new());
        let attempt = crate::payments::PaymentAttempt::from_draft(
            &PaymentAttemptDraft {
                merchant_transaction_id: "MT1".to_string(),
                gateway: Gateway::ChecksumQr,
                amount_minor_units: 84_900,
                currency: "INR".to_string(),
                user_id: "owner".to_string(),
                plan_id: "premium".to_string(),
                billing_cycle: BillingCycle::Monthly,
            },
            Utc::now(),
        );
        store.insert_attempt(&attempt).await.unwrap();
        let transport = MockTransport::new();

        testing::get(router_with_store(&transport, store), "/api/payments/MT1/status")
            .header("authorization", &bearer("intruder"))
            .execute()
            .await
            .assert_not_found();
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn plans_are_public_and_quotes_are_personal() {
        testing::get(router(&MockTransport::new()), "/api/plans")
            .execute()
            .await
            .assert_ok()
            .assert_json_path("0.slug", json!("premium"))
            .await;

        testing::get(router(&MockTransport::new()), "/api/me/quote")
            .with_query(&[("plan_id", "premium"), ("billing_cycle", "MONTHLY")])
            .header("authorization", &bearer("u1"))
            .execute()
            .await
            .assert_ok()
            .assert_json_path("amount_minor_units", json!(49_900))
            .await
            .assert_json_path("first_time", json!(true))
            .await;

        testing::get(router(&MockTransport::new()), "/api/me/quote")
            .with_query(&[("plan_id", "platinum"), ("billing_cycle", "MONTHLY")])
            .header("authorization", &bearer("u1"))
            .execute()
            .await
            .assert_bad_request();
    }

    #[tokio::test]
    async fn checkout_ignores_a_client_amount() {
        let transport = MockTransport::new();
        transport.respond_with(
            200,
            r#"{"success":true,"code":"PAYMENT_INITIATED","data":{"merchantTransactionId":"MT1","instrumentResponse":{"type":"PAY_PAGE","redirectInfo":{"url":"https://gw.test/pay/abc","method":"GET"}}}}"#,
        );
        let store = Arc::new(InMemoryPaymentStore::new());

        testing::post(router_with_store(&transport, store.clone()), "/api/payments")
            .header("authorization", &bearer("u1"))
            .json_body(&json!({
                "merchant_transaction_id": "MT1",
                "gateway": "CHECKSUM_QR",
                "plan_id": "premium",
                "billing_cycle": "ANNUAL",
                "amount_minor_units": 1,
            }))
            .execute()
            .await
            .assert_created();

        let attempt = store.get_attempt("MT1").await.unwrap().unwrap();
        assert_eq!(attempt.amount_minor_units, 849_000);
        assert_eq!(attempt.user_id, "u1");
    }
}
