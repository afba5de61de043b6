//! carepay - payment verification and subscription gating
//!
//! Starts payments with two gateway protocols, authenticates their signed
//! callbacks, turns each successful payment into exactly one subscription
//! period, and decides where a user may navigate from their onboarding,
//! subscription and assessment state.
//!
//! # Features
//!
//! - **Gateways**: a checksum-signed QR/pay-page protocol and a hosted checkout
//!   with HMAC webhooks, behind one `GatewayAdapter` trait
//! - **Callbacks**: verification over the raw body, idempotent ledger updates
//! - **Pricing**: a server-side plan catalog; clients name a plan, never an amount
//! - **Ledger**: subscription grants keyed by the funding payment attempt,
//!   cancellation at period end or immediately
//! - **Auth**: bearer JWTs identify the user for every `/api/me` route
//! - **Access gate**: a table-driven, pure routing decision
//! - **HTTP**: axum route modules over a shared `AppContext`
//! - **Testing**: Alba-style HTTP scenarios
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use carepay::{AccessRoutes, App, AppContext, ConfigBuilder, PaymentRoutes};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     carepay::init_tracing_with_config(&config);
//!
//!     let mut context = AppContext::builder()
//!         .with_gateway_config(&config.gateways)?
//!         .with_plans(config.plans.clone())
//!         .with_access_paths(config.access.clone());
//!     if let Some(auth) = &config.auth {
//!         context = context.with_auth_config(auth);
//!     }
//!     let context = context.build();
//!
//!     App::with_config(config)
//!         .with_context(context)
//!         .register_module(PaymentRoutes)
//!         .register_module(AccessRoutes)
//!         .serve()
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod access;
mod app;
pub mod auth;
mod config;
mod core;
mod error;
mod http;
mod middleware;
pub mod payments;
pub mod testing;
mod utils;

// Re-exports for public API
pub use access::{AccessGate, AccessPaths, RouteDecision, UserAccessFacts};
pub use app::{AppContext, AppContextBuilder, gateways_from_config};
pub use auth::{AuthConfig, AuthUser, JwtAuthProvider, OptionalAuth};
pub use config::{
    Config, ConfigBuilder, DEFAULT_GATEWAY_TIMEOUT_SECS, GatewaysConfig, LoggingConfig,
    ServerConfig,
};
pub use self::core::{App, AppBuilder};
pub use error::{CarepayError, ErrorContext, ErrorResponse, ErrorWithContext, Result};
pub use http::{
    AccessDecisionRequest, AccessRoutes, CreatedResponse, JsonResponse, PaymentRoutes,
    PaymentStatusResponse, RouteModule,
};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "carepay::security=warn")
/// - `CAREPAY_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    install_subscriber(env_filter, json_logs);
}

/// Initialize tracing from `config.logging`; `RUST_LOG` still wins when set.
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    install_subscriber(env_filter, config.logging.json);
}

fn install_subscriber(env_filter: EnvFilter, json: bool) {
    // try_init: a second call (tests, embedding apps) keeps the first subscriber.
    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
