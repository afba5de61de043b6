//! Payment verification and subscription ledger.
//!
//! Two gateway protocols sit behind [`GatewayAdapter`]. Payments are started
//! through [`PaymentService`], confirmed by [`CallbackVerifier`] or a status
//! poll, and turned into subscription periods exactly once by the ledger.
//!
//! # Example
//!
//! ```rust,ignore
//! use carepay::payments::*;
//! use std::sync::Arc;
//!
//! let store: Arc<dyn PaymentStore> = Arc::new(InMemoryPaymentStore::new());
//! let audit: Arc<dyn PaymentAuditLogger> = Arc::new(TracingAuditLogger);
//! let transport = Arc::new(ReqwestTransport::new(std::time::Duration::from_secs(15))?);
//!
//! let gateways = GatewayRegistry::new()
//!     .with_adapter(Arc::new(ChecksumGateway::new(checksum_config, transport.clone())))
//!     .with_adapter(Arc::new(HostedCheckoutGateway::new(hosted_config, transport)));
//!
//! let service = PaymentService::new(gateways.clone(), store.clone(), audit.clone())
//!     .with_plans(Plans::from_json(r#"[{"slug":"premium","monthly_price":84900,"annual_price":849000}]"#)?);
//! let callbacks = CallbackVerifier::new(gateways, store.clone(), audit.clone());
//! let ledger = SubscriptionLedger::new(store, audit);
//! ```

pub mod audit;
pub mod callback;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod plans;
#[cfg(feature = "database")]
pub mod sea_orm_store;
pub mod service;
mod settlement;
pub mod signature;
pub mod store;
pub mod types;

pub use audit::{NoOpAuditLogger, PaymentAuditEvent, PaymentAuditLogger, TracingAuditLogger};
pub use callback::{CallbackOutcome, CallbackVerifier};
pub use error::{PaymentError, Result};
pub use gateway::{
    CallbackEvent, ChecksumGateway, ChecksumGatewayConfig, GatewayAdapter, GatewayRegistry,
    GatewayStatusReport, GatewayTransport, HostedCheckoutConfig, HostedCheckoutGateway,
    InitiatedPayment, PaymentOutcome, ReqwestTransport,
};
pub use ledger::{
    Subscription, SubscriptionGrant, SubscriptionLedger, SubscriptionStatus, SubscriptionSummary,
};
pub use plans::{Plan, Plans, PriceQuote};
#[cfg(feature = "database")]
pub use sea_orm_store::{SeaOrmPaymentStore, create_schema};
pub use service::PaymentService;
pub use settlement::SettlementResult;
pub use store::{GrantOutcome, InMemoryPaymentStore, PaymentStore, SettleOutcome, Settlement};
pub use types::{
    BillingCycle, CheckoutRequest, Gateway, PaymentAttempt, PaymentAttemptDraft, PaymentStatus,
};
