use std::sync::Arc;

use crate::access::{AccessFactsResolver, AccessGate, AccessPaths, InMemoryProfileStore, ProfileStore};
use crate::auth::{AuthConfig, AuthProvider, JwtAuthProvider};
use crate::config::GatewaysConfig;
use crate::error::{CarepayError, Result};
use crate::payments::{
    CallbackVerifier, ChecksumGateway, GatewayRegistry, GatewayTransport, HostedCheckoutGateway,
    InMemoryPaymentStore, PaymentAuditLogger, PaymentService, PaymentStore, Plans, ReqwestTransport,
    SubscriptionLedger, TracingAuditLogger,
};

/// Application context shared by every handler.
///
/// The payment services are optional so an app can serve only the access
/// gate. Handlers that need a missing service answer 503.
#[derive(Clone)]
pub struct AppContext {
    /// Verifies bearer tokens for the `/api/me` routes.
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub payments: Option<PaymentService>,
    pub callbacks: Option<CallbackVerifier>,
    pub ledger: Option<SubscriptionLedger>,
    pub access_facts: Option<AccessFactsResolver>,
    pub access_gate: AccessGate,
}

impl AppContext {
    pub fn new() -> Self {
        Self {
            auth: None,
            payments: None,
            callbacks: None,
            ledger: None,
            access_facts: None,
            access_gate: AccessGate::default(),
        }
    }

    /// Builder pattern for constructing AppContext
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::new()
    }

    /// Get the auth provider, returning an error if not configured
    pub fn auth(&self) -> Result<&Arc<dyn AuthProvider>> {
        self.auth
            .as_ref()
            .ok_or_else(|| CarepayError::service_unavailable("Authentication not configured"))
    }

    /// Get the payment service, returning an error if not configured
    pub fn payments(&self) -> Result<&PaymentService> {
        self.payments
            .as_ref()
            .ok_or_else(|| CarepayError::service_unavailable("Payments not configured"))
    }

    pub fn callbacks(&self) -> Result<&CallbackVerifier> {
        self.callbacks
            .as_ref()
            .ok_or_else(|| CarepayError::service_unavailable("Callback handling not configured"))
    }

    pub fn ledger(&self) -> Result<&SubscriptionLedger> {
        self.ledger
            .as_ref()
            .ok_or_else(|| CarepayError::service_unavailable("Subscription ledger not configured"))
    }

    pub fn access_facts(&self) -> Result<&AccessFactsResolver> {
        self.access_facts
            .as_ref()
            .ok_or_else(|| CarepayError::service_unavailable("Access facts not configured"))
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Build one adapter per configured gateway, sharing a `reqwest` transport
/// per adapter so each keeps its own timeout.
pub fn gateways_from_config(config: &GatewaysConfig) -> Result<GatewayRegistry> {
    let mut registry = GatewayRegistry::new();

    if let Some(checksum) = &config.checksum {
        let transport = ReqwestTransport::new(checksum.timeout)
            .map_err(|e| CarepayError::internal(e.to_string()))?;
        registry.register(Arc::new(ChecksumGateway::new(checksum.clone(), Arc::new(transport))));
    }
    if let Some(hosted) = &config.hosted {
        let transport = ReqwestTransport::new(hosted.timeout)
            .map_err(|e| CarepayError::internal(e.to_string()))?;
        registry.register(Arc::new(HostedCheckoutGateway::new(hosted.clone(), Arc::new(transport))));
    }

    Ok(registry)
}

/// Builder for AppContext with fluent API
#[must_use = "builder does nothing until you call build()"]
pub struct AppContextBuilder {
    auth: Option<Arc<dyn AuthProvider>>,
    gateways: GatewayRegistry,
    plans: Plans,
    store: Option<Arc<dyn PaymentStore>>,
    profiles: Option<Arc<dyn ProfileStore>>,
    audit: Arc<dyn PaymentAuditLogger>,
    paths: AccessPaths,
}

impl AppContextBuilder {
    pub fn new() -> Self {
        Self {
            auth: None,
            gateways: GatewayRegistry::new(),
            plans: Plans::new(),
            store: None,
            profiles: None,
            audit: Arc::new(TracingAuditLogger),
            paths: AccessPaths::default(),
        }
    }

    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    /// Verify bearer tokens as HS256 JWTs signed with the configured secret.
    pub fn with_auth_config(mut self, config: &AuthConfig) -> Self {
        self.auth = Some(Arc::new(JwtAuthProvider::new(config)));
        self
    }

    /// Catalog that prices every checkout.
    pub fn with_plans(mut self, plans: Plans) -> Self {
        self.plans = plans;
        self
    }

    pub fn with_gateways(mut self, gateways: GatewayRegistry) -> Self {
        self.gateways = gateways;
        self
    }

    /// Register adapters for every gateway in `config`.
    pub fn with_gateway_config(mut self, config: &GatewaysConfig) -> Result<Self> {
        self.gateways = gateways_from_config(config)?;
        Ok(self)
    }

    /// Register one adapter over a caller-supplied transport.
    pub fn with_transport_for(
        mut self,
        config: &GatewaysConfig,
        transport: Arc<dyn GatewayTransport>,
    ) -> Self {
        if let Some(checksum) = &config.checksum {
            self.gateways
                .register(Arc::new(ChecksumGateway::new(checksum.clone(), transport.clone())));
        }
        if let Some(hosted) = &config.hosted {
            self.gateways
                .register(Arc::new(HostedCheckoutGateway::new(hosted.clone(), transport)));
        }
        self
    }

    pub fn with_payment_store(mut self, store: Arc<dyn PaymentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_profile_store(mut self, profiles: Arc<dyn ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn with_audit_logger(mut self, audit: Arc<dyn PaymentAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_access_paths(mut self, paths: AccessPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Wire the services together.
    ///
    /// Without a payment store the in-memory one is used, which suits
    /// development only: nothing survives a restart.
    pub fn build(self) -> AppContext {
        let store = self.store.unwrap_or_else(|| {
            tracing::warn!(
                target: "carepay::app",
                "No payment store configured; using the in-memory store"
            );
            Arc::new(InMemoryPaymentStore::new())
        });
        let profiles = self
            .profiles
            .unwrap_or_else(|| Arc::new(InMemoryProfileStore::new()));

        if self.gateways.is_empty() {
            tracing::warn!(target: "carepay::app", "No payment gateways registered");
        }
        if self.plans.is_empty() {
            tracing::warn!(target: "carepay::app", "Plan catalog is empty; every checkout will be refused");
        }
        if self.auth.is_none() {
            tracing::warn!(target: "carepay::app", "No auth provider configured; /api/me routes answer 503");
        }

        let ledger = SubscriptionLedger::new(store.clone(), self.audit.clone());

        AppContext {
            auth: self.auth,
            payments: Some(
                PaymentService::new(self.gateways.clone(), store.clone(), self.audit.clone())
                    .with_plans(self.plans),
            ),
            callbacks: Some(CallbackVerifier::new(self.gateways, store, self.audit)),
            access_facts: Some(AccessFactsResolver::new(profiles, ledger.clone())),
            ledger: Some(ledger),
            access_gate: AccessGate::new(self.paths),
        }
    }
}

impl Default for AppContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::{ChecksumGatewayConfig, Gateway, HostedCheckoutConfig};

    #[test]
    fn empty_context_reports_missing_services() {
        let ctx = AppContext::new();
        assert!(matches!(ctx.payments(), Err(CarepayError::ServiceUnavailable(_))));
        assert!(ctx.callbacks().is_err());
        assert!(ctx.ledger().is_err());
        assert!(ctx.access_facts().is_err());
        assert!(matches!(ctx.auth(), Err(CarepayError::ServiceUnavailable(_))));
    }

    #[test]
    fn registry_follows_config() {
        let empty = gateways_from_config(&GatewaysConfig::default()).unwrap();
        assert!(empty.is_empty());

        let config = GatewaysConfig {
            checksum: Some(ChecksumGatewayConfig::new("MERCHANTUAT", "salt", "1")),
            hosted: Some(HostedCheckoutConfig::new("key", "secret", "whsec")),
        };
        let registry = gateways_from_config(&config).unwrap();
        assert!(registry.get(Gateway::ChecksumQr).is_ok());
        assert!(registry.get(Gateway::HostedCheckout).is_ok());
    }

    #[test]
    fn builder_wires_every_service() {
        let plans = Plans::builder()
            .plan("premium")
            .monthly_price(84_900)
            .annual_price(849_000)
            .done()
            .build();
        let ctx = AppContext::builder()
            .with_auth_config(&AuthConfig::new("an-hs256-secret-of-at-least-32-bytes"))
            .with_plans(plans)
            .with_access_paths(AccessPaths {
                paywall: "/pricing".to_string(),
                ..AccessPaths::default()
            })
            .build();
        assert!(ctx.auth().is_ok());
        assert!(ctx.payments().unwrap().plans().contains("premium"));
        assert!(ctx.callbacks().is_ok());
        assert!(ctx.ledger().is_ok());
        assert!(ctx.access_facts().is_ok());
        assert_eq!(ctx.access_gate.paths().paywall, "/pricing");
    }
}
