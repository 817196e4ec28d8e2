use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};

use crate::billing::{
    api as billing_api, BillingCatalog, CheckoutService, CheckoutSettings, PaymentGateway,
    Reconciler, SubscriptionStateMachine, UsageMeter,
};
use crate::db::{AuditLedger, MemoryStore, OrganizationStore, PgStore, UsageSource, UserStore};
use crate::organizations::{self, OrganizationDefaults, ProvisioningService};
use crate::telemetry::BillingTelemetry;
use crate::webhooks::{self, EventDispatcher, WebhookVerifier};

/// The persistence collaborators every component is built from.
#[derive(Clone)]
pub struct Stores {
    pub organizations: Arc<dyn OrganizationStore>,
    pub users: Arc<dyn UserStore>,
    pub ledger: Arc<dyn AuditLedger>,
    pub usage: Arc<dyn UsageSource>,
}

impl Stores {
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            organizations: store.clone(),
            users: store.clone(),
            ledger: store.clone(),
            usage: store,
        }
    }

    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            organizations: store.clone(),
            users: store.clone(),
            ledger: store.clone(),
            usage: store,
        }
    }
}

pub struct ServiceConfig {
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub checkout: CheckoutSettings,
    pub catalog: Arc<BillingCatalog>,
    pub defaults: Arc<OrganizationDefaults>,
}

/// Components shared by every request.
#[derive(Clone)]
pub struct Services {
    pub provisioning: Arc<ProvisioningService>,
    pub dispatcher: Arc<EventDispatcher>,
    pub checkout: Arc<CheckoutService>,
    pub usage: Arc<UsageMeter>,
    pub reconciler: Arc<Reconciler>,
    pub ledger: Arc<dyn AuditLedger>,
    pub telemetry: Arc<BillingTelemetry>,
}

impl Services {
    pub fn build(stores: Stores, gateway: Arc<dyn PaymentGateway>, config: ServiceConfig) -> Self {
        let telemetry = Arc::new(BillingTelemetry::default());
        let state_machine = Arc::new(SubscriptionStateMachine::new(
            stores.organizations.clone(),
            telemetry.clone(),
            config.defaults.trial_period(),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            WebhookVerifier::new(config.webhook_secret, config.webhook_tolerance_secs),
            state_machine.clone(),
            stores.organizations.clone(),
            stores.ledger.clone(),
            config.catalog.clone(),
            telemetry.clone(),
        ));
        let provisioning = Arc::new(ProvisioningService::new(
            stores.organizations.clone(),
            stores.users.clone(),
            stores.ledger.clone(),
            config.defaults.clone(),
            telemetry.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            gateway.clone(),
            stores.organizations.clone(),
            state_machine,
            stores.ledger.clone(),
            config.catalog.clone(),
            config.checkout,
        ));
        let usage = Arc::new(UsageMeter::new(
            stores.organizations.clone(),
            stores.usage.clone(),
            stores.ledger.clone(),
            config.catalog,
        ));
        let reconciler = Arc::new(Reconciler::new(
            gateway,
            stores.organizations,
            dispatcher.clone(),
        ));
        Self {
            provisioning,
            dispatcher,
            checkout,
            usage,
            reconciler,
            ledger: stores.ledger,
            telemetry,
        }
    }
}

async fn root() -> &'static str {
    "Tenant Billing API"
}

pub fn api_routes() -> Router {
    Router::new()
        .merge(organizations::routes())
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(billing_api::routes())
}

/// Router with every component attached; metrics are layered on by the binary.
pub fn app(services: &Services) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(services.provisioning.clone()))
        .layer(Extension(services.dispatcher.clone()))
        .layer(Extension(services.checkout.clone()))
        .layer(Extension(services.usage.clone()))
        .layer(Extension(services.reconciler.clone()))
        .layer(Extension(services.ledger.clone()))
        .layer(Extension(services.telemetry.clone()))
}
