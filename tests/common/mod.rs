#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tenant_billing::billing::adapters::{
    CheckoutSession, CheckoutSessionDraft, CustomerDraft, ExternalCustomer, GatewayError,
    PaymentGateway, PortalSession,
};
use tenant_billing::billing::events::{BillingEvent, NewBillingEvent, NewSystemLog, SystemLog};
use tenant_billing::billing::{BillingCatalog, BillingState, CheckoutSettings};
use tenant_billing::db::{
    AuditLedger, MemoryStore, OrganizationStore, StoreError, StoreResult, UsageSource, UserStore,
};
use tenant_billing::organizations::{
    NewOrganization, NewUser, Organization, OrganizationDefaults, SignupRequest, User,
};
use tenant_billing::routes::{ServiceConfig, Services, Stores};
use tenant_billing::webhooks::events::SubscriptionObject;
use tenant_billing::webhooks::WebhookVerifier;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const STARTER_MONTHLY: &str = "price_1SbMluDQ3Ykl2FjylJKbpC3D";
pub const GROWTH_MONTHLY: &str = "price_1SbMrZDQ3Ykl2FjyxlJeDcwh";
pub const PRO_MONTHLY: &str = "price_1SbMwfDQ3Ykl2Fjydt1g7f4w";

/// Memory store whose writes can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_user_inserts: AtomicBool,
    /// Number of organization deletes that fail before one succeeds.
    pub failing_org_deletes: AtomicUsize,
    pub org_delete_attempts: AtomicUsize,
    pub fail_billing_events: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrganizationStore for FlakyStore {
    async fn insert_organization(&self, draft: &NewOrganization) -> StoreResult<Organization> {
        self.inner.insert_organization(draft).await
    }

    async fn delete_organization(&self, id: Uuid) -> StoreResult<()> {
        self.org_delete_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_org_deletes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_org_deletes.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner.delete_organization(id).await
    }

    async fn get_organization(&self, id: Uuid) -> StoreResult<Option<Organization>> {
        self.inner.get_organization(id).await
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> StoreResult<Option<Organization>> {
        self.inner.find_by_customer_id(customer_id).await
    }

    async fn compare_and_set_billing(
        &self,
        id: Uuid,
        expected: &BillingState,
        next: &BillingState,
    ) -> StoreResult<bool> {
        self.inner.compare_and_set_billing(id, expected, next).await
    }
}

#[async_trait]
impl UserStore for FlakyStore {
    async fn insert_user(&self, draft: &NewUser) -> StoreResult<User> {
        if self.fail_user_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("users table locked".into()));
        }
        self.inner.insert_user(draft).await
    }

    async fn delete_user(&self, id: Uuid) -> StoreResult<()> {
        self.inner.delete_user(id).await
    }

    async fn list_users(&self, organization_id: Uuid) -> StoreResult<Vec<User>> {
        self.inner.list_users(organization_id).await
    }
}

#[async_trait]
impl AuditLedger for FlakyStore {
    async fn append_billing_event(&self, event: &NewBillingEvent) -> StoreResult<BillingEvent> {
        if self.fail_billing_events.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("ledger offline".into()));
        }
        self.inner.append_billing_event(event).await
    }

    async fn append_system_log(&self, entry: &NewSystemLog) -> StoreResult<SystemLog> {
        self.inner.append_system_log(entry).await
    }

    async fn list_billing_events(&self, organization_id: Uuid) -> StoreResult<Vec<BillingEvent>> {
        self.inner.list_billing_events(organization_id).await
    }
}

#[async_trait]
impl UsageSource for FlakyStore {
    async fn monthly_usage(
        &self,
        organization_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<i64> {
        self.inner
            .monthly_usage(organization_id, period_start, period_end)
            .await
    }
}

pub fn flaky_stores(store: &Arc<FlakyStore>) -> Stores {
    Stores {
        organizations: store.clone(),
        users: store.clone(),
        ledger: store.clone(),
        usage: store.clone(),
    }
}

/// Gateway double recording every call.
#[derive(Default)]
pub struct FakeGateway {
    pub customers: Mutex<Vec<CustomerDraft>>,
    pub checkouts: Mutex<Vec<CheckoutSessionDraft>>,
    pub portals: Mutex<Vec<(String, String)>>,
    pub subscription: Mutex<Option<Value>>,
    pub fail: AtomicBool,
}

impl FakeGateway {
    fn check(&self) -> Result<(), GatewayError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Provider {
                status: 503,
                message: "provider unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_customer(&self, draft: &CustomerDraft) -> Result<ExternalCustomer, GatewayError> {
        self.check()?;
        let mut customers = self.customers.lock().unwrap();
        customers.push(draft.clone());
        Ok(ExternalCustomer {
            id: format!("cus_{}", customers.len()),
        })
    }

    async fn create_checkout_session(
        &self,
        draft: &CheckoutSessionDraft,
    ) -> Result<CheckoutSession, GatewayError> {
        self.check()?;
        let mut checkouts = self.checkouts.lock().unwrap();
        checkouts.push(draft.clone());
        let id = format!("cs_test_{}", checkouts.len());
        Ok(CheckoutSession {
            url: Some(format!("https://checkout.test/pay/{id}")),
            id,
            amount_total: Some(4900),
            currency: Some("usd".into()),
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, GatewayError> {
        self.check()?;
        self.portals
            .lock()
            .unwrap()
            .push((customer_id.to_string(), return_url.to_string()));
        Ok(PortalSession {
            url: format!("https://billing.test/session/{customer_id}"),
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionObject, GatewayError> {
        self.check()?;
        let body = self
            .subscription
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| GatewayError::Provider {
                status: 404,
                message: format!("No such subscription: '{subscription_id}'"),
            })?;
        serde_json::from_value(body).map_err(|err| GatewayError::Decode(err.to_string()))
    }
}

pub fn service_config() -> ServiceConfig {
    ServiceConfig {
        webhook_secret: WEBHOOK_SECRET.to_string(),
        webhook_tolerance_secs: 300,
        checkout: CheckoutSettings::new("https://app.test", Duration::minutes(60), 14).unwrap(),
        catalog: Arc::new(BillingCatalog::default()),
        defaults: Arc::new(OrganizationDefaults::default()),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub services: Services,
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(FakeGateway::default());
    let services = Services::build(
        Stores::memory(store.clone()),
        gateway.clone(),
        service_config(),
    );
    Harness {
        store,
        gateway,
        services,
    }
}

pub fn signup_request(business_name: &str) -> SignupRequest {
    SignupRequest {
        owner_principal_id: format!("auth|{}", Uuid::new_v4()),
        email: "owner@pawprints.test".into(),
        first_name: "Dana".into(),
        last_name: "Reyes".into(),
        business_name: business_name.into(),
        slug: None,
    }
}

pub fn sign(payload: &[u8]) -> String {
    WebhookVerifier::new(WEBHOOK_SECRET, 300).sign(payload, Utc::now().timestamp())
}

pub fn envelope(event_type: &str, object: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": { "object": object },
    }))
    .unwrap()
}

pub fn subscription_object(
    organization_id: Uuid,
    status: &str,
    price_id: &str,
    trial_end: Option<i64>,
) -> Value {
    json!({
        "id": "sub_123",
        "object": "subscription",
        "customer": "cus_123",
        "status": status,
        "metadata": { "organization_id": organization_id.to_string() },
        "items": { "data": [ { "price": {
            "id": price_id,
            "unit_amount": 4900,
            "currency": "usd",
            "recurring": { "interval": "month" }
        } } ] },
        "trial_end": trial_end,
    })
}
