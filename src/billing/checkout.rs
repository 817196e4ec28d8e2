use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use url::Url;
use uuid::Uuid;

use super::adapters::{CheckoutSession, CheckoutSessionDraft, CustomerDraft, PaymentGateway};
use super::events::{BillingEventType, NewBillingEvent};
use super::ledger;
use super::models::{BillingCatalog, BillingInterval, PlanTier};
use super::state_machine::SubscriptionStateMachine;
use crate::db::{AuditLedger, OrganizationStore};
use crate::error::{AppError, AppResult};
use crate::organizations::models::Organization;

const CHECKOUT_SESSION_PLACEHOLDER: &str = "{CHECKOUT_SESSION_ID}";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub organization_id: Uuid,
    pub price_id: String,
    #[serde(default)]
    pub plan_tier: Option<String>,
    #[serde(default)]
    pub billing_interval: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub checkout_url: Option<String>,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalRequest {
    pub organization_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortalResponse {
    pub portal_url: String,
}

/// Redirect targets and session lifetime for provider-hosted flows.
#[derive(Clone, Debug)]
pub struct CheckoutSettings {
    base_url: String,
    session_ttl: Duration,
    trial_period_days: i64,
}

impl CheckoutSettings {
    pub fn new(app_base_url: &str, session_ttl: Duration, trial_period_days: i64) -> AppResult<Self> {
        let parsed = Url::parse(app_base_url)
            .map_err(|err| AppError::Validation(format!("invalid application base url: {err}")))?;
        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            session_ttl,
            trial_period_days,
        })
    }

    pub fn success_url(&self) -> String {
        format!(
            "{}/billing/success?session_id={CHECKOUT_SESSION_PLACEHOLDER}",
            self.base_url
        )
    }

    pub fn cancel_url(&self) -> String {
        format!("{}/billing/canceled", self.base_url)
    }

    pub fn portal_return_url(&self) -> String {
        format!("{}/settings/billing", self.base_url)
    }
}
pub struct CheckoutService {
    gateway: Arc<dyn PaymentGateway>,
    organizations: Arc<dyn OrganizationStore>,
    state_machine: Arc<SubscriptionStateMachine>,
    ledger: Arc<dyn AuditLedger>,
    catalog: Arc<BillingCatalog>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        organizations: Arc<dyn OrganizationStore>,
        state_machine: Arc<SubscriptionStateMachine>,
        ledger: Arc<dyn AuditLedger>,
        catalog: Arc<BillingCatalog>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            gateway,
            organizations,
            state_machine,
            ledger,
            catalog,
            settings,
        }
    }

    async fn organization(&self, organization_id: Uuid) -> AppResult<Organization> {
        self.organizations
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("organization {organization_id}")))
    }

    /// Returns the stored customer id, creating one at the provider only when
    /// the organization has none yet.
    pub async fn ensure_customer(
        &self,
        organization: &Organization,
        metadata: Vec<(String, String)>,
    ) -> AppResult<String> {
        if let Some(existing) = &organization.billing.stripe_customer_id {
            return Ok(existing.clone());
        }
        let draft = CustomerDraft {
            organization_id: organization.id,
            email: organization.email.clone(),
            name: organization.name.clone(),
            metadata,
        };
        let customer = self.gateway.create_customer(&draft).await.map_err(|err| {
            error!(?err, organization_id = %organization.id, "customer creation failed");
            AppError::from(err)
        })?;
        let stored = self
            .state_machine
            .attach_customer(organization.id, &customer.id)
            .await?;
        info!(organization_id = %organization.id, customer_id = %stored, "customer linked");
        Ok(stored)
    }

    pub async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        organization_id: Uuid,
        success_url: &str,
        cancel_url: &str,
    ) -> AppResult<CheckoutSession> {
        let draft = CheckoutSessionDraft {
            customer_id: customer_id.to_string(),
            price_id: price_id.to_string(),
            organization_id,
            success_url: success_url.to_string(),
            cancel_url: cancel_url.to_string(),
            trial_period_days: self.settings.trial_period_days,
            expires_at: Utc::now() + self.settings.session_ttl,
        };
        let session = self
            .gateway
            .create_checkout_session(&draft)
            .await
            .map_err(|err| {
                error!(?err, %organization_id, "checkout session creation failed");
                AppError::from(err)
            })?;

        ledger::record_best_effort(
            self.ledger.as_ref(),
            NewBillingEvent::new(
                BillingEventType::CheckoutSessionCreated,
                organization_id,
                json!({
                    "session_id": session.id,
                    "price_id": price_id,
                    "amount": session.amount_total,
                    "currency": session.currency,
                }),
            )
            .customer(Some(customer_id.to_string())),
        )
        .await;
        Ok(session)
    }

    pub async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> AppResult<String> {
        let session = self
            .gateway
            .create_portal_session(customer_id, return_url)
            .await?;
        Ok(session.url)
    }

    /// Validates the request against the catalog, then links a customer and
    /// opens a checkout session.
    pub async fn start_checkout(&self, request: CheckoutRequest) -> AppResult<CheckoutResponse> {
        let price_id = request.price_id.trim();
        if price_id.is_empty() {
            return Err(AppError::Validation("priceId is required".into()));
        }
        let requested_tier = match request.plan_tier.as_deref() {
            Some(raw) => Some(
                PlanTier::from_str(raw)
                    .ok_or_else(|| AppError::Validation(format!("unknown planTier `{raw}`")))?,
            ),
            None => None,
        };
        let interval = match request.billing_interval.as_deref() {
            Some(raw) => Some(BillingInterval::from_str(raw).ok_or_else(|| {
                AppError::Validation(format!("unknown billingInterval `{raw}`"))
            })?),
            None => None,
        };
        if let (Some(requested), Some(known)) = (requested_tier, self.catalog.known_tier(price_id))
        {
            if requested != known {
                return Err(AppError::Validation(format!(
                    "priceId belongs to the {} plan, not {}",
                    known.as_str(),
                    requested.as_str()
                )));
            }
        }

        let organization = self.organization(request.organization_id).await?;
        let mut metadata = Vec::new();
        if let Some(tier) = requested_tier {
            metadata.push(("plan_tier".to_string(), tier.as_str().to_string()));
        }
        if let Some(interval) = interval {
            metadata.push((
                "billing_interval".to_string(),
                interval.as_str().to_string(),
            ));
        }
        let customer_id = self.ensure_customer(&organization, metadata).await?;

        let session = self
            .create_checkout_session(
                &customer_id,
                price_id,
                organization.id,
                &self.settings.success_url(),
                &self.settings.cancel_url(),
            )
            .await?;
        info!(organization_id = %organization.id, session_id = %session.id, "checkout session opened");
        Ok(CheckoutResponse {
            checkout_url: session.url,
            session_id: session.id,
        })
    }

    pub async fn open_portal(&self, organization_id: Uuid) -> AppResult<PortalResponse> {
        let organization = self.organization(organization_id).await?;
        let customer_id = organization.billing.stripe_customer_id.ok_or_else(|| {
            AppError::NotFound(format!(
                "organization {organization_id} has no billing customer"
            ))
        })?;
        let portal_url = self
            .create_portal_session(&customer_id, &self.settings.portal_return_url())
            .await?;
        Ok(PortalResponse { portal_url })
    }
}
