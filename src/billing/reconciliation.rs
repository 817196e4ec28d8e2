use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use super::adapters::PaymentGateway;
use crate::db::OrganizationStore;
use crate::error::{AppError, AppResult};
use crate::webhooks::{Disposition, EventDispatcher};

pub const RECONCILIATION_REASON: &str = "reconciliation";

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub organization_id: Uuid,
    pub subscription_id: String,
    pub provider_status: String,
    pub disposition: Disposition,
}

/// Pulls provider state for organizations whose events were missed.
pub struct Reconciler {
    gateway: Arc<dyn PaymentGateway>,
    organizations: Arc<dyn OrganizationStore>,
    dispatcher: Arc<EventDispatcher>,
}

impl Reconciler {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        organizations: Arc<dyn OrganizationStore>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            gateway,
            organizations,
            dispatcher,
        }
    }

    /// Re-applies the provider's current view of the subscription through the
    /// same path as `customer.subscription.updated`.
    pub async fn reconcile(&self, organization_id: Uuid) -> AppResult<ReconciliationReport> {
        let organization = self
            .organizations
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("organization {organization_id}")))?;
        let subscription_id = organization
            .billing
            .stripe_subscription_id
            .ok_or(AppError::NotSubscribed(organization_id))?;

        let subscription = self
            .gateway
            .retrieve_subscription(&subscription_id)
            .await
            .map_err(|err| {
                error!(?err, %organization_id, %subscription_id, "failed to fetch subscription");
                AppError::from(err)
            })?;

        let disposition = self
            .dispatcher
            .apply_subscription_update(organization_id, &subscription, RECONCILIATION_REASON)
            .await?;
        info!(
            %organization_id,
            %subscription_id,
            status = %subscription.status,
            ?disposition,
            "subscription reconciled with provider"
        );
        Ok(ReconciliationReport {
            organization_id,
            subscription_id,
            provider_status: subscription.status,
            disposition,
        })
    }
}
