use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::defaults::OrganizationDefaults;
use super::models::{NewOrganization, NewUser, Organization, User, UserRole};
use crate::billing::events::NewSystemLog;
use crate::billing::models::BillingState;
use crate::db::{AuditLedger, OrganizationStore, StoreError, UserStore};
use crate::error::{AppError, AppResult};
use crate::saga::{Saga, SagaStep, MIN_COMPENSATION_ATTEMPTS};
use crate::telemetry::BillingTelemetry;

pub const SIGNUP_LOG_EVENT: &str = "user_signup";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    #[serde(default, alias = "userId")]
    pub owner_principal_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub business_name: String,
    #[serde(default)]
    pub slug: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignupResponse {
    pub organization_id: Uuid,
    pub name: String,
    pub slug: String,
}

/// Lower-cases and replaces every character outside `[a-z0-9]` with `-`.
pub fn derive_slug(business_name: &str) -> String {
    business_name
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' => c,
            _ => '-',
        })
        .collect()
}

fn validate(request: &SignupRequest) -> AppResult<()> {
    let required = [
        ("ownerPrincipalId", &request.owner_principal_id),
        ("email", &request.email),
        ("firstName", &request.first_name),
        ("lastName", &request.last_name),
        ("businessName", &request.business_name),
    ];
    let missing: Vec<&str> = required
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| *field)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        )))
    }
}

struct ProvisioningContext {
    request: SignupRequest,
    slug: String,
    organization: Option<Organization>,
    owner: Option<User>,
}

struct CreateOrganization {
    store: Arc<dyn OrganizationStore>,
    settings: Value,
    trial_period: Duration,
}

#[async_trait]
impl SagaStep<ProvisioningContext> for CreateOrganization {
    fn name(&self) -> &'static str {
        "create_organization"
    }

    async fn execute(&self, context: &mut ProvisioningContext) -> AppResult<()> {
        let draft = NewOrganization {
            name: context.request.business_name.trim().to_string(),
            slug: context.slug.clone(),
            email: context.request.email.trim().to_string(),
            billing: BillingState::trial(Utc::now() + self.trial_period),
            settings: self.settings.clone(),
        };
        let organization = self.store.insert_organization(&draft).await?;
        context.organization = Some(organization);
        Ok(())
    }

    async fn compensate(&self, context: &ProvisioningContext) -> AppResult<()> {
        let Some(organization) = &context.organization else {
            return Ok(());
        };
        match self.store.delete_organization(organization.id).await {
            Ok(()) | Err(StoreError::NotFound) => {
                info!(organization_id = %organization.id, "rolled back organization");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

struct CreateOwner {
    store: Arc<dyn UserStore>,
}

#[async_trait]
impl SagaStep<ProvisioningContext> for CreateOwner {
    fn name(&self) -> &'static str {
        "create_owner"
    }

    async fn execute(&self, context: &mut ProvisioningContext) -> AppResult<()> {
        let organization_id = context
            .organization
            .as_ref()
            .map(|org| org.id)
            .ok_or_else(|| AppError::Persistence("owner step ran before organization".into()))?;
        let draft = NewUser {
            auth_id: context.request.owner_principal_id.trim().to_string(),
            organization_id,
            email: context.request.email.trim().to_string(),
            first_name: context.request.first_name.trim().to_string(),
            last_name: context.request.last_name.trim().to_string(),
            role: UserRole::Owner,
        };
        let owner = self
            .store
            .insert_user(&draft)
            .await
            .map_err(|err| match err {
                StoreError::UniqueViolation { .. } => AppError::Conflict(format!(
                    "principal {} already owns an organization",
                    draft.auth_id
                )),
                other => AppError::Persistence(format!("failed to create owner: {other}")),
            })?;
        context.owner = Some(owner);
        Ok(())
    }

    async fn compensate(&self, context: &ProvisioningContext) -> AppResult<()> {
        let Some(owner) = &context.owner else {
            return Ok(());
        };
        match self.store.delete_user(owner.id).await {
            Ok(()) | Err(StoreError::NotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Creates an organization together with its owner, or neither.
pub struct ProvisioningService {
    organizations: Arc<dyn OrganizationStore>,
    users: Arc<dyn UserStore>,
    ledger: Arc<dyn AuditLedger>,
    defaults: Arc<OrganizationDefaults>,
    telemetry: Arc<BillingTelemetry>,
    compensation_attempts: usize,
}

impl ProvisioningService {
    pub fn new(
        organizations: Arc<dyn OrganizationStore>,
        users: Arc<dyn UserStore>,
        ledger: Arc<dyn AuditLedger>,
        defaults: Arc<OrganizationDefaults>,
        telemetry: Arc<BillingTelemetry>,
    ) -> Self {
        Self {
            organizations,
            users,
            ledger,
            defaults,
            telemetry,
            compensation_attempts: MIN_COMPENSATION_ATTEMPTS,
        }
    }

    pub fn with_compensation_attempts(mut self, attempts: usize) -> Self {
        self.compensation_attempts = attempts;
        self
    }

    fn saga(&self) -> Saga<ProvisioningContext> {
        Saga::new(self.compensation_attempts)
            .step(CreateOrganization {
                store: self.organizations.clone(),
                settings: self.defaults.settings(),
                trial_period: self.defaults.trial_period(),
            })
            .step(CreateOwner {
                store: self.users.clone(),
            })
    }

    pub async fn provision(&self, request: SignupRequest) -> AppResult<SignupResponse> {
        validate(&request)?;
        let slug = match request.slug.as_deref().map(str::trim) {
            Some(supplied) if !supplied.is_empty() => supplied.to_string(),
            _ => derive_slug(request.business_name.trim()),
        };

        let mut context = ProvisioningContext {
            request,
            slug,
            organization: None,
            owner: None,
        };
        if let Err(failure) = self.saga().run(&mut context).await {
            if !failure.is_clean() {
                self.telemetry.record_orphaned_organization();
                error!(
                    organization_id = ?context.organization.as_ref().map(|org| org.id),
                    slug = %context.slug,
                    unresolved = ?failure.unresolved,
                    "provisioning rollback incomplete, organization orphaned"
                );
                return Err(AppError::Persistence(format!(
                    "{}; rollback incomplete",
                    failure.error
                )));
            }
            warn!(step = failure.step, slug = %context.slug, "provisioning rolled back");
            return Err(failure.error);
        }

        let (Some(organization), Some(owner)) = (context.organization, context.owner) else {
            return Err(AppError::Persistence("provisioning finished without records".into()));
        };

        let entry = NewSystemLog {
            event_type: SIGNUP_LOG_EVENT.to_string(),
            organization_id: Some(organization.id),
            details: json!({
                "user_id": context.request.owner_principal_id,
                "owner_id": owner.id,
                "email": owner.email,
                "business_name": organization.name,
                "signup_method": "email",
            }),
        };
        if let Err(err) = self.ledger.append_system_log(&entry).await {
            warn!(?err, organization_id = %organization.id, "failed to record signup log");
        }

        info!(
            organization_id = %organization.id,
            slug = %organization.slug,
            owner_id = %owner.id,
            "organization provisioned"
        );
        Ok(SignupResponse {
            organization_id: organization.id,
            name: organization.name,
            slug: organization.slug,
        })
    }
}
