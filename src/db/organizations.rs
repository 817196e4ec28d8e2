use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{OrganizationStore, PgStore, StoreError, StoreResult};
use crate::billing::models::{BillingState, PlanTier, SubscriptionStatus};
use crate::organizations::models::{NewOrganization, Organization};
#[derive(Debug, sqlx::FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    slug: String,
    email: String,
    subscription_status: String,
    subscription_plan: Option<String>,
    trial_ends_at: Option<DateTime<Utc>>,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    settings: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrganizationRow> for Organization {
    type Error = StoreError;

    fn try_from(row: OrganizationRow) -> Result<Self, Self::Error> {
        let subscription_status = SubscriptionStatus::from_str(&row.subscription_status)
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "unknown subscription_status `{}`",
                    row.subscription_status
                ))
            })?;
        let subscription_plan = match row.subscription_plan.as_deref() {
            Some(value) => Some(PlanTier::from_str(value).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown subscription_plan `{value}`"))
            })?),
            None => None,
        };
        Ok(Organization {
            id: row.id,
            name: row.name,
            slug: row.slug,
            email: row.email,
            billing: BillingState {
                subscription_status,
                subscription_plan,
                trial_ends_at: row.trial_ends_at,
                stripe_customer_id: row.stripe_customer_id,
                stripe_subscription_id: row.stripe_subscription_id,
            },
            settings: row.settings,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ORGANIZATION_COLUMNS: &str = r#"
    id,
    name,
    slug,
    email,
    subscription_status,
    subscription_plan,
    trial_ends_at,
    stripe_customer_id,
    stripe_subscription_id,
    settings,
    created_at,
    updated_at
"#;

#[async_trait]
impl OrganizationStore for PgStore {
    async fn insert_organization(&self, draft: &NewOrganization) -> StoreResult<Organization> {
        let query = format!(
            r#"
            INSERT INTO organizations (
                id,
                name,
                slug,
                email,
                subscription_status,
                subscription_plan,
                trial_ends_at,
                stripe_customer_id,
                stripe_subscription_id,
                settings
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {ORGANIZATION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, OrganizationRow>(&query)
            .bind(Uuid::new_v4())
            .bind(&draft.name)
            .bind(&draft.slug)
            .bind(&draft.email)
            .bind(draft.billing.subscription_status.as_str())
            .bind(draft.billing.subscription_plan.map(|plan| plan.as_str()))
            .bind(draft.billing.trial_ends_at)
            .bind(draft.billing.stripe_customer_id.as_deref())
            .bind(draft.billing.stripe_subscription_id.as_deref())
            .bind(&draft.settings)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn delete_organization(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM organizations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> StoreResult<Option<Organization>> {
        let query = format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1");
        let row = sqlx::query_as::<_, OrganizationRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Organization::try_from).transpose()
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> StoreResult<Option<Organization>> {
        let query = format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE stripe_customer_id = $1 LIMIT 1"
        );
        let row = sqlx::query_as::<_, OrganizationRow>(&query)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Organization::try_from).transpose()
    }

    async fn compare_and_set_billing(
        &self,
        id: Uuid,
        expected: &BillingState,
        next: &BillingState,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET
                subscription_status = $2,
                subscription_plan = $3,
                trial_ends_at = $4,
                stripe_customer_id = $5,
                stripe_subscription_id = $6,
                updated_at = NOW()
            WHERE id = $1
              AND subscription_status = $7
              AND subscription_plan IS NOT DISTINCT FROM $8
              AND trial_ends_at IS NOT DISTINCT FROM $9
              AND stripe_customer_id IS NOT DISTINCT FROM $10
              AND stripe_subscription_id IS NOT DISTINCT FROM $11
            "#,
        )
        .bind(id)
        .bind(next.subscription_status.as_str())
        .bind(next.subscription_plan.map(|plan| plan.as_str()))
        .bind(next.trial_ends_at)
        .bind(next.stripe_customer_id.as_deref())
        .bind(next.stripe_subscription_id.as_deref())
        .bind(expected.subscription_status.as_str())
        .bind(expected.subscription_plan.map(|plan| plan.as_str()))
        .bind(expected.trial_ends_at)
        .bind(expected.stripe_customer_id.as_deref())
        .bind(expected.stripe_subscription_id.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
