use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{AuditLedger, PgStore, StoreResult};
use crate::billing::events::{
    BillingEvent, BillingEventType, NewBillingEvent, NewSystemLog, SystemLog,
};
#[derive(Debug, sqlx::FromRow)]
struct BillingEventRow {
    id: Uuid,
    event_type: String,
    organization_id: Option<Uuid>,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    details: Value,
    created_at: DateTime<Utc>,
}

impl From<BillingEventRow> for BillingEvent {
    fn from(row: BillingEventRow) -> Self {
        BillingEvent {
            id: row.id,
            event_type: BillingEventType::parse(&row.event_type),
            organization_id: row.organization_id,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            details: row.details,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SystemLogRow {
    id: Uuid,
    event_type: String,
    organization_id: Option<Uuid>,
    details: Value,
    created_at: DateTime<Utc>,
}

#[async_trait]
impl AuditLedger for PgStore {
    async fn append_billing_event(&self, event: &NewBillingEvent) -> StoreResult<BillingEvent> {
        let row = sqlx::query_as::<_, BillingEventRow>(
            r#"
            INSERT INTO billing_events (
                id,
                event_type,
                organization_id,
                stripe_customer_id,
                stripe_subscription_id,
                details
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING
                id,
                event_type,
                organization_id,
                stripe_customer_id,
                stripe_subscription_id,
                details,
                created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.event_type.as_str())
        .bind(event.organization_id)
        .bind(event.stripe_customer_id.as_deref())
        .bind(event.stripe_subscription_id.as_deref())
        .bind(&event.details)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn append_system_log(&self, entry: &NewSystemLog) -> StoreResult<SystemLog> {
        let row = sqlx::query_as::<_, SystemLogRow>(
            r#"
            INSERT INTO system_logs (id, event_type, organization_id, details)
            VALUES ($1, $2, $3, $4)
            RETURNING id, event_type, organization_id, details, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.event_type)
        .bind(entry.organization_id)
        .bind(&entry.details)
        .fetch_one(&self.pool)
        .await?;
        Ok(SystemLog {
            id: row.id,
            event_type: row.event_type,
            organization_id: row.organization_id,
            details: row.details,
            created_at: row.created_at,
        })
    }

    async fn list_billing_events(&self, organization_id: Uuid) -> StoreResult<Vec<BillingEvent>> {
        let rows = sqlx::query_as::<_, BillingEventRow>(
            r#"
            SELECT
                id,
                event_type,
                organization_id,
                stripe_customer_id,
                stripe_subscription_id,
                details,
                created_at
            FROM billing_events
            WHERE organization_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BillingEvent::from).collect())
    }
}
