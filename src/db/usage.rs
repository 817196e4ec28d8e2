use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{PgStore, StoreResult, UsageSource};

#[async_trait]
impl UsageSource for PgStore {
    async fn monthly_usage(
        &self,
        organization_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let units: Option<i64> =
            sqlx::query_scalar("SELECT get_monthly_usage($1, $2, $3)")
                .bind(organization_id)
                .bind(period_start)
                .bind(period_end)
                .fetch_one(&self.pool)
                .await?;
        Ok(units.unwrap_or(0))
    }
}
