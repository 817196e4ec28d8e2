use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{PgStore, StoreError, StoreResult, UserStore};
use crate::organizations::models::{NewUser, User, UserRole};

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    auth_id: String,
    organization_id: Uuid,
    email: String,
    first_name: String,
    last_name: String,
    role: String,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = UserRole::from_str(&row.role)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown user role `{}`", row.role)))?;
        Ok(User {
            id: row.id,
            auth_id: row.auth_id,
            organization_id: row.organization_id,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            role,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn insert_user(&self, draft: &NewUser) -> StoreResult<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (
                id,
                auth_id,
                organization_id,
                email,
                first_name,
                last_name,
                role,
                is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)
            RETURNING
                id,
                auth_id,
                organization_id,
                email,
                first_name,
                last_name,
                role,
                is_active,
                created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.auth_id)
        .bind(draft.organization_id)
        .bind(&draft.email)
        .bind(&draft.first_name)
        .bind(&draft.last_name)
        .bind(draft.role.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn delete_user(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_users(&self, organization_id: Uuid) -> StoreResult<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT
                id,
                auth_id,
                organization_id,
                email,
                first_name,
                last_name,
                role,
                is_active,
                created_at
            FROM users
            WHERE organization_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(User::try_from).collect()
    }
}
