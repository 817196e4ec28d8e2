//! Persistence collaborators: the relational store (Postgres) and an
//! in-memory backend with the same uniqueness and compare-and-set guarantees.

pub mod billing_events;
pub mod memory;
pub mod organizations;
pub mod usage;
pub mod users;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::billing::events::{BillingEvent, NewBillingEvent, NewSystemLog, SystemLog};
use crate::billing::models::BillingState;
use crate::organizations::models::{NewOrganization, NewUser, Organization, User};

pub use memory::MemoryStore;

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint `{constraint}` violated")]
    UniqueViolation { constraint: String },
    #[error("record not found")]
    NotFound,
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return StoreError::UniqueViolation {
                    constraint: db.constraint().unwrap_or("unknown").to_string(),
                };
            }
        }
        if let sqlx::Error::RowNotFound = err {
            return StoreError::NotFound;
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn insert_organization(&self, draft: &NewOrganization) -> StoreResult<Organization>;
    async fn delete_organization(&self, id: Uuid) -> StoreResult<()>;
    async fn get_organization(&self, id: Uuid) -> StoreResult<Option<Organization>>;
    async fn find_by_customer_id(&self, customer_id: &str) -> StoreResult<Option<Organization>>;
    /// Replaces the billing fields only if they still equal `expected`.
    /// Returns `false` when another writer got there first.
    async fn compare_and_set_billing(
        &self,
        id: Uuid,
        expected: &BillingState,
        next: &BillingState,
    ) -> StoreResult<bool>;
}
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert_user(&self, draft: &NewUser) -> StoreResult<User>;
    async fn delete_user(&self, id: Uuid) -> StoreResult<()>;
    async fn list_users(&self, organization_id: Uuid) -> StoreResult<Vec<User>>;
}
#[async_trait]
pub trait AuditLedger: Send + Sync {
    async fn append_billing_event(&self, event: &NewBillingEvent) -> StoreResult<BillingEvent>;
    async fn append_system_log(&self, entry: &NewSystemLog) -> StoreResult<SystemLog>;
    /// Newest first.
    async fn list_billing_events(&self, organization_id: Uuid) -> StoreResult<Vec<BillingEvent>>;
}
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn monthly_usage(
        &self,
        organization_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<i64>;
}

/// Postgres-backed implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
