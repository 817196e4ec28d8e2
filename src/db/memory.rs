use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{
    AuditLedger, OrganizationStore, StoreError, StoreResult, UsageSource, UserStore,
};
use crate::billing::events::{BillingEvent, NewBillingEvent, NewSystemLog, SystemLog};
use crate::billing::models::BillingState;
use crate::organizations::models::{NewOrganization, NewUser, Organization, User};

const SLUG_CONSTRAINT: &str = "organizations_slug_key";
const AUTH_ID_CONSTRAINT: &str = "users_auth_id_key";

/// DashMap-backed store for local runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    organizations: DashMap<Uuid, Organization>,
    slugs: DashMap<String, Uuid>,
    auth_ids: DashMap<String, Uuid>,
    users: DashMap<Uuid, User>,
    billing_events: DashMap<Uuid, BillingEvent>,
    system_logs: DashMap<Uuid, SystemLog>,
    usage: DashMap<Uuid, Vec<(DateTime<Utc>, i64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records processed units, the counterpart of the usage counters table.
    pub fn record_usage(&self, organization_id: Uuid, units: i64, recorded_at: DateTime<Utc>) {
        self.usage
            .entry(organization_id)
            .or_default()
            .push((recorded_at, units));
    }

    pub fn organization_count(&self) -> usize {
        self.organizations.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn billing_event_count(&self) -> usize {
        self.billing_events.len()
    }

    pub fn system_logs(&self) -> Vec<SystemLog> {
        let mut logs: Vec<SystemLog> = self
            .system_logs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        logs.sort_by_key(|log| log.created_at);
        logs
    }
}

#[async_trait]
impl OrganizationStore for MemoryStore {
    async fn insert_organization(&self, draft: &NewOrganization) -> StoreResult<Organization> {
        let id = Uuid::new_v4();
        match self.slugs.entry(draft.slug.clone()) {
            Entry::Occupied(_) => Err(StoreError::UniqueViolation {
                constraint: SLUG_CONSTRAINT.to_string(),
            }),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let organization = Organization {
                    id,
                    name: draft.name.clone(),
                    slug: draft.slug.clone(),
                    email: draft.email.clone(),
                    billing: draft.billing.clone(),
                    settings: draft.settings.clone(),
                    created_at: now,
                    updated_at: now,
                };
                self.organizations.insert(id, organization.clone());
                slot.insert(id);
                Ok(organization)
            }
        }
    }

    async fn delete_organization(&self, id: Uuid) -> StoreResult<()> {
        let (_, organization) = self
            .organizations
            .remove(&id)
            .ok_or(StoreError::NotFound)?;
        self.slugs.remove(&organization.slug);
        self.users.retain(|_, user| {
            let keep = user.organization_id != id;
            if !keep {
                self.auth_ids.remove(&user.auth_id);
            }
            keep
        });
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> StoreResult<Option<Organization>> {
        Ok(self.organizations.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> StoreResult<Option<Organization>> {
        Ok(self
            .organizations
            .iter()
            .find(|entry| entry.billing.stripe_customer_id.as_deref() == Some(customer_id))
            .map(|entry| entry.value().clone()))
    }

    async fn compare_and_set_billing(
        &self,
        id: Uuid,
        expected: &BillingState,
        next: &BillingState,
    ) -> StoreResult<bool> {
        let Some(mut entry) = self.organizations.get_mut(&id) else {
            return Err(StoreError::NotFound);
        };
        if entry.billing != *expected {
            return Ok(false);
        }
        entry.billing = next.clone();
        entry.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert_user(&self, draft: &NewUser) -> StoreResult<User> {
        if !self.organizations.contains_key(&draft.organization_id) {
            return Err(StoreError::Unavailable(format!(
                "organization {} does not exist",
                draft.organization_id
            )));
        }
        let slot = match self.auth_ids.entry(draft.auth_id.clone()) {
            Entry::Occupied(_) => {
                return Err(StoreError::UniqueViolation {
                    constraint: AUTH_ID_CONSTRAINT.to_string(),
                })
            }
            Entry::Vacant(slot) => slot,
        };
        let user = User {
            id: Uuid::new_v4(),
            auth_id: draft.auth_id.clone(),
            organization_id: draft.organization_id,
            email: draft.email.clone(),
            first_name: draft.first_name.clone(),
            last_name: draft.last_name.clone(),
            role: draft.role,
            is_active: true,
            created_at: Utc::now(),
        };
        self.users.insert(user.id, user.clone());
        slot.insert(user.id);
        Ok(user)
    }

    async fn delete_user(&self, id: Uuid) -> StoreResult<()> {
        let (_, user) = self.users.remove(&id).ok_or(StoreError::NotFound)?;
        self.auth_ids.remove(&user.auth_id);
        Ok(())
    }

    async fn list_users(&self, organization_id: Uuid) -> StoreResult<Vec<User>> {
        let mut users: Vec<User> = self
            .users
            .iter()
            .filter(|entry| entry.organization_id == organization_id)
            .map(|entry| entry.value().clone())
            .collect();
        users.sort_by_key(|user| user.created_at);
        Ok(users)
    }
}

#[async_trait]
impl AuditLedger for MemoryStore {
    async fn append_billing_event(&self, event: &NewBillingEvent) -> StoreResult<BillingEvent> {
        let record = BillingEvent {
            id: Uuid::new_v4(),
            event_type: event.event_type.clone(),
            organization_id: event.organization_id,
            stripe_customer_id: event.stripe_customer_id.clone(),
            stripe_subscription_id: event.stripe_subscription_id.clone(),
            details: event.details.clone(),
            created_at: Utc::now(),
        };
        self.billing_events.insert(record.id, record.clone());
        Ok(record)
    }

    async fn append_system_log(&self, entry: &NewSystemLog) -> StoreResult<SystemLog> {
        let record = SystemLog {
            id: Uuid::new_v4(),
            event_type: entry.event_type.clone(),
            organization_id: entry.organization_id,
            details: entry.details.clone(),
            created_at: Utc::now(),
        };
        self.system_logs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn list_billing_events(&self, organization_id: Uuid) -> StoreResult<Vec<BillingEvent>> {
        let mut events: Vec<BillingEvent> = self
            .billing_events
            .iter()
            .filter(|entry| entry.organization_id == Some(organization_id))
            .map(|entry| entry.value().clone())
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events)
    }
}

#[async_trait]
impl UsageSource for MemoryStore {
    async fn monthly_usage(
        &self,
        organization_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<i64> {
        Ok(self
            .usage
            .get(&organization_id)
            .map(|counters| {
                counters
                    .iter()
                    .filter(|(at, _)| *at >= period_start && *at < period_end)
                    .map(|(_, units)| units)
                    .sum()
            })
            .unwrap_or(0))
    }
}
