use std::sync::Arc;

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::events::{BillingEventType, NewBillingEvent};
use super::ledger;
use super::models::{BillingCatalog, PlanLimits, UsageSnapshot};
use crate::db::{AuditLedger, OrganizationStore, UsageSource};
use crate::error::{AppError, AppResult};

/// Calendar-month window containing `now`.
pub fn current_period(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let end = start.checked_add_months(Months::new(1)).unwrap_or(now);
    (start, end)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UsageCharge {
    pub overage: i64,
    pub overage_charge: i64,
    pub utilization_percent: f64,
}

/// Overage arithmetic; an unlimited plan never accrues overage or utilization.
pub fn compute_charge(units: i64, limits: PlanLimits) -> UsageCharge {
    if limits.is_unlimited() {
        return UsageCharge {
            overage: 0,
            overage_charge: 0,
            utilization_percent: 0.0,
        };
    }
    let overage = (units - limits.included_units).max(0);
    let utilization_percent = if limits.included_units > 0 {
        round_two(units as f64 / limits.included_units as f64 * 100.0)
    } else {
        0.0
    };
    UsageCharge {
        overage,
        overage_charge: overage * limits.overage_rate_cents,
        utilization_percent,
    }
}

fn round_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Computes overage for the current period and records it in the ledger.
pub struct UsageMeter {
    organizations: Arc<dyn OrganizationStore>,
    usage: Arc<dyn UsageSource>,
    ledger: Arc<dyn AuditLedger>,
    catalog: Arc<BillingCatalog>,
}

impl UsageMeter {
    pub fn new(
        organizations: Arc<dyn OrganizationStore>,
        usage: Arc<dyn UsageSource>,
        ledger: Arc<dyn AuditLedger>,
        catalog: Arc<BillingCatalog>,
    ) -> Self {
        Self {
            organizations,
            usage,
            ledger,
            catalog,
        }
    }

    pub async fn snapshot(&self, organization_id: Uuid) -> AppResult<UsageSnapshot> {
        self.snapshot_at(organization_id, Utc::now()).await
    }

    pub async fn snapshot_at(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<UsageSnapshot> {
        let organization = self
            .organizations
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("organization {organization_id}")))?;

        let (Some(plan), Some(subscription_id)) = (
            organization.billing.subscription_plan,
            organization.billing.stripe_subscription_id.clone(),
        ) else {
            return Err(AppError::NotSubscribed(organization_id));
        };

        let (period_start, period_end) = current_period(now);
        let units = self
            .usage
            .monthly_usage(organization_id, period_start, period_end)
            .await?;
        let limits = self.catalog.limits(plan);
        let charge = compute_charge(units, limits);

        let snapshot = UsageSnapshot {
            usage: units,
            limit: limits.included_units,
            overage: charge.overage,
            overage_charge: charge.overage_charge,
            utilization_percent: charge.utilization_percent,
            period_start,
            period_end,
        };

        let event = NewBillingEvent::new(
            BillingEventType::UsageTracked,
            organization_id,
            json!({
                "plan_tier": plan.as_str(),
                "units_processed": snapshot.usage,
                "plan_limit": snapshot.limit,
                "overage_units": snapshot.overage,
                "overage_rate_cents": limits.overage_rate_cents,
                "overage_charge_cents": snapshot.overage_charge,
                "utilization_percent": snapshot.utilization_percent,
                "period_start": period_start,
                "period_end": period_end,
            }),
        )
        .customer(organization.billing.stripe_customer_id.clone())
        .subscription(Some(subscription_id));
        ledger::record(self.ledger.as_ref(), event).await?;

        info!(
            %organization_id,
            plan = plan.as_str(),
            usage = snapshot.usage,
            overage = snapshot.overage,
            "usage snapshot computed"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STARTER: PlanLimits = PlanLimits {
        included_units: 75,
        overage_rate_cents: 150,
    };

    #[test]
    fn starter_overage_is_billed_per_unit() {
        let charge = compute_charge(80, STARTER);
        assert_eq!(charge.overage, 5);
        assert_eq!(charge.overage_charge, 750);
        assert_eq!(charge.utilization_percent, 106.67);
    }

    #[test]
    fn usage_within_allowance_has_no_overage() {
        let charge = compute_charge(30, STARTER);
        assert_eq!(charge.overage, 0);
        assert_eq!(charge.overage_charge, 0);
        assert_eq!(charge.utilization_percent, 40.0);
    }

    #[test]
    fn unlimited_plans_short_circuit() {
        let pro = PlanLimits {
            included_units: PlanLimits::UNLIMITED,
            overage_rate_cents: 0,
        };
        for units in [0, 1, 10_000] {
            let charge = compute_charge(units, pro);
            assert_eq!(charge.overage, 0);
            assert_eq!(charge.overage_charge, 0);
            assert_eq!(charge.utilization_percent, 0.0);
        }
    }

    #[test]
    fn period_spans_the_calendar_month() {
        let now = Utc.with_ymd_and_hms(2024, 12, 17, 9, 30, 0).unwrap();
        let (start, end) = current_period(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }
}
