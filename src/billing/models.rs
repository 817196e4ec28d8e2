use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Starter,
    Growth,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Growth => "growth",
            PlanTier::Pro => "pro",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "starter" => Some(Self::Starter),
            "growth" => Some(Self::Growth),
            "pro" => Some(Self::Pro),
            _ => None,
        }
    }
}
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "trialing" => Some(Self::Trialing),
            "active" => Some(Self::Active),
            "past_due" => Some(Self::PastDue),
            "canceled" => Some(Self::Canceled),
            "unpaid" => Some(Self::Unpaid),
            _ => None,
        }
    }

    /// No status move leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }

    /// Self-transitions are always legal so redelivered events stay no-ops.
    /// `unpaid` may recover to `active` or end in `canceled`, matching what the
    /// provider does once an outstanding invoice is settled or voided.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (Trialing, Active)
                | (Trialing, Canceled)
                | (Active, PastDue)
                | (Active, Canceled)
                | (Active, Unpaid)
                | (PastDue, Active)
                | (PastDue, Canceled)
                | (PastDue, Unpaid)
                | (Unpaid, Active)
                | (Unpaid, Canceled)
        )
    }
}

/// The fields owned by the subscription state machine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingState {
    pub subscription_status: SubscriptionStatus,
    pub subscription_plan: Option<PlanTier>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
}

impl BillingState {
    pub fn trial(trial_ends_at: DateTime<Utc>) -> Self {
        Self {
            subscription_status: SubscriptionStatus::Trialing,
            subscription_plan: None,
            trial_ends_at: Some(trial_ends_at),
            stripe_customer_id: None,
            stripe_subscription_id: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Annual,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Annual => "annual",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "monthly" | "month" => Some(Self::Monthly),
            "annual" | "year" | "yearly" => Some(Self::Annual),
            _ => None,
        }
    }
}

/// Included units and overage rate.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct PlanLimits {
    /// Included units per period; `UNLIMITED` for uncapped plans.
    pub included_units: i64,
    pub overage_rate_cents: i64,
}

impl PlanLimits {
    pub const UNLIMITED: i64 = -1;

    pub fn is_unlimited(&self) -> bool {
        self.included_units < 0
    }
}

/// Outcome of mapping a provider price id onto a plan tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlanResolution {
    pub tier: PlanTier,
    pub fallback: bool,
}
#[derive(Clone, Debug)]
pub struct BillingCatalog {
    price_tiers: HashMap<String, PlanTier>,
    subscription_prices: HashMap<(PlanTier, BillingInterval), String>,
    limits: HashMap<PlanTier, PlanLimits>,
    fallback_tier: PlanTier,
}

impl BillingCatalog {
    pub fn new(
        price_tiers: HashMap<String, PlanTier>,
        subscription_prices: HashMap<(PlanTier, BillingInterval), String>,
        limits: HashMap<PlanTier, PlanLimits>,
    ) -> Self {
        Self {
            price_tiers,
            subscription_prices,
            limits,
            fallback_tier: PlanTier::Starter,
        }
    }

    /// Unknown prices resolve to the fallback tier instead of failing the event.
    pub fn resolve_price(&self, price_id: &str) -> PlanResolution {
        match self.price_tiers.get(price_id) {
            Some(tier) => PlanResolution {
                tier: *tier,
                fallback: false,
            },
            None => PlanResolution {
                tier: self.fallback_tier,
                fallback: true,
            },
        }
    }

    pub fn known_tier(&self, price_id: &str) -> Option<PlanTier> {
        self.price_tiers.get(price_id).copied()
    }

    pub fn subscription_price(&self, tier: PlanTier, interval: BillingInterval) -> Option<&str> {
        self.subscription_prices
            .get(&(tier, interval))
            .map(String::as_str)
    }

    pub fn limits(&self, tier: PlanTier) -> PlanLimits {
        self.limits
            .get(&tier)
            .or_else(|| self.limits.get(&self.fallback_tier))
            .copied()
            .unwrap_or(PlanLimits {
                included_units: 0,
                overage_rate_cents: 0,
            })
    }
}

impl Default for BillingCatalog {
    fn default() -> Self {
        let subscription_prices = HashMap::from([
            (
                (PlanTier::Starter, BillingInterval::Monthly),
                "price_1SbMluDQ3Ykl2FjylJKbpC3D".to_string(),
            ),
            (
                (PlanTier::Starter, BillingInterval::Annual),
                "price_1SbMluDQ3Ykl2FjyC6jExKaO".to_string(),
            ),
            (
                (PlanTier::Growth, BillingInterval::Monthly),
                "price_1SbMrZDQ3Ykl2FjyxlJeDcwh".to_string(),
            ),
            (
                (PlanTier::Growth, BillingInterval::Annual),
                "price_1SbMrZDQ3Ykl2Fjy2w1EKIPo".to_string(),
            ),
            (
                (PlanTier::Pro, BillingInterval::Monthly),
                "price_1SbMwfDQ3Ykl2Fjydt1g7f4w".to_string(),
            ),
            (
                (PlanTier::Pro, BillingInterval::Annual),
                "price_1SbMwfDQ3Ykl2FjyllDFeutb".to_string(),
            ),
        ]);

        let mut price_tiers: HashMap<String, PlanTier> = subscription_prices
            .iter()
            .map(|((tier, _), price)| (price.clone(), *tier))
            .collect();
        // metered overage prices
        price_tiers.insert(
            "price_1SbONrDQ3Ykl2FjyB0ajwB3e".to_string(),
            PlanTier::Starter,
        );
        price_tiers.insert(
            "price_1SbOOCDQ3Ykl2FjyOyJshDFD".to_string(),
            PlanTier::Growth,
        );

        let limits = HashMap::from([
            (
                PlanTier::Starter,
                PlanLimits {
                    included_units: 75,
                    overage_rate_cents: 150,
                },
            ),
            (
                PlanTier::Growth,
                PlanLimits {
                    included_units: 250,
                    overage_rate_cents: 100,
                },
            ),
            (
                PlanTier::Pro,
                PlanLimits {
                    included_units: PlanLimits::UNLIMITED,
                    overage_rate_cents: 0,
                },
            ),
        ]);

        Self::new(price_tiers, subscription_prices, limits)
    }
}

/// Derived per-period usage, never stored.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub usage: i64,
    pub limit: i64,
    pub overage: i64,
    /// Minor currency units.
    pub overage_charge: i64,
    pub utilization_percent: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_lifecycle() {
        use SubscriptionStatus::*;
        assert!(Trialing.can_transition_to(Active));
        assert!(Trialing.can_transition_to(Canceled));
        assert!(!Trialing.can_transition_to(PastDue));
        assert!(Active.can_transition_to(Unpaid));
        assert!(PastDue.can_transition_to(Active));
        assert!(!Canceled.can_transition_to(Active));
        assert!(!Canceled.can_transition_to(Trialing));
        assert!(Canceled.can_transition_to(Canceled));
        assert!(Active.can_transition_to(Active));
        assert!(Unpaid.can_transition_to(Active));
        assert!(Unpaid.can_transition_to(Canceled));
        assert!(!Unpaid.can_transition_to(Trialing));
        assert!(Canceled.is_terminal());
        assert!(!Unpaid.is_terminal());
    }

    #[test]
    fn unknown_price_falls_back_to_starter() {
        let catalog = BillingCatalog::default();
        let resolved = catalog.resolve_price("price_unknown");
        assert_eq!(resolved.tier, PlanTier::Starter);
        assert!(resolved.fallback);

        let growth = catalog.resolve_price("price_1SbMrZDQ3Ykl2FjyxlJeDcwh");
        assert_eq!(growth.tier, PlanTier::Growth);
        assert!(!growth.fallback);
    }

    #[test]
    fn pro_plan_is_unlimited() {
        let catalog = BillingCatalog::default();
        assert!(catalog.limits(PlanTier::Pro).is_unlimited());
        assert_eq!(catalog.limits(PlanTier::Starter).included_units, 75);
        assert_eq!(
            catalog.subscription_price(PlanTier::Growth, BillingInterval::Annual),
            Some("price_1SbMrZDQ3Ykl2Fjy2w1EKIPo")
        );
    }
}
