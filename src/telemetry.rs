use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{describe_counter, increment_counter};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::billing::events::BillingEventType;

pub const UNLINKED_EVENTS: &str = "billing_unlinked_events_total";
pub const FALLBACK_PLAN_RESOLUTIONS: &str = "billing_fallback_plan_resolutions_total";
pub const REJECTED_TRANSITIONS: &str = "billing_rejected_transitions_total";
pub const ORPHANED_ORGANIZATIONS: &str = "billing_orphaned_organizations_total";
pub const SIGNATURE_FAILURES: &str = "billing_webhook_signature_failures_total";
pub const IGNORED_EVENTS: &str = "billing_ignored_events_total";

/// Registers descriptions with the installed recorder; call once after it is set up.
pub fn describe_metrics() {
    describe_counter!(
        UNLINKED_EVENTS,
        "Provider events acknowledged without a linked organization"
    );
    describe_counter!(
        FALLBACK_PLAN_RESOLUTIONS,
        "Subscriptions whose price id fell back to the default plan"
    );
    describe_counter!(
        REJECTED_TRANSITIONS,
        "Subscription status moves refused by the transition table"
    );
    describe_counter!(
        ORPHANED_ORGANIZATIONS,
        "Provisioning rollbacks that left an organization behind"
    );
    describe_counter!(
        SIGNATURE_FAILURES,
        "Webhook deliveries rejected by signature verification"
    );
    describe_counter!(IGNORED_EVENTS, "Provider event types this service does not handle");
}

/// Conditions that are logged but never fatal. Each one is exported through the
/// `metrics` recorder; the per-instance tally backs `snapshot` so callers can
/// read what a single service graph observed.
#[derive(Debug, Default)]
pub struct BillingTelemetry {
    unlinked_events: AtomicU64,
    fallback_plan_resolutions: AtomicU64,
    rejected_transitions: AtomicU64,
    orphaned_organizations: AtomicU64,
    signature_failures: AtomicU64,
    ignored_events: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct TelemetrySnapshot {
    pub unlinked_events: u64,
    pub fallback_plan_resolutions: u64,
    pub rejected_transitions: u64,
    pub orphaned_organizations: u64,
    pub signature_failures: u64,
    pub ignored_events: u64,
}

impl BillingTelemetry {
    pub fn record_unlinked_event(&self) {
        increment_counter!(UNLINKED_EVENTS);
        self.unlinked_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_plan(&self) {
        increment_counter!(FALLBACK_PLAN_RESOLUTIONS);
        self.fallback_plan_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_transition(&self) {
        increment_counter!(REJECTED_TRANSITIONS);
        self.rejected_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orphaned_organization(&self) {
        increment_counter!(ORPHANED_ORGANIZATIONS);
        self.orphaned_organizations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signature_failure(&self) {
        increment_counter!(SIGNATURE_FAILURES);
        self.signature_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored_event(&self) {
        increment_counter!(IGNORED_EVENTS);
        self.ignored_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            unlinked_events: self.unlinked_events.load(Ordering::Relaxed),
            fallback_plan_resolutions: self.fallback_plan_resolutions.load(Ordering::Relaxed),
            rejected_transitions: self.rejected_transitions.load(Ordering::Relaxed),
            orphaned_organizations: self.orphaned_organizations.load(Ordering::Relaxed),
            signature_failures: self.signature_failures.load(Ordering::Relaxed),
            ignored_events: self.ignored_events.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetailValidationError {
    #[error("billing event `{event_type}` details must be a JSON object")]
    NotAnObject { event_type: String },
    #[error("billing event `{event_type}` missing required detail `{field}`")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
}

/// Checks the detail payload carries the fields readers of the ledger rely on.
pub fn validate_event_details(
    event_type: &BillingEventType,
    details: &Value,
) -> Result<(), DetailValidationError> {
    if !details.is_object() {
        return Err(DetailValidationError::NotAnObject {
            event_type: event_type.as_str().to_string(),
        });
    }
    let required: &[&'static str] = match event_type {
        BillingEventType::CheckoutSessionCreated => &["session_id", "price_id"],
        BillingEventType::TrialConverted => &["session_id"],
        BillingEventType::SubscriptionActivated => &["plan_tier"],
        BillingEventType::SubscriptionUpdated => &["new_status", "new_plan", "change_reason"],
        BillingEventType::SubscriptionCanceled => &["cancellation_reason"],
        BillingEventType::PaymentSuccessful => &["invoice_id", "amount_paid"],
        BillingEventType::PaymentFailed => &["invoice_id", "amount_due"],
        BillingEventType::TrialEndingSoon => &["trial_end", "days_until_end"],
        BillingEventType::UsageTracked => &[
            "units_processed",
            "plan_limit",
            "overage_units",
            "overage_charge_cents",
            "utilization_percent",
        ],
        BillingEventType::Unknown(_) => &[],
    };
    for field in required {
        require_field(details, event_type, field)?;
    }
    Ok(())
}

fn require_field<'a>(
    payload: &'a Value,
    event_type: &BillingEventType,
    field: &'static str,
) -> Result<&'a Value, DetailValidationError> {
    payload
        .get(field)
        .ok_or_else(|| DetailValidationError::MissingField {
            event_type: event_type.as_str().to_string(),
            field,
        })
}
