use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
/// Durable, append-only record of a billing-relevant occurrence.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BillingEvent {
    pub id: Uuid,
    pub event_type: BillingEventType,
    pub organization_id: Option<Uuid>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BillingEventType {
    CheckoutSessionCreated,
    TrialConverted,
    SubscriptionActivated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    PaymentSuccessful,
    PaymentFailed,
    TrialEndingSoon,
    UsageTracked,
    /// Rows written by newer deployments keep their original label.
    Unknown(String),
}

impl BillingEventType {
    pub fn as_str(&self) -> &str {
        match self {
            BillingEventType::CheckoutSessionCreated => "checkout_session_created",
            BillingEventType::TrialConverted => "trial_converted",
            BillingEventType::SubscriptionActivated => "subscription_activated",
            BillingEventType::SubscriptionUpdated => "subscription_updated",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::PaymentSuccessful => "payment_successful",
            BillingEventType::PaymentFailed => "payment_failed",
            BillingEventType::TrialEndingSoon => "trial_ending_soon",
            BillingEventType::UsageTracked => "usage_tracked",
            BillingEventType::Unknown(label) => label.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "checkout_session_created" => Self::CheckoutSessionCreated,
            "trial_converted" => Self::TrialConverted,
            "subscription_activated" => Self::SubscriptionActivated,
            "subscription_updated" => Self::SubscriptionUpdated,
            "subscription_canceled" => Self::SubscriptionCanceled,
            "payment_successful" => Self::PaymentSuccessful,
            "payment_failed" => Self::PaymentFailed,
            "trial_ending_soon" => Self::TrialEndingSoon,
            "usage_tracked" => Self::UsageTracked,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl Serialize for BillingEventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BillingEventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Insert payload for the billing ledger.
#[derive(Clone, Debug)]
pub struct NewBillingEvent {
    pub event_type: BillingEventType,
    pub organization_id: Option<Uuid>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub details: Value,
}

impl NewBillingEvent {
    pub fn new(event_type: BillingEventType, organization_id: Uuid, details: Value) -> Self {
        Self {
            event_type,
            organization_id: Some(organization_id),
            stripe_customer_id: None,
            stripe_subscription_id: None,
            details,
        }
    }

    pub fn customer(mut self, customer_id: Option<String>) -> Self {
        self.stripe_customer_id = customer_id;
        self
    }

    pub fn subscription(mut self, subscription_id: Option<String>) -> Self {
        self.stripe_subscription_id = subscription_id;
        self
    }
}
/// Non-billing operational record (signups and similar lifecycle facts).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SystemLog {
    pub id: Uuid,
    pub event_type: String,
    pub organization_id: Option<Uuid>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewSystemLog {
    pub event_type: String,
    pub organization_id: Option<Uuid>,
    pub details: Value,
}
