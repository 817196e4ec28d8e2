use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use uuid::Uuid;

pub const ORGANIZATION_METADATA_KEY: &str = "organization_id";
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: ProviderEventData,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderEventData {
    pub object: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderEventKind {
    CheckoutCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentFailed,
    TrialWillEnd,
    Unknown(String),
}

impl ProviderEventKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "checkout.session.completed" => Self::CheckoutCompleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "customer.subscription.trial_will_end" => Self::TrialWillEnd,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Accepts either a bare id or an expanded object carrying `id`.
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(id)) => Some(id),
        Some(Value::Object(map)) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    })
}

fn organization_from(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get(ORGANIZATION_METADATA_KEY)
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
}

#[derive(Clone, Debug, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl CheckoutSessionObject {
    pub fn organization_id(&self) -> Option<Uuid> {
        organization_from(&self.metadata)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Recurring {
    #[serde(default)]
    pub interval: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Price {
    pub id: String,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub recurring: Option<Recurring>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionItem {
    pub price: Price,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CancellationDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: SubscriptionItems,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub cancellation_details: Option<CancellationDetails>,
}

impl SubscriptionObject {
    pub fn organization_id(&self) -> Option<Uuid> {
        organization_from(&self.metadata)
    }

    pub fn primary_price(&self) -> Option<&Price> {
        self.items.data.first().map(|item| &item.price)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct FinalizationError {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub attempt_count: i64,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
    #[serde(default)]
    pub last_finalization_error: Option<FinalizationError>,
}

impl InvoiceObject {
    pub fn organization_id(&self) -> Option<Uuid> {
        organization_from(&self.metadata).or_else(|| {
            self.subscription_details
                .as_ref()
                .and_then(|details| organization_from(&details.metadata))
        })
    }
}
