use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::webhooks::events::{SubscriptionObject, ORGANIZATION_METADATA_KEY};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider responded {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("unexpected provider response: {0}")]
    Decode(String),
}

#[derive(Clone, Debug)]
pub struct CustomerDraft {
    pub organization_id: Uuid,
    pub email: String,
    pub name: String,
    pub metadata: Vec<(String, String)>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ExternalCustomer {
    pub id: String,
}

#[derive(Clone, Debug)]
pub struct CheckoutSessionDraft {
    pub customer_id: String,
    pub price_id: String,
    pub organization_id: Uuid,
    pub success_url: String,
    pub cancel_url: String,
    pub trial_period_days: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PortalSession {
    pub url: String,
}

/// Payment provider integration.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(&self, draft: &CustomerDraft) -> Result<ExternalCustomer, GatewayError>;
    async fn create_checkout_session(
        &self,
        draft: &CheckoutSessionDraft,
    ) -> Result<CheckoutSession, GatewayError>;
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, GatewayError>;
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionObject, GatewayError>;
}

#[derive(Deserialize)]
struct ProviderErrorEnvelope {
    error: ProviderErrorBody,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Stripe REST client speaking form-encoded requests.
#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    api_base: String,
    secret_key: String,
}

impl StripeGateway {
    pub fn new(api_base: &str, secret_key: &str) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T, GatewayError> {
        let mut request = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.secret_key)
            .form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        debug!(path, "calling payment provider");
        decode(request.send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        let message = serde_json::from_str::<ProviderErrorEnvelope>(&body)
            .ok()
            .and_then(|envelope| envelope.error.message)
            .unwrap_or_else(|| body.clone());
        return Err(GatewayError::Provider {
            status: status.as_u16(),
            message,
        });
    }
    serde_json::from_str(&body).map_err(|err| GatewayError::Decode(err.to_string()))
}

fn pair(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(&self, draft: &CustomerDraft) -> Result<ExternalCustomer, GatewayError> {
        let mut form = vec![
            pair("email", draft.email.as_str()),
            pair("name", draft.name.as_str()),
            pair("description", format!("Customer for {}", draft.name)),
            pair(
                &format!("metadata[{ORGANIZATION_METADATA_KEY}]"),
                draft.organization_id.to_string(),
            ),
        ];
        for (key, value) in &draft.metadata {
            form.push(pair(&format!("metadata[{key}]"), value.as_str()));
        }
        let idempotency_key = format!("customer-{}", draft.organization_id);
        self.post_form("customers", &form, Some(&idempotency_key))
            .await
    }

    async fn create_checkout_session(
        &self,
        draft: &CheckoutSessionDraft,
    ) -> Result<CheckoutSession, GatewayError> {
        let organization_id = draft.organization_id.to_string();
        let form = vec![
            pair("customer", draft.customer_id.as_str()),
            pair("mode", "subscription"),
            pair("payment_method_types[0]", "card"),
            pair("line_items[0][price]", draft.price_id.as_str()),
            pair("line_items[0][quantity]", "1"),
            pair(
                "subscription_data[trial_period_days]",
                draft.trial_period_days.to_string(),
            ),
            pair(
                &format!("subscription_data[metadata][{ORGANIZATION_METADATA_KEY}]"),
                organization_id.as_str(),
            ),
            pair("success_url", draft.success_url.as_str()),
            pair("cancel_url", draft.cancel_url.as_str()),
            pair("allow_promotion_codes", "true"),
            pair("billing_address_collection", "required"),
            pair("expires_at", draft.expires_at.timestamp().to_string()),
            pair(
                &format!("metadata[{ORGANIZATION_METADATA_KEY}]"),
                organization_id.as_str(),
            ),
        ];
        self.post_form("checkout/sessions", &form, None).await
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, GatewayError> {
        let form = vec![pair("customer", customer_id), pair("return_url", return_url)];
        self.post_form("billing_portal/sessions", &form, None).await
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionObject, GatewayError> {
        let response = self
            .client
            .get(self.endpoint(&format!("subscriptions/{subscription_id}")))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        decode(response).await
    }
}
