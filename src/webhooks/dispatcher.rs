use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{
    CheckoutSessionObject, InvoiceObject, ProviderEvent, ProviderEventKind, SubscriptionObject,
};
use super::signature::WebhookVerifier;
use crate::billing::events::{BillingEventType, NewBillingEvent};
use crate::billing::ledger;
use crate::billing::models::{BillingCatalog, PlanTier, SubscriptionStatus};
use crate::billing::state_machine::{
    SubscriptionPatch, SubscriptionStateMachine, TransitionOutcome, TrialChange,
};
use crate::db::{AuditLedger, OrganizationStore};
use crate::error::{AppError, AppResult};
use crate::telemetry::BillingTelemetry;

const SECONDS_PER_DAY: i64 = 86_400;

/// What a single delivery did to local state.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Organization billing state changed.
    Applied,
    /// State already matched the event (redelivery).
    Unchanged,
    /// Transition not allowed from the stored status.
    Rejected,
    /// Audit-only event.
    Logged,
    /// No organization could be linked to the event.
    Unlinked,
    /// Event type this service does not handle.
    Ignored,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub event_id: String,
    pub event_type: String,
    pub disposition: Disposition,
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

fn decode_object<T: DeserializeOwned>(event: &ProviderEvent) -> AppResult<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|err| {
        AppError::Validation(format!(
            "malformed `{}` object in event {}: {err}",
            event.event_type, event.id
        ))
    })
}

/// Verifies provider events and routes them to the state machine and ledger.
pub struct EventDispatcher {
    verifier: WebhookVerifier,
    state_machine: Arc<SubscriptionStateMachine>,
    organizations: Arc<dyn OrganizationStore>,
    ledger: Arc<dyn AuditLedger>,
    catalog: Arc<BillingCatalog>,
    telemetry: Arc<BillingTelemetry>,
}

impl EventDispatcher {
    pub fn new(
        verifier: WebhookVerifier,
        state_machine: Arc<SubscriptionStateMachine>,
        organizations: Arc<dyn OrganizationStore>,
        ledger: Arc<dyn AuditLedger>,
        catalog: Arc<BillingCatalog>,
        telemetry: Arc<BillingTelemetry>,
    ) -> Self {
        Self {
            verifier,
            state_machine,
            organizations,
            ledger,
            catalog,
            telemetry,
        }
    }

    /// Verifies the signature before looking at the payload, then routes by event type.
    pub async fn dispatch(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> AppResult<DispatchOutcome> {
        if let Err(err) = self.verifier.verify(payload, signature) {
            self.telemetry.record_signature_failure();
            warn!(%err, "rejected provider event with invalid signature");
            return Err(AppError::Authentication(err.to_string()));
        }

        let event: ProviderEvent = serde_json::from_slice(payload)
            .map_err(|err| AppError::Validation(format!("malformed event envelope: {err}")))?;
        info!(event_id = %event.id, event_type = %event.event_type, "processing provider event");

        let disposition = match ProviderEventKind::parse(&event.event_type) {
            ProviderEventKind::CheckoutCompleted => {
                self.checkout_completed(decode_object(&event)?).await?
            }
            ProviderEventKind::SubscriptionCreated => {
                self.subscription_created(decode_object(&event)?).await?
            }
            ProviderEventKind::SubscriptionUpdated => {
                let subscription: SubscriptionObject = decode_object(&event)?;
                match self.linked(subscription.organization_id(), &event) {
                    Some(organization_id) => {
                        self.apply_subscription_update(
                            organization_id,
                            &subscription,
                            "stripe_webhook_update",
                        )
                        .await?
                    }
                    None => Disposition::Unlinked,
                }
            }
            ProviderEventKind::SubscriptionDeleted => {
                self.subscription_deleted(decode_object(&event)?).await?
            }
            ProviderEventKind::InvoicePaid => self.invoice_paid(decode_object(&event)?).await?,
            ProviderEventKind::InvoicePaymentFailed => {
                self.payment_failed(decode_object(&event)?).await?
            }
            ProviderEventKind::TrialWillEnd => {
                self.trial_will_end(decode_object(&event)?).await?
            }
            ProviderEventKind::Unknown(kind) => {
                self.telemetry.record_ignored_event();
                debug!(event_id = %event.id, event_type = %kind, "unhandled provider event type");
                Disposition::Ignored
            }
        };

        if disposition == Disposition::Unlinked {
            self.telemetry.record_unlinked_event();
        }
        info!(event_id = %event.id, ?disposition, "provider event handled");
        Ok(DispatchOutcome {
            event_id: event.id,
            event_type: event.event_type,
            disposition,
        })
    }

    fn linked(&self, organization_id: Option<Uuid>, event: &ProviderEvent) -> Option<Uuid> {
        if organization_id.is_none() {
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "provider event carries no usable organization_id"
            );
        }
        organization_id
    }

    fn resolve_plan(&self, subscription: &SubscriptionObject) -> (Option<PlanTier>, &'static str) {
        let Some(price) = subscription.primary_price() else {
            return (None, "absent");
        };
        let resolution = self.catalog.resolve_price(&price.id);
        if resolution.fallback {
            self.telemetry.record_fallback_plan();
            warn!(
                subscription_id = %subscription.id,
                price_id = %price.id,
                fallback = resolution.tier.as_str(),
                "unknown price id, falling back to default plan"
            );
            (Some(resolution.tier), "fallback")
        } else {
            (Some(resolution.tier), "catalog")
        }
    }

    fn provider_status(&self, subscription: &SubscriptionObject) -> Option<SubscriptionStatus> {
        let status = SubscriptionStatus::from_str(&subscription.status);
        if status.is_none() {
            warn!(
                subscription_id = %subscription.id,
                status = %subscription.status,
                "provider status outside the subscription model, leaving status unchanged"
            );
        }
        status
    }

    fn subscription_patch(
        &self,
        subscription: &SubscriptionObject,
        plan: Option<PlanTier>,
    ) -> SubscriptionPatch {
        let status = self.provider_status(subscription);
        let trial_ends_at = match (status, subscription.trial_end.and_then(timestamp)) {
            (Some(SubscriptionStatus::Trialing), Some(end)) => TrialChange::Set(end),
            (Some(SubscriptionStatus::Trialing), None) | (None, _) => TrialChange::Keep,
            (Some(_), _) => TrialChange::Clear,
        };
        SubscriptionPatch {
            status,
            plan,
            trial_ends_at,
            customer_id: subscription.customer.clone(),
            subscription_id: Some(subscription.id.clone()),
        }
    }

    /// Maps a state-machine outcome onto a disposition; only applied or
    /// already-applied transitions are audited.
    fn settle(&self, organization_id: Uuid, outcome: &TransitionOutcome) -> Disposition {
        match outcome {
            TransitionOutcome::Applied { .. } => Disposition::Applied,
            TransitionOutcome::Unchanged(_) => Disposition::Unchanged,
            TransitionOutcome::Rejected { .. } => Disposition::Rejected,
            TransitionOutcome::OrganizationMissing => {
                warn!(%organization_id, "provider event references an unknown organization");
                Disposition::Unlinked
            }
        }
    }

    async fn audit(&self, disposition: Disposition, event: NewBillingEvent) {
        if matches!(disposition, Disposition::Applied | Disposition::Unchanged) {
            ledger::record_best_effort(self.ledger.as_ref(), event).await;
        }
    }

    async fn checkout_completed(&self, session: CheckoutSessionObject) -> AppResult<Disposition> {
        let Some(organization_id) = session.organization_id() else {
            warn!(session_id = %session.id, "checkout session without organization_id");
            return Ok(Disposition::Unlinked);
        };
        let patch = SubscriptionPatch {
            status: Some(SubscriptionStatus::Active),
            trial_ends_at: TrialChange::Clear,
            customer_id: session.customer.clone(),
            subscription_id: session.subscription.clone(),
            ..Default::default()
        };
        let outcome = self.state_machine.apply(organization_id, &patch).await?;
        let disposition = self.settle(organization_id, &outcome);
        self.audit(
            disposition,
            NewBillingEvent::new(
                BillingEventType::TrialConverted,
                organization_id,
                json!({
                    "session_id": session.id,
                    "amount_total": session.amount_total,
                    "currency": session.currency,
                }),
            )
            .customer(session.customer.clone())
            .subscription(session.subscription.clone()),
        )
        .await;
        Ok(disposition)
    }

    async fn subscription_created(
        &self,
        subscription: SubscriptionObject,
    ) -> AppResult<Disposition> {
        let Some(organization_id) = subscription.organization_id() else {
            warn!(subscription_id = %subscription.id, "subscription without organization_id");
            return Ok(Disposition::Unlinked);
        };
        let (plan, plan_resolution) = self.resolve_plan(&subscription);
        let patch = self.subscription_patch(&subscription, plan);
        let outcome = self.state_machine.apply(organization_id, &patch).await?;
        let disposition = self.settle(organization_id, &outcome);

        let price = subscription.primary_price();
        self.audit(
            disposition,
            NewBillingEvent::new(
                BillingEventType::SubscriptionActivated,
                organization_id,
                json!({
                    "plan_tier": plan.map(|tier| tier.as_str()),
                    "amount": price.and_then(|p| p.unit_amount),
                    "currency": price.and_then(|p| p.currency.clone()),
                    "billing_cycle": price
                        .and_then(|p| p.recurring.as_ref())
                        .and_then(|r| r.interval.clone()),
                    "trial_used": subscription.trial_end.is_some(),
                    "plan_resolution": plan_resolution,
                }),
            )
            .customer(subscription.customer.clone())
            .subscription(Some(subscription.id.clone())),
        )
        .await;
        Ok(disposition)
    }

    /// Shared by `customer.subscription.updated` and reconciliation.
    pub async fn apply_subscription_update(
        &self,
        organization_id: Uuid,
        subscription: &SubscriptionObject,
        change_reason: &str,
    ) -> AppResult<Disposition> {
        let (plan, plan_resolution) = self.resolve_plan(subscription);
        let patch = self.subscription_patch(subscription, plan);
        let outcome = self.state_machine.apply(organization_id, &patch).await?;
        let disposition = self.settle(organization_id, &outcome);
        self.audit(
            disposition,
            NewBillingEvent::new(
                BillingEventType::SubscriptionUpdated,
                organization_id,
                json!({
                    "new_status": subscription.status,
                    "new_plan": plan.map(|tier| tier.as_str()),
                    "change_reason": change_reason,
                    "plan_resolution": plan_resolution,
                }),
            )
            .customer(subscription.customer.clone())
            .subscription(Some(subscription.id.clone())),
        )
        .await;
        Ok(disposition)
    }

    async fn subscription_deleted(
        &self,
        subscription: SubscriptionObject,
    ) -> AppResult<Disposition> {
        let Some(organization_id) = subscription.organization_id() else {
            warn!(subscription_id = %subscription.id, "canceled subscription without organization_id");
            return Ok(Disposition::Unlinked);
        };
        let patch = SubscriptionPatch {
            status: Some(SubscriptionStatus::Canceled),
            trial_ends_at: TrialChange::Clear,
            ..Default::default()
        };
        let outcome = self.state_machine.apply(organization_id, &patch).await?;
        let disposition = self.settle(organization_id, &outcome);

        let canceled_at = subscription
            .canceled_at
            .and_then(timestamp)
            .unwrap_or_else(Utc::now);
        let reason = subscription
            .cancellation_details
            .as_ref()
            .and_then(|details| details.reason.clone())
            .unwrap_or_else(|| "unknown".to_string());
        self.audit(
            disposition,
            NewBillingEvent::new(
                BillingEventType::SubscriptionCanceled,
                organization_id,
                json!({
                    "cancellation_reason": reason,
                    "canceled_at": canceled_at,
                }),
            )
            .customer(subscription.customer.clone())
            .subscription(Some(subscription.id.clone())),
        )
        .await;
        Ok(disposition)
    }

    async fn invoice_organization(&self, invoice: &InvoiceObject) -> AppResult<Option<Uuid>> {
        if let Some(id) = invoice.organization_id() {
            return Ok(Some(id));
        }
        let Some(customer_id) = invoice.customer.as_deref() else {
            return Ok(None);
        };
        let organization = self.organizations.find_by_customer_id(customer_id).await?;
        Ok(organization.map(|org| org.id))
    }

    async fn invoice_paid(&self, invoice: InvoiceObject) -> AppResult<Disposition> {
        let Some(organization_id) = self.invoice_organization(&invoice).await? else {
            warn!(invoice_id = %invoice.id, "paid invoice not linked to any organization");
            return Ok(Disposition::Unlinked);
        };
        let billing_period = json!({
            "start": timestamp(invoice.period_start.unwrap_or(0)),
            "end": timestamp(invoice.period_end.unwrap_or(0)),
        });
        ledger::record_best_effort(
            self.ledger.as_ref(),
            NewBillingEvent::new(
                BillingEventType::PaymentSuccessful,
                organization_id,
                json!({
                    "invoice_id": invoice.id,
                    "amount_paid": invoice.amount_paid,
                    "currency": invoice.currency,
                    "billing_period": billing_period,
                }),
            )
            .customer(invoice.customer.clone())
            .subscription(invoice.subscription.clone()),
        )
        .await;
        Ok(Disposition::Logged)
    }

    async fn payment_failed(&self, invoice: InvoiceObject) -> AppResult<Disposition> {
        let Some(organization_id) = self.invoice_organization(&invoice).await? else {
            warn!(invoice_id = %invoice.id, "failed invoice not linked to any organization");
            return Ok(Disposition::Unlinked);
        };
        let patch = SubscriptionPatch {
            status: Some(SubscriptionStatus::PastDue),
            ..Default::default()
        };
        let outcome = self.state_machine.apply(organization_id, &patch).await?;
        let disposition = self.settle(organization_id, &outcome);
        let failure_reason = invoice
            .last_finalization_error
            .as_ref()
            .and_then(|err| err.message.clone())
            .unwrap_or_else(|| "unknown".to_string());
        self.audit(
            disposition,
            NewBillingEvent::new(
                BillingEventType::PaymentFailed,
                organization_id,
                json!({
                    "invoice_id": invoice.id,
                    "amount_due": invoice.amount_due,
                    "currency": invoice.currency,
                    "failure_reason": failure_reason,
                    "attempt_count": invoice.attempt_count,
                }),
            )
            .customer(invoice.customer.clone())
            .subscription(invoice.subscription.clone()),
        )
        .await;
        Ok(disposition)
    }

    async fn trial_will_end(&self, subscription: SubscriptionObject) -> AppResult<Disposition> {
        let Some(organization_id) = subscription.organization_id() else {
            warn!(subscription_id = %subscription.id, "trial notice without organization_id");
            return Ok(Disposition::Unlinked);
        };
        let trial_end = subscription.trial_end.and_then(timestamp);
        let days_until_end = days_until(trial_end, Utc::now());
        ledger::record_best_effort(
            self.ledger.as_ref(),
            NewBillingEvent::new(
                BillingEventType::TrialEndingSoon,
                organization_id,
                json!({
                    "trial_end": trial_end,
                    "days_until_end": days_until_end,
                }),
            )
            .customer(subscription.customer.clone())
            .subscription(Some(subscription.id.clone())),
        )
        .await;
        Ok(Disposition::Logged)
    }
}

/// Whole days remaining, rounded up; 0 without a trial end.
fn days_until(trial_end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Value {
    let Some(end) = trial_end else {
        return json!(0);
    };
    let secs = (end - now).num_seconds();
    json!(secs.div_euclid(SECONDS_PER_DAY) + i64::from(secs.rem_euclid(SECONDS_PER_DAY) != 0))
}
