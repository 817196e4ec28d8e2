use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::{BillingState, PlanTier, SubscriptionStatus};
use crate::db::OrganizationStore;
use crate::error::{AppError, AppResult};
use crate::telemetry::BillingTelemetry;

const MAX_WRITE_ATTEMPTS: usize = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrialChange {
    #[default]
    Keep,
    Clear,
    Set(DateTime<Utc>),
}

/// Absolute values to set; `None` leaves the field as stored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionPatch {
    pub status: Option<SubscriptionStatus>,
    pub plan: Option<PlanTier>,
    pub trial_ends_at: TrialChange,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        previous: BillingState,
        current: BillingState,
    },
    Unchanged(BillingState),
    Rejected {
        current: BillingState,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    OrganizationMissing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: SubscriptionStatus,
    pub to: SubscriptionStatus,
}

/// A patch folded into the stored state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub next: BillingState,
    /// Status move refused while the remaining fields still applied.
    pub held: Option<IllegalTransition>,
}

/// Computes the state a patch leads to, enforcing the transition table and
/// the trial invariant (`trialing` always has an end, nothing else has one).
///
/// An illegal status move out of a terminal state rejects the whole patch.
/// Any other illegal move keeps the stored status (the event is stale) but
/// still records plan, ids and trial fields, so reordered deliveries converge.
pub fn next_state(
    current: &BillingState,
    patch: &SubscriptionPatch,
    now: DateTime<Utc>,
    trial_period: Duration,
) -> Result<Transition, IllegalTransition> {
    let mut next = current.clone();
    let mut held = None;

    if let Some(status) = patch.status {
        if current.subscription_status.can_transition_to(status) {
            next.subscription_status = status;
        } else {
            let refused = IllegalTransition {
                from: current.subscription_status,
                to: status,
            };
            if current.subscription_status.is_terminal() {
                return Err(refused);
            }
            held = Some(refused);
        }
    }
    if let Some(plan) = patch.plan {
        next.subscription_plan = Some(plan);
    }
    if let Some(customer_id) = &patch.customer_id {
        next.stripe_customer_id = Some(customer_id.clone());
    }
    if let Some(subscription_id) = &patch.subscription_id {
        next.stripe_subscription_id = Some(subscription_id.clone());
    }
    match patch.trial_ends_at {
        TrialChange::Keep => {}
        TrialChange::Clear => next.trial_ends_at = None,
        TrialChange::Set(at) => next.trial_ends_at = Some(at),
    }

    if next.subscription_status == SubscriptionStatus::Trialing {
        if next.trial_ends_at.is_none() {
            next.trial_ends_at = current.trial_ends_at.or(Some(now + trial_period));
        }
    } else {
        next.trial_ends_at = None;
    }

    Ok(Transition { next, held })
}

/// Single writer of subscription fields.
pub struct SubscriptionStateMachine {
    organizations: Arc<dyn OrganizationStore>,
    telemetry: Arc<BillingTelemetry>,
    trial_period: Duration,
}

impl SubscriptionStateMachine {
    pub fn new(
        organizations: Arc<dyn OrganizationStore>,
        telemetry: Arc<BillingTelemetry>,
        trial_period: Duration,
    ) -> Self {
        Self {
            organizations,
            telemetry,
            trial_period,
        }
    }

    /// Applies the patch as one compare-and-set write, re-reading on lost races.
    pub async fn apply(
        &self,
        organization_id: Uuid,
        patch: &SubscriptionPatch,
    ) -> AppResult<TransitionOutcome> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let Some(organization) = self.organizations.get_organization(organization_id).await?
            else {
                return Ok(TransitionOutcome::OrganizationMissing);
            };
            let current = organization.billing;

            let Transition { next, held } =
                match next_state(&current, patch, Utc::now(), self.trial_period) {
                    Ok(transition) => transition,
                    Err(IllegalTransition { from, to }) => {
                        self.reject(organization_id, from, to);
                        return Ok(TransitionOutcome::Rejected { current, from, to });
                    }
                };

            if next == current {
                if let Some(IllegalTransition { from, to }) = held {
                    self.reject(organization_id, from, to);
                    return Ok(TransitionOutcome::Rejected { current, from, to });
                }
                debug!(%organization_id, "subscription patch already applied");
                return Ok(TransitionOutcome::Unchanged(current));
            }

            if self
                .organizations
                .compare_and_set_billing(organization_id, &current, &next)
                .await?
            {
                if let Some(IllegalTransition { from, to }) = held {
                    self.telemetry.record_rejected_transition();
                    warn!(
                        %organization_id,
                        from = from.as_str(),
                        to = to.as_str(),
                        "stale subscription status ignored, other fields applied"
                    );
                }
                info!(
                    %organization_id,
                    from = current.subscription_status.as_str(),
                    to = next.subscription_status.as_str(),
                    plan = ?next.subscription_plan,
                    "subscription state updated"
                );
                return Ok(TransitionOutcome::Applied {
                    previous: current,
                    current: next,
                });
            }

            debug!(%organization_id, attempt, "billing state changed underneath, retrying");
        }

        Err(AppError::Persistence(format!(
            "organization {organization_id} kept changing during {MAX_WRITE_ATTEMPTS} write attempts"
        )))
    }

    fn reject(&self, organization_id: Uuid, from: SubscriptionStatus, to: SubscriptionStatus) {
        self.telemetry.record_rejected_transition();
        warn!(
            %organization_id,
            from = from.as_str(),
            to = to.as_str(),
            "rejected illegal subscription transition"
        );
    }

    /// Records the external customer id unless one is already stored, and
    /// returns whichever id ends up stored.
    pub async fn attach_customer(
        &self,
        organization_id: Uuid,
        customer_id: &str,
    ) -> AppResult<String> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let organization = self
                .organizations
                .get_organization(organization_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("organization {organization_id}")))?;
            if let Some(existing) = organization.billing.stripe_customer_id.clone() {
                if existing != customer_id {
                    warn!(
                        %organization_id,
                        stored = %existing,
                        discarded = %customer_id,
                        "organization already linked to a different customer"
                    );
                }
                return Ok(existing);
            }

            let mut next = organization.billing.clone();
            next.stripe_customer_id = Some(customer_id.to_string());
            if self
                .organizations
                .compare_and_set_billing(organization_id, &organization.billing, &next)
                .await?
            {
                return Ok(customer_id.to_string());
            }
        }

        Err(AppError::Persistence(format!(
            "could not link customer to organization {organization_id}"
        )))
    }
}
