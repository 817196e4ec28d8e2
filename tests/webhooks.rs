mod common;

use chrono::{Duration, Utc};
use common::{
    envelope, harness, sign, signup_request, subscription_object, Harness, GROWTH_MONTHLY,
    PRO_MONTHLY, STARTER_MONTHLY,
};
use serde_json::json;
use tenant_billing::billing::models::BillingState;
use tenant_billing::billing::{BillingEventType, PlanTier, SubscriptionStatus};
use tenant_billing::db::{AuditLedger, OrganizationStore};
use tenant_billing::error::AppError;
use tenant_billing::organizations::Organization;
use tenant_billing::webhooks::{Disposition, WebhookVerifier};
use uuid::Uuid;

async fn provisioned(h: &Harness) -> Organization {
    let created = h
        .services
        .provisioning
        .provision(signup_request(&format!("Clinic {}", Uuid::new_v4())))
        .await
        .unwrap();
    h.store
        .get_organization(created.organization_id)
        .await
        .unwrap()
        .unwrap()
}

async fn billing(h: &Harness, id: Uuid) -> BillingState {
    h.store.get_organization(id).await.unwrap().unwrap().billing
}

async fn deliver(h: &Harness, body: &[u8]) -> Disposition {
    h.services
        .dispatcher
        .dispatch(body, Some(sign(body).as_str()))
        .await
        .unwrap()
        .disposition
}

#[tokio::test]
async fn rejects_bad_signatures_without_side_effects() {
    let h = harness();
    let org = provisioned(&h).await;
    let body = envelope(
        "customer.subscription.deleted",
        subscription_object(org.id, "canceled", STARTER_MONTHLY, None),
    );

    let forged = WebhookVerifier::new("whsec_attacker", 300).sign(&body, Utc::now().timestamp());
    for signature in [None, Some("garbage"), Some(forged.as_str())] {
        let err = h
            .services
            .dispatcher
            .dispatch(&body, signature)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Authentication(_)));
    }

    assert_eq!(billing(&h, org.id).await, org.billing);
    assert_eq!(h.store.billing_event_count(), 0);
    assert_eq!(h.services.telemetry.snapshot().signature_failures, 3);
}

#[tokio::test]
async fn extreme_signature_timestamps_are_rejected() {
    let h = harness();
    let org = provisioned(&h).await;
    let body = envelope(
        "customer.subscription.created",
        subscription_object(org.id, "active", STARTER_MONTHLY, None),
    );

    for signature in ["t=-9223372036854775808,v1=00", "t=9223372036854775807,v1=00"] {
        let err = h
            .services
            .dispatcher
            .dispatch(&body, Some(signature))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Authentication(_)), "got {err:?}");
    }

    assert_eq!(billing(&h, org.id).await, org.billing);
    assert_eq!(h.store.billing_event_count(), 0);
    assert_eq!(h.services.telemetry.snapshot().signature_failures, 2);
}

#[tokio::test]
async fn checkout_completion_activates_and_clears_trial() {
    let h = harness();
    let org = provisioned(&h).await;
    let body = envelope(
        "checkout.session.completed",
        json!({
            "id": "cs_test_1",
            "customer": "cus_9",
            "subscription": { "id": "sub_9", "object": "subscription" },
            "metadata": { "organization_id": org.id.to_string() },
            "amount_total": 4900,
            "currency": "usd",
        }),
    );

    assert_eq!(deliver(&h, &body).await, Disposition::Applied);
    let state = billing(&h, org.id).await;
    assert_eq!(state.subscription_status, SubscriptionStatus::Active);
    assert_eq!(state.trial_ends_at, None);
    assert_eq!(state.stripe_customer_id.as_deref(), Some("cus_9"));
    assert_eq!(state.stripe_subscription_id.as_deref(), Some("sub_9"));

    let events = h.store.list_billing_events(org.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, BillingEventType::TrialConverted);
    assert_eq!(events[0].details["session_id"], "cs_test_1");
}

#[tokio::test]
async fn subscription_created_is_idempotent() {
    let h = harness();
    let org = provisioned(&h).await;
    let body = envelope(
        "customer.subscription.created",
        subscription_object(org.id, "active", GROWTH_MONTHLY, None),
    );

    assert_eq!(deliver(&h, &body).await, Disposition::Applied);
    let once = billing(&h, org.id).await;
    assert_eq!(deliver(&h, &body).await, Disposition::Unchanged);
    let twice = billing(&h, org.id).await;

    assert_eq!(once, twice);
    assert_eq!(once.subscription_plan, Some(PlanTier::Growth));
    assert_eq!(once.stripe_subscription_id.as_deref(), Some("sub_123"));
    assert_eq!(once.trial_ends_at, None);

    let events = h.store.list_billing_events(org.id).await.unwrap();
    assert!(events
        .iter()
        .all(|event| event.event_type == BillingEventType::SubscriptionActivated));
    assert_eq!(events[0].details["plan_tier"], "growth");
    assert_eq!(events[0].details["billing_cycle"], "month");
}

#[tokio::test]
async fn created_and_updated_converge_in_any_order() {
    let in_order = harness();
    let org_a = provisioned(&in_order).await;
    deliver(
        &in_order,
        &envelope(
            "customer.subscription.created",
            subscription_object(org_a.id, "active", STARTER_MONTHLY, None),
        ),
    )
    .await;
    deliver(
        &in_order,
        &envelope(
            "customer.subscription.updated",
            subscription_object(org_a.id, "active", PRO_MONTHLY, None),
        ),
    )
    .await;

    let updated_only = harness();
    let org_b = provisioned(&updated_only).await;
    deliver(
        &updated_only,
        &envelope(
            "customer.subscription.updated",
            subscription_object(org_b.id, "active", PRO_MONTHLY, None),
        ),
    )
    .await;

    let a = billing(&in_order, org_a.id).await;
    let b = billing(&updated_only, org_b.id).await;
    assert_eq!(a, b);
    assert_eq!(a.subscription_plan, Some(PlanTier::Pro));
    assert_eq!(a.subscription_status, SubscriptionStatus::Active);
}

fn completed_session(organization_id: Uuid) -> Vec<u8> {
    envelope(
        "checkout.session.completed",
        json!({
            "id": "cs_test_1",
            "customer": "cus_123",
            "subscription": "sub_123",
            "metadata": { "organization_id": organization_id.to_string() },
            "amount_total": 0,
            "currency": "usd",
        }),
    )
}

#[tokio::test]
async fn checkout_and_trialing_subscription_converge_in_either_order() {
    let trial_end = (Utc::now() + Duration::days(14)).timestamp();
    let trialing = |id| {
        envelope(
            "customer.subscription.created",
            subscription_object(id, "trialing", GROWTH_MONTHLY, Some(trial_end)),
        )
    };

    let checkout_first = harness();
    let org_a = provisioned(&checkout_first).await;
    assert_eq!(
        deliver(&checkout_first, &completed_session(org_a.id)).await,
        Disposition::Applied
    );
    // the stale trialing status is held back, the plan still lands
    assert_eq!(
        deliver(&checkout_first, &trialing(org_a.id)).await,
        Disposition::Applied
    );

    let subscription_first = harness();
    let org_b = provisioned(&subscription_first).await;
    assert_eq!(
        deliver(&subscription_first, &trialing(org_b.id)).await,
        Disposition::Applied
    );
    assert_eq!(
        deliver(&subscription_first, &completed_session(org_b.id)).await,
        Disposition::Applied
    );

    let a = billing(&checkout_first, org_a.id).await;
    let b = billing(&subscription_first, org_b.id).await;
    assert_eq!(a, b);
    assert_eq!(a.subscription_status, SubscriptionStatus::Active);
    assert_eq!(a.subscription_plan, Some(PlanTier::Growth));
    assert_eq!(a.stripe_customer_id.as_deref(), Some("cus_123"));
    assert_eq!(a.stripe_subscription_id.as_deref(), Some("sub_123"));
    assert_eq!(a.trial_ends_at, None);

    assert_eq!(
        checkout_first.services.telemetry.snapshot().rejected_transitions,
        1
    );
    assert_eq!(
        subscription_first.services.telemetry.snapshot().rejected_transitions,
        0
    );
}

#[tokio::test]
async fn trialing_subscription_keeps_provider_trial_end() {
    let h = harness();
    let org = provisioned(&h).await;
    let trial_end = (Utc::now() + Duration::days(10)).timestamp();
    deliver(
        &h,
        &envelope(
            "customer.subscription.created",
            subscription_object(org.id, "trialing", STARTER_MONTHLY, Some(trial_end)),
        ),
    )
    .await;
    let state = billing(&h, org.id).await;
    assert_eq!(state.subscription_status, SubscriptionStatus::Trialing);
    assert_eq!(state.trial_ends_at.map(|at| at.timestamp()), Some(trial_end));
}

#[tokio::test]
async fn unknown_price_falls_back_to_starter_and_is_counted() {
    let h = harness();
    let org = provisioned(&h).await;
    deliver(
        &h,
        &envelope(
            "customer.subscription.created",
            subscription_object(org.id, "active", "price_retired", None),
        ),
    )
    .await;
    assert_eq!(
        billing(&h, org.id).await.subscription_plan,
        Some(PlanTier::Starter)
    );
    assert_eq!(h.services.telemetry.snapshot().fallback_plan_resolutions, 1);
    let events = h.store.list_billing_events(org.id).await.unwrap();
    assert_eq!(events[0].details["plan_resolution"], "fallback");
}

#[tokio::test]
async fn cancellation_is_terminal() {
    let h = harness();
    let org = provisioned(&h).await;
    let canceled = envelope(
        "customer.subscription.deleted",
        json!({
            "id": "sub_123",
            "status": "canceled",
            "metadata": { "organization_id": org.id.to_string() },
            "canceled_at": Utc::now().timestamp(),
            "cancellation_details": { "reason": "cancellation_requested" },
        }),
    );
    assert_eq!(deliver(&h, &canceled).await, Disposition::Applied);
    let state = billing(&h, org.id).await;
    assert_eq!(state.subscription_status, SubscriptionStatus::Canceled);
    assert_eq!(state.trial_ends_at, None);

    let revived = envelope(
        "customer.subscription.updated",
        subscription_object(org.id, "active", STARTER_MONTHLY, None),
    );
    assert_eq!(deliver(&h, &revived).await, Disposition::Rejected);
    assert_eq!(
        billing(&h, org.id).await.subscription_status,
        SubscriptionStatus::Canceled
    );
    assert_eq!(h.services.telemetry.snapshot().rejected_transitions, 1);

    let events = h.store.list_billing_events(org.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].details["cancellation_reason"],
        "cancellation_requested"
    );
}

#[tokio::test]
async fn failed_invoice_links_by_customer_and_marks_past_due() {
    let h = harness();
    let org = provisioned(&h).await;
    deliver(
        &h,
        &envelope(
            "customer.subscription.created",
            subscription_object(org.id, "active", STARTER_MONTHLY, None),
        ),
    )
    .await;

    let failed = envelope(
        "invoice.payment_failed",
        json!({
            "id": "in_1",
            "customer": "cus_123",
            "amount_due": 4900,
            "currency": "usd",
            "attempt_count": 2,
            "last_finalization_error": { "message": "card_declined" },
        }),
    );
    assert_eq!(deliver(&h, &failed).await, Disposition::Applied);
    assert_eq!(
        billing(&h, org.id).await.subscription_status,
        SubscriptionStatus::PastDue
    );

    let paid = envelope(
        "invoice.paid",
        json!({
            "id": "in_2",
            "customer": "cus_123",
            "amount_paid": 4900,
            "currency": "usd",
            "period_start": 1_700_000_000,
            "period_end": 1_702_592_000,
        }),
    );
    assert_eq!(deliver(&h, &paid).await, Disposition::Logged);
    assert_eq!(
        billing(&h, org.id).await.subscription_status,
        SubscriptionStatus::PastDue
    );

    let events = h.store.list_billing_events(org.id).await.unwrap();
    let failed_event = events
        .iter()
        .find(|event| event.event_type == BillingEventType::PaymentFailed)
        .unwrap();
    assert_eq!(failed_event.details["failure_reason"], "card_declined");
    assert_eq!(failed_event.details["attempt_count"], 2);
    assert!(events
        .iter()
        .any(|event| event.event_type == BillingEventType::PaymentSuccessful));
}

#[tokio::test]
async fn payment_failure_during_trial_is_rejected() {
    let h = harness();
    let org = provisioned(&h).await;
    let trial_end = (Utc::now() + Duration::days(5)).timestamp();
    deliver(
        &h,
        &envelope(
            "customer.subscription.created",
            subscription_object(org.id, "trialing", STARTER_MONTHLY, Some(trial_end)),
        ),
    )
    .await;
    let before = billing(&h, org.id).await;
    let audited = h.store.billing_event_count();

    let failed = envelope(
        "invoice.payment_failed",
        json!({
            "id": "in_1",
            "customer": "cus_123",
            "amount_due": 4900,
            "currency": "usd",
            "attempt_count": 1,
        }),
    );
    assert_eq!(deliver(&h, &failed).await, Disposition::Rejected);

    let after = billing(&h, org.id).await;
    assert_eq!(after, before);
    assert_eq!(after.subscription_status, SubscriptionStatus::Trialing);
    assert_eq!(after.trial_ends_at.map(|at| at.timestamp()), Some(trial_end));
    assert_eq!(h.store.billing_event_count(), audited);
    assert_eq!(h.services.telemetry.snapshot().rejected_transitions, 1);
}

#[tokio::test]
async fn trial_notice_is_audit_only() {
    let h = harness();
    let org = provisioned(&h).await;
    let trial_end = (Utc::now() + Duration::days(3)).timestamp();
    let body = envelope(
        "customer.subscription.trial_will_end",
        subscription_object(org.id, "trialing", STARTER_MONTHLY, Some(trial_end)),
    );
    assert_eq!(deliver(&h, &body).await, Disposition::Logged);
    assert_eq!(billing(&h, org.id).await, org.billing);

    let events = h.store.list_billing_events(org.id).await.unwrap();
    assert_eq!(events[0].event_type, BillingEventType::TrialEndingSoon);
    assert_eq!(events[0].details["days_until_end"], 3);
}

#[tokio::test]
async fn unlinked_and_unknown_events_are_acknowledged() {
    let h = harness();
    let org = provisioned(&h).await;

    let unlinked = envelope(
        "checkout.session.completed",
        json!({ "id": "cs_x", "metadata": { "organization_id": "not-a-uuid" } }),
    );
    assert_eq!(deliver(&h, &unlinked).await, Disposition::Unlinked);

    let missing_org = envelope(
        "customer.subscription.deleted",
        subscription_object(Uuid::new_v4(), "canceled", STARTER_MONTHLY, None),
    );
    assert_eq!(deliver(&h, &missing_org).await, Disposition::Unlinked);

    let unknown = envelope("charge.refunded", json!({ "id": "ch_1" }));
    assert_eq!(deliver(&h, &unknown).await, Disposition::Ignored);

    let snapshot = h.services.telemetry.snapshot();
    assert_eq!(snapshot.unlinked_events, 2);
    assert_eq!(snapshot.ignored_events, 1);
    assert_eq!(billing(&h, org.id).await, org.billing);
    assert_eq!(h.store.billing_event_count(), 0);
}

#[tokio::test]
async fn malformed_objects_are_validation_errors() {
    let h = harness();
    let body = envelope("customer.subscription.updated", json!({ "id": "sub_1" }));
    let err = h
        .services
        .dispatcher
        .dispatch(&body, Some(sign(&body).as_str()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}
