mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{
    envelope, flaky_stores, harness, service_config, sign, signup_request, subscription_object,
    FakeGateway, FlakyStore, Harness, PRO_MONTHLY, STARTER_MONTHLY,
};
use tenant_billing::billing::usage::current_period;
use tenant_billing::billing::BillingEventType;
use tenant_billing::db::AuditLedger;
use tenant_billing::error::AppError;
use tenant_billing::routes::Services;
use uuid::Uuid;

async fn subscribed(services: &Services, price_id: &str) -> Uuid {
    let created = services
        .provisioning
        .provision(signup_request(&format!("Clinic {}", Uuid::new_v4())))
        .await
        .unwrap();
    let body = envelope(
        "customer.subscription.created",
        subscription_object(created.organization_id, "active", price_id, None),
    );
    services
        .dispatcher
        .dispatch(&body, Some(sign(&body).as_str()))
        .await
        .unwrap();
    created.organization_id
}

fn record_this_month(h: &Harness, organization_id: Uuid, units: i64) {
    let (period_start, _) = current_period(Utc::now());
    h.store
        .record_usage(organization_id, units, period_start + Duration::hours(1));
}

#[tokio::test]
async fn starter_overage_is_computed_and_audited() {
    let h = harness();
    let org = subscribed(&h.services, STARTER_MONTHLY).await;
    record_this_month(&h, org, 50);
    record_this_month(&h, org, 30);
    // last month's units are outside the period
    let (period_start, _) = current_period(Utc::now());
    h.store
        .record_usage(org, 500, period_start - Duration::hours(1));

    let snapshot = h.services.usage.snapshot(org).await.unwrap();
    assert_eq!(snapshot.usage, 80);
    assert_eq!(snapshot.limit, 75);
    assert_eq!(snapshot.overage, 5);
    assert_eq!(snapshot.overage_charge, 750);
    assert_eq!(snapshot.utilization_percent, 106.67);

    let events = h.store.list_billing_events(org).await.unwrap();
    let tracked = events
        .iter()
        .find(|event| event.event_type == BillingEventType::UsageTracked)
        .expect("usage audit entry");
    assert_eq!(tracked.details["units_processed"], 80);
    assert_eq!(tracked.details["overage_charge_cents"], 750);
    assert_eq!(tracked.stripe_subscription_id.as_deref(), Some("sub_123"));
}

#[tokio::test]
async fn unlimited_plan_never_accrues_overage() {
    let h = harness();
    let org = subscribed(&h.services, PRO_MONTHLY).await;
    record_this_month(&h, org, 10_000);

    let snapshot = h.services.usage.snapshot(org).await.unwrap();
    assert_eq!(snapshot.usage, 10_000);
    assert_eq!(snapshot.limit, -1);
    assert_eq!(snapshot.overage, 0);
    assert_eq!(snapshot.overage_charge, 0);
    assert_eq!(snapshot.utilization_percent, 0.0);
}

#[tokio::test]
async fn no_counters_means_zero_usage() {
    let h = harness();
    let org = subscribed(&h.services, STARTER_MONTHLY).await;
    let snapshot = h.services.usage.snapshot(org).await.unwrap();
    assert_eq!(snapshot.usage, 0);
    assert_eq!(snapshot.utilization_percent, 0.0);
}

#[tokio::test]
async fn trialing_organization_is_not_subscribed() {
    let h = harness();
    let created = h
        .services
        .provisioning
        .provision(signup_request("Paw Prints"))
        .await
        .unwrap();
    let err = h
        .services
        .usage
        .snapshot(created.organization_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotSubscribed(id) if id == created.organization_id));
    assert_eq!(h.store.billing_event_count(), 0);

    let err = h.services.usage.snapshot(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn ledger_failure_fails_the_snapshot() {
    let store = Arc::new(FlakyStore::new());
    let services = Services::build(
        flaky_stores(&store),
        Arc::new(FakeGateway::default()),
        service_config(),
    );
    let org = subscribed(&services, STARTER_MONTHLY).await;

    store.fail_billing_events.store(true, Ordering::SeqCst);
    let err = services.usage.snapshot(org).await.unwrap_err();
    assert!(matches!(err, AppError::Persistence(_)));
}
