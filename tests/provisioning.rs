mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{flaky_stores, harness, service_config, signup_request, FakeGateway, FlakyStore};
use tenant_billing::billing::SubscriptionStatus;
use tenant_billing::db::{OrganizationStore, UserStore};
use tenant_billing::error::AppError;
use tenant_billing::organizations::UserRole;
use tenant_billing::routes::Services;

fn flaky_services(store: &Arc<FlakyStore>) -> Services {
    Services::build(
        flaky_stores(store),
        Arc::new(FakeGateway::default()),
        service_config(),
    )
}

#[tokio::test]
async fn provisions_organization_owner_and_trial() {
    let h = harness();
    let request = signup_request("Thompson's Pet Care!");
    let principal = request.owner_principal_id.clone();

    let created = h.services.provisioning.provision(request).await.unwrap();
    assert_eq!(created.slug, "thompson-s-pet-care-");
    assert_eq!(created.name, "Thompson's Pet Care!");

    let org = h
        .store
        .get_organization(created.organization_id)
        .await
        .unwrap()
        .expect("organization stored");
    assert_eq!(org.billing.subscription_status, SubscriptionStatus::Trialing);
    let trial_end = org.billing.trial_ends_at.expect("trial seeded");
    let expected = Utc::now() + Duration::days(14);
    assert!((trial_end - expected).num_seconds().abs() < 5);
    assert_eq!(org.settings["checkpoints"][0]["code"], "intake");
    assert_eq!(org.settings["service_types"].as_array().unwrap().len(), 3);

    let users = h.store.list_users(org.id).await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].role, UserRole::Owner);
    assert_eq!(users[0].auth_id, principal);
    assert!(users[0].is_active);

    let logs = h.store.system_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].event_type, "user_signup");
    assert_eq!(logs[0].details["owner_id"], users[0].id.to_string());
    assert_eq!(logs[0].details["signup_method"], "email");
}

#[tokio::test]
async fn supplied_slug_wins_over_derivation() {
    let h = harness();
    let mut request = signup_request("Rainbow Bridge");
    request.slug = Some("rainbow".into());
    let created = h.services.provisioning.provision(request).await.unwrap();
    assert_eq!(created.slug, "rainbow");

    let mut blank = signup_request("Rainbow Bridge");
    blank.slug = Some("   ".into());
    let created = h.services.provisioning.provision(blank).await.unwrap();
    assert_eq!(created.slug, "rainbow-bridge");
}

#[tokio::test]
async fn duplicate_slug_is_a_conflict_and_keeps_the_first() {
    let h = harness();
    let first = h
        .services
        .provisioning
        .provision(signup_request("Paw Prints"))
        .await
        .unwrap();
    let err = h
        .services
        .provisioning
        .provision(signup_request("Paw-Prints"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(h.store.organization_count(), 1);
    assert!(h
        .store
        .get_organization(first.organization_id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn missing_fields_fail_before_any_write() {
    let h = harness();
    let mut request = signup_request("Paw Prints");
    request.last_name = String::new();
    let err = h.services.provisioning.provision(request).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(h.store.organization_count(), 0);
    assert_eq!(h.store.user_count(), 0);
}

#[tokio::test]
async fn owner_failure_rolls_back_the_organization() {
    let store = Arc::new(FlakyStore::new());
    store.fail_user_inserts.store(true, Ordering::SeqCst);
    let services = flaky_services(&store);

    let err = services
        .provisioning
        .provision(signup_request("Paw Prints"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Persistence(_)));
    assert_eq!(store.inner.organization_count(), 0);
    assert_eq!(store.inner.user_count(), 0);
    assert!(store.inner.system_logs().is_empty());
    assert_eq!(services.telemetry.snapshot().orphaned_organizations, 0);
}

#[tokio::test]
async fn compensation_is_retried_once_after_a_failure() {
    let store = Arc::new(FlakyStore::new());
    store.fail_user_inserts.store(true, Ordering::SeqCst);
    store.failing_org_deletes.store(1, Ordering::SeqCst);
    let services = flaky_services(&store);

    let err = services
        .provisioning
        .provision(signup_request("Paw Prints"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Persistence(_)));
    assert_eq!(store.org_delete_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(store.inner.organization_count(), 0);
}

#[tokio::test]
async fn failed_compensation_is_reported_as_orphaned() {
    let store = Arc::new(FlakyStore::new());
    store.fail_user_inserts.store(true, Ordering::SeqCst);
    store.failing_org_deletes.store(usize::MAX, Ordering::SeqCst);
    let services = flaky_services(&store);

    let err = services
        .provisioning
        .provision(signup_request("Paw Prints"))
        .await
        .unwrap_err();
    let message = match err {
        AppError::Persistence(message) => message,
        other => panic!("expected persistence error, got {other:?}"),
    };
    assert!(message.contains("rollback incomplete"));
    assert_eq!(store.inner.organization_count(), 1);
    assert_eq!(services.telemetry.snapshot().orphaned_organizations, 1);
}

#[tokio::test]
async fn repeat_signup_by_the_same_principal_is_a_conflict() {
    let h = harness();
    let first = signup_request("Paw Prints");
    let mut repeat = signup_request("Paw Prints Two");
    repeat.owner_principal_id = first.owner_principal_id.clone();

    h.services.provisioning.provision(first).await.unwrap();
    let err = h.services.provisioning.provision(repeat).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "got {err:?}");

    // the second organization is rolled back with its owner
    assert_eq!(h.store.organization_count(), 1);
    assert_eq!(h.store.user_count(), 1);
}
