use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use super::checkout::{
    CheckoutRequest, CheckoutResponse, CheckoutService, PortalRequest, PortalResponse,
};
use super::events::BillingEvent;
use super::models::UsageSnapshot;
use super::reconciliation::{ReconciliationReport, Reconciler};
use super::usage::UsageMeter;
use crate::db::AuditLedger;
use crate::error::AppResult;

pub fn routes() -> Router {
    Router::new()
        .route("/api/billing/checkout", post(create_checkout))
        .route("/api/billing/portal", post(create_portal))
        .route("/api/billing/:organization_id/usage", get(usage_snapshot))
        .route("/api/billing/:organization_id/reconcile", post(reconcile))
        .route("/api/billing/:organization_id/events", get(list_events))
}
pub async fn create_checkout(
    Extension(checkout): Extension<Arc<CheckoutService>>,
    Json(payload): Json<CheckoutRequest>,
) -> AppResult<Json<CheckoutResponse>> {
    Ok(Json(checkout.start_checkout(payload).await?))
}

pub async fn create_portal(
    Extension(checkout): Extension<Arc<CheckoutService>>,
    Json(payload): Json<PortalRequest>,
) -> AppResult<Json<PortalResponse>> {
    Ok(Json(checkout.open_portal(payload.organization_id).await?))
}

pub async fn usage_snapshot(
    Extension(meter): Extension<Arc<UsageMeter>>,
    Path(organization_id): Path<Uuid>,
) -> AppResult<Json<UsageSnapshot>> {
    Ok(Json(meter.snapshot(organization_id).await?))
}

pub async fn reconcile(
    Extension(reconciler): Extension<Arc<Reconciler>>,
    Path(organization_id): Path<Uuid>,
) -> AppResult<Json<ReconciliationReport>> {
    Ok(Json(reconciler.reconcile(organization_id).await?))
}

pub async fn list_events(
    Extension(ledger): Extension<Arc<dyn AuditLedger>>,
    Path(organization_id): Path<Uuid>,
) -> AppResult<Json<Vec<BillingEvent>>> {
    let events = ledger.list_billing_events(organization_id).await.map_err(|err| {
        tracing::error!(?err, %organization_id, "failed to list billing events");
        err
    })?;
    Ok(Json(events))
}
