use tracing::{error, warn};

use super::events::{BillingEvent, NewBillingEvent};
use crate::db::AuditLedger;
use crate::error::{AppError, AppResult};
use crate::telemetry::validate_event_details;
pub async fn record(ledger: &dyn AuditLedger, event: NewBillingEvent) -> AppResult<BillingEvent> {
    validate_event_details(&event.event_type, &event.details)
        .map_err(|err| AppError::Validation(err.to_string()))?;
    let stored = ledger.append_billing_event(&event).await?;
    Ok(stored)
}

/// Appends without letting a ledger failure fail the caller.
pub async fn record_best_effort(ledger: &dyn AuditLedger, event: NewBillingEvent) {
    let event_type = event.event_type.as_str().to_string();
    let organization_id = event.organization_id;
    match record(ledger, event).await {
        Ok(_) => {}
        Err(AppError::Validation(reason)) => warn!(
            %event_type,
            ?organization_id,
            %reason,
            "billing event rejected by detail contract"
        ),
        Err(err) => error!(
            ?err,
            %event_type,
            ?organization_id,
            "failed to append billing event"
        ),
    }
}
