pub mod dispatcher;
pub mod events;
pub mod signature;

use std::sync::Arc;

use axum::{body::Bytes, extract::Extension, http::HeaderMap, Json};
use serde::Serialize;

pub use dispatcher::{DispatchOutcome, Disposition, EventDispatcher};
pub use signature::{SignatureError, WebhookVerifier, SIGNATURE_HEADER};

use crate::error::AppResult;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub disposition: Disposition,
}
pub async fn stripe_webhook(
    Extension(dispatcher): Extension<Arc<EventDispatcher>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let outcome = dispatcher.dispatch(&body, signature).await?;
    Ok(Json(WebhookAck {
        received: true,
        disposition: outcome.disposition,
    }))
}
