pub mod defaults;
pub mod models;
pub mod provisioning;

use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, routing::post, Json, Router};

pub use defaults::OrganizationDefaults;
pub use models::{NewOrganization, NewUser, Organization, User, UserRole};
pub use provisioning::{derive_slug, ProvisioningService, SignupRequest, SignupResponse};

use crate::error::AppResult;

pub fn routes() -> Router {
    Router::new().route("/api/signup", post(signup))
}

pub async fn signup(
    Extension(provisioning): Extension<Arc<ProvisioningService>>,
    Json(payload): Json<SignupRequest>,
) -> AppResult<(StatusCode, Json<SignupResponse>)> {
    let created = provisioning.provision(payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}
