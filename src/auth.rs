use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;

use crate::billing::{BillingService, Subscription};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::identity::{bind_identity, ClaimedIdentity, IdentityVerifier, User};
use crate::session::{issue_session, TokenClass};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigninRequest {
    pub access_token: String,
    pub profile: ClaimedIdentity,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SigninResponse {
    pub token: String,
    pub refresh_token: String,
    pub user: User,
    pub subscription: Option<Subscription>,
    pub is_new_user: bool,
}

/// POST /auth/signin. Verifies the external credential, binds the local
/// identity, and mints this service's own session pair.
pub async fn signin(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    Extension(verifier): Extension<Arc<IdentityVerifier>>,
    Json(payload): Json<SigninRequest>,
) -> AppResult<Json<SigninResponse>> {
    let (user, is_new_user) = bind_identity(
        &pool,
        &verifier,
        &config,
        &payload.access_token,
        &payload.profile,
    )
    .await?;

    let token = issue_session(&config, user.id, TokenClass::Session)?;
    let refresh_token = issue_session(&config, user.id, TokenClass::Refresh)?;
    let subscription = BillingService::new(pool.clone())
        .governing_subscription(user.id)
        .await
        .map_err(|e| AppError::Message(e.to_string()))?;

    Ok(Json(SigninResponse {
        token,
        refresh_token,
        user,
        subscription,
        is_new_user,
    }))
}

#[derive(Serialize)]
pub struct SignoutResponse {
    pub message: &'static str,
}

/// POST /auth/signout. Tokens are stateless; the handler exists so clients
/// have a uniform endpoint to call when discarding theirs.
pub async fn signout(AuthUser { user }: AuthUser) -> Json<SignoutResponse> {
    tracing::info!(user_id = user.id, "user signed out");
    Json(SignoutResponse {
        message: "signed out",
    })
}

#[derive(Serialize)]
pub struct ProfileResponse {
    pub user: User,
    pub subscription: Option<Subscription>,
}

pub async fn profile(
    Extension(pool): Extension<PgPool>,
    AuthUser { user }: AuthUser,
) -> AppResult<Json<ProfileResponse>> {
    let subscription = BillingService::new(pool)
        .governing_subscription(user.id)
        .await
        .map_err(|e| AppError::Message(e.to_string()))?;
    Ok(Json(ProfileResponse { user, subscription }))
}
