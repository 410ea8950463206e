use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use sqlx::PgPool;
use std::convert::Infallible;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::identity::User;
use crate::session;

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Required-auth extractor: resolves the bearer token to a live user row.
pub struct AuthUser {
    pub user: User,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AppError::SessionInvalid)?;
        let pool = parts
            .extensions
            .get::<PgPool>()
            .cloned()
            .ok_or_else(|| AppError::Message("database extension missing".into()))?;
        let config = parts
            .extensions
            .get::<Arc<AppConfig>>()
            .cloned()
            .ok_or_else(|| AppError::Message("config extension missing".into()))?;
        let user = session::verify_session(&pool, &config, &token).await?;
        Ok(AuthUser { user })
    }
}

/// Optional-auth extractor for routes shared by anonymous and signed-in
/// callers. Verification failure degrades to `Anonymous` instead of erroring,
/// so both kinds of caller flow through the same handler.
pub enum Identity {
    Anonymous,
    Authenticated(User),
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            return Ok(Identity::Anonymous);
        };
        let (Some(pool), Some(config)) = (
            parts.extensions.get::<PgPool>().cloned(),
            parts.extensions.get::<Arc<AppConfig>>().cloned(),
        ) else {
            return Ok(Identity::Anonymous);
        };
        match session::verify_session(&pool, &config, &token).await {
            Ok(user) => Ok(Identity::Authenticated(user)),
            Err(_) => Ok(Identity::Anonymous),
        }
    }
}
