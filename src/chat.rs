use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::warn;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::extractor::Identity;
use crate::usage;

/// POST /chat. Anonymous and signed-in callers share this path; only the
/// signed-in ones pass through the metering gate. The increment is charged on
/// attempt: an upstream failure after admission does not refund it, since the
/// upstream cost may already be incurred.
pub async fn completions(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    Extension(http): Extension<reqwest::Client>,
    identity: Identity,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    if let Identity::Authenticated(user) = &identity {
        usage::record_usage(&pool, &config, user.id).await?;
    }

    let mut request = http.post(&config.upstream_chat_url).json(&body);
    if let Some(key) = &config.upstream_api_key {
        request = request.bearer_auth(key);
    }

    let upstream = request.send().await.map_err(|err| {
        warn!(?err, "upstream chat call failed");
        AppError::BadGateway(err.to_string())
    })?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let payload: Value = upstream.json().await.map_err(|err| {
        warn!(?err, "upstream chat response unreadable");
        AppError::BadGateway(err.to_string())
    })?;

    Ok((status, Json(payload)).into_response())
}
