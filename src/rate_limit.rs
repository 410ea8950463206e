use axum::{
    http::{header::ORIGIN, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::AppError;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Per-client admission gate sitting ahead of every route. Keys on the
/// first `X-Forwarded-For` hop; requests from an allowlisted origin (the
/// extension's own origins) bypass the throttle.
#[derive(Clone)]
pub struct RateLimitGate {
    limiter: Arc<KeyedLimiter>,
    allowed_origins: Arc<HashSet<String>>,
}

impl RateLimitGate {
    pub fn new(config: &AppConfig) -> Self {
        let per_minute =
            NonZeroU32::new(config.rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
            allowed_origins: Arc::new(config.allowed_origins.clone()),
        }
    }

    pub fn admit(&self, origin: Option<&str>, client_key: &str) -> Result<(), AppError> {
        if let Some(origin) = origin {
            if self.allowed_origins.contains(origin) {
                return Ok(());
            }
        }
        self.limiter
            .check_key(&client_key.to_string())
            .map_err(|_| AppError::RateLimited)
    }
}

fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|hop| hop.trim().to_string())
        .filter(|hop| !hop.is_empty())
        .unwrap_or_else(|| "direct".to_string())
}

pub async fn throttle<B>(request: Request<B>, next: Next<B>) -> Result<Response, AppError>
where
    B: Send,
{
    if let Some(gate) = request.extensions().get::<RateLimitGate>() {
        let origin = request
            .headers()
            .get(ORIGIN)
            .and_then(|value| value.to_str().ok());
        gate.admit(origin, &client_key(request.headers()))?;
    }
    Ok(next.run(request).await)
}
