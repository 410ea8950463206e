use axum::{extract::Extension, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::provider::BillingProvider;
use super::service::BillingService;
use super::Subscription;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

/// key: billing-api -> checkout and cancellation endpoints
///
/// Neither endpoint mutates plan or status directly: completion of a checkout
/// or a cancellation is only ever confirmed by the provider's webhook.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSessionResponse {
    pub session_id: String,
}

pub async fn create_checkout_session(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    Extension(provider): Extension<Arc<dyn BillingProvider>>,
    AuthUser { user }: AuthUser,
) -> AppResult<Json<CheckoutSessionResponse>> {
    if config.billing_premium_price.is_empty() {
        return Err(AppError::PaymentFailed("no premium price configured".into()));
    }

    let service = BillingService::new(pool);
    let governing = service
        .governing_subscription(user.id)
        .await
        .map_err(|e| AppError::Message(e.to_string()))?;

    let customer_id = match governing.and_then(|s| s.billing_customer_id) {
        Some(id) => id,
        None => {
            let id = provider
                .create_customer(user.id, &user.email)
                .await
                .map_err(|e| {
                    error!(?e, user_id = user.id, "customer provisioning failed");
                    AppError::PaymentFailed(e.to_string())
                })?;
            service
                .attach_billing_customer(user.id, &id)
                .await
                .map_err(|e| AppError::Message(e.to_string()))?;
            id
        }
    };

    let session_id = provider
        .create_checkout_session(
            &customer_id,
            user.id,
            &config.billing_premium_price,
            &config.checkout_success_url,
            &config.checkout_cancel_url,
        )
        .await
        .map_err(|e| {
            error!(?e, user_id = user.id, "checkout session creation failed");
            AppError::PaymentFailed(e.to_string())
        })?;

    Ok(Json(CheckoutSessionResponse { session_id }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub success: bool,
    pub cancel_at: Option<DateTime<Utc>>,
}

pub async fn cancel_subscription(
    Extension(pool): Extension<PgPool>,
    Extension(provider): Extension<Arc<dyn BillingProvider>>,
    AuthUser { user }: AuthUser,
) -> AppResult<Json<CancelResponse>> {
    let service = BillingService::new(pool);
    let governing = service
        .governing_subscription(user.id)
        .await
        .map_err(|e| AppError::Message(e.to_string()))?
        .ok_or(AppError::SubscriptionNotFound)?;

    let external_id = governing
        .billing_subscription_id
        .as_deref()
        .ok_or(AppError::SubscriptionNotFound)?;

    let outcome = provider.cancel_at_period_end(external_id).await.map_err(|e| {
        error!(?e, user_id = user.id, "provider cancellation failed");
        AppError::PaymentFailed(e.to_string())
    })?;

    service
        .mark_cancel_requested(governing.id)
        .await
        .map_err(|e| AppError::Message(e.to_string()))?;

    Ok(Json(CancelResponse {
        success: outcome.cancel_at_period_end,
        cancel_at: outcome.cancel_at.or(governing.current_period_end),
    }))
}

#[derive(Serialize)]
pub struct SubscriptionStatusResponse {
    pub subscription: Option<Subscription>,
}

pub async fn subscription_status(
    Extension(pool): Extension<PgPool>,
    AuthUser { user }: AuthUser,
) -> AppResult<Json<SubscriptionStatusResponse>> {
    let subscription = BillingService::new(pool)
        .governing_subscription(user.id)
        .await
        .map_err(|e| AppError::Message(e.to_string()))?;
    Ok(Json(SubscriptionStatusResponse { subscription }))
}
