use axum::{
    routing::{get, post},
    Router,
};

use crate::{auth, billing, chat, usage};

pub fn api_routes() -> Router {
    Router::new()
        .route("/auth/signin", post(auth::signin))
        .route("/auth/signout", post(auth::signout))
        .route("/auth/profile", get(auth::profile))
        .route("/usage/increment", post(usage::increment_usage))
        .route("/usage/status", get(usage::usage_status))
        .route(
            "/subscriptions/create-checkout-session",
            post(billing::create_checkout_session),
        )
        .route("/subscriptions/cancel", post(billing::cancel_subscription))
        .route("/subscriptions/status", get(billing::subscription_status))
        .route("/webhooks/billing", post(billing::billing_webhook))
        .route("/chat", post(chat::completions))
}
