use axum::{body::Bytes, extract::Extension, http::HeaderMap, Json};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::models::{PlanTier, SubscriptionStatus};
use super::provider::BillingProvider;
use super::service::{BillingService, SubscriptionPatch};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::usage;

pub const SIGNATURE_HEADER: &str = "billing-signature";

type HmacSha256 = Hmac<Sha256>;

/// Compose the `t=<unix>,v1=<hex>` header value for a payload. Counterpart of
/// `verify_signature`; also used to build fixtures in tests.
pub fn signature_header(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify the shared-secret HMAC over `"{t}.{body}"`. This is the sole
/// authentication on the webhook endpoint and runs before any payload parse.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<(), AppError> {
    let mut timestamp: Option<i64> = None;
    let mut signature: Option<Vec<u8>> = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", raw)) => timestamp = raw.parse().ok(),
            Some(("v1", raw)) => signature = hex::decode(raw).ok(),
            _ => {}
        }
    }
    let (timestamp, signature) = match (timestamp, signature) {
        (Some(t), Some(sig)) => (t, sig),
        _ => return Err(AppError::WebhookSignatureInvalid),
    };

    let age = (now.timestamp() - timestamp).abs();
    if age > tolerance_secs {
        return Err(AppError::WebhookSignatureInvalid);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| AppError::WebhookSignatureInvalid)
}

/// key: billing-webhook -> provider event intake
///
/// The provider's open-ended payload is decoded exactly once at this boundary
/// into a closed set of event kinds; handlers never re-inspect raw JSON.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    PaymentSucceeded(InvoiceObject),
    PaymentFailed(InvoiceObject),
    CheckoutCompleted(CheckoutObject),
    Unrecognized { kind: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default)]
    pub trial_end: Option<i64>,
}

impl SubscriptionObject {
    fn to_patch(&self) -> SubscriptionPatch {
        SubscriptionPatch {
            billing_customer_id: Some(self.customer.clone()),
            billing_subscription_id: Some(self.id.clone()),
            status: self.status.clone(),
            current_period_start: self.current_period_start.and_then(unix_ts),
            current_period_end: self.current_period_end.and_then(unix_ts),
            cancel_at_period_end: self.cancel_at_period_end,
            trial_ends_at: self.trial_end.and_then(unix_ts),
        }
    }

    /// Only `active`/`trialing` are mirrored on promotion; anything else the
    /// provider reports at creation time collapses to `active`.
    fn promotion_status(&self) -> &'static str {
        match self.status.as_deref() {
            Some("trialing") => "trialing",
            _ => "active",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
}

impl BillingEvent {
    pub fn decode(payload: &Value) -> Result<BillingEvent, AppError> {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("event type missing".into()))?;
        let object = payload
            .get("data")
            .and_then(|data| data.get("object"))
            .cloned()
            .unwrap_or(Value::Null);

        let malformed =
            |e: serde_json::Error| AppError::Validation(format!("malformed {kind} event: {e}"));

        Ok(match kind {
            "subscription.created" => {
                BillingEvent::SubscriptionCreated(serde_json::from_value(object).map_err(malformed)?)
            }
            "subscription.updated" => {
                BillingEvent::SubscriptionUpdated(serde_json::from_value(object).map_err(malformed)?)
            }
            "subscription.deleted" => {
                BillingEvent::SubscriptionDeleted(serde_json::from_value(object).map_err(malformed)?)
            }
            "invoice.payment_succeeded" => {
                BillingEvent::PaymentSucceeded(serde_json::from_value(object).map_err(malformed)?)
            }
            "invoice.payment_failed" => {
                BillingEvent::PaymentFailed(serde_json::from_value(object).map_err(malformed)?)
            }
            "checkout.completed" => {
                BillingEvent::CheckoutCompleted(serde_json::from_value(object).map_err(malformed)?)
            }
            other => BillingEvent::Unrecognized {
                kind: other.to_string(),
            },
        })
    }
}

fn unix_ts(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Resolve the local owner of a provider customer through the authoritative
/// customer object, never through payload metadata alone. `None` means the
/// mapping is missing and retrying cannot help: callers acknowledge receipt.
async fn resolve_owner(
    provider: &Arc<dyn BillingProvider>,
    customer_id: Option<&str>,
    event_kind: &str,
) -> Option<i32> {
    let customer_id = match customer_id {
        Some(id) => id,
        None => {
            warn!(event = event_kind, "owner resolution failed: event carries no customer id");
            return None;
        }
    };
    match provider.fetch_customer(customer_id).await {
        Ok(customer) => match customer.user_id() {
            Some(user_id) => Some(user_id),
            None => {
                warn!(
                    event = event_kind,
                    customer = customer_id,
                    "owner resolution failed: customer has no user binding"
                );
                None
            }
        },
        Err(err) => {
            warn!(
                ?err,
                event = event_kind,
                customer = customer_id,
                "owner resolution failed: customer fetch error"
            );
            None
        }
    }
}

/// POST /webhooks/billing. Signature first, decode once, then dispatch.
/// Unknown events and unresolvable owners are acknowledged so the provider
/// stops retrying; genuine handler failures propagate as 5xx so it retries.
pub async fn billing_webhook(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    Extension(provider): Extension<Arc<dyn BillingProvider>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::WebhookSignatureInvalid)?;
    verify_signature(
        &config.billing_webhook_secret,
        header,
        &body,
        Utc::now(),
        config.webhook_tolerance_secs,
    )?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("malformed webhook body: {e}")))?;
    let event = BillingEvent::decode(&payload)?;
    dispatch(&pool, &config, &provider, event).await?;

    Ok(Json(json!({ "received": true })))
}

async fn dispatch(
    pool: &PgPool,
    config: &AppConfig,
    provider: &Arc<dyn BillingProvider>,
    event: BillingEvent,
) -> AppResult<()> {
    let service = BillingService::new(pool.clone());
    match event {
        BillingEvent::SubscriptionCreated(object) => {
            let Some(user_id) =
                resolve_owner(provider, Some(&object.customer), "subscription.created").await
            else {
                return Ok(());
            };
            let mut patch = object.to_patch();
            patch.status = Some(object.promotion_status().to_string());
            service
                .promote_from_event(user_id, PlanTier::Premium, &patch)
                .await
                .map_err(|e| AppError::Message(e.to_string()))?;
            usage::refresh_limit(pool, user_id, config.premium_question_limit).await?;
            info!(user_id, subscription = %object.id, "subscription activated");
        }
        BillingEvent::CheckoutCompleted(object) => {
            let Some(user_id) =
                resolve_owner(provider, object.customer.as_deref(), "checkout.completed").await
            else {
                return Ok(());
            };
            let patch = SubscriptionPatch {
                billing_customer_id: object.customer.clone(),
                billing_subscription_id: object.subscription.clone(),
                status: Some("active".to_string()),
                ..Default::default()
            };
            service
                .promote_from_event(user_id, PlanTier::Premium, &patch)
                .await
                .map_err(|e| AppError::Message(e.to_string()))?;
            usage::refresh_limit(pool, user_id, config.premium_question_limit).await?;
            info!(user_id, session = %object.id, "checkout completed");
        }
        BillingEvent::SubscriptionUpdated(object) => {
            let owner =
                resolve_owner(provider, Some(&object.customer), "subscription.updated").await;
            let updated = service
                .update_from_event(owner, &object.to_patch())
                .await
                .map_err(|e| AppError::Message(e.to_string()))?;
            match updated {
                Some(subscription) => info!(
                    user_id = subscription.user_id,
                    subscription = %object.id,
                    status = %subscription.status,
                    "subscription updated"
                ),
                None => warn!(
                    subscription = %object.id,
                    "update event matched no local subscription"
                ),
            }
        }
        BillingEvent::SubscriptionDeleted(object) => {
            let owner =
                resolve_owner(provider, Some(&object.customer), "subscription.deleted").await;
            let cancelled = service
                .transition_status(Some(&object.id), owner, SubscriptionStatus::Cancelled)
                .await
                .map_err(|e| AppError::Message(e.to_string()))?;
            let user_id = cancelled.as_ref().map(|s| s.user_id).or(owner);
            if let Some(user_id) = user_id {
                usage::refresh_limit(pool, user_id, config.free_question_limit).await?;
                info!(user_id, subscription = %object.id, "subscription cancelled");
            } else {
                warn!(subscription = %object.id, "delete event matched no local subscription");
            }
        }
        BillingEvent::PaymentSucceeded(object) => {
            let owner =
                resolve_owner(provider, object.customer.as_deref(), "invoice.payment_succeeded")
                    .await;
            service
                .transition_status(
                    object.subscription.as_deref(),
                    owner,
                    SubscriptionStatus::Active,
                )
                .await
                .map_err(|e| AppError::Message(e.to_string()))?;
        }
        BillingEvent::PaymentFailed(object) => {
            // Grace handling is a config concern; the limit is not demoted here.
            let owner =
                resolve_owner(provider, object.customer.as_deref(), "invoice.payment_failed")
                    .await;
            let transitioned = service
                .transition_status(
                    object.subscription.as_deref(),
                    owner,
                    SubscriptionStatus::PastDue,
                )
                .await
                .map_err(|e| AppError::Message(e.to_string()))?;
            if let Some(subscription) = transitioned {
                error!(
                    user_id = subscription.user_id,
                    subscription = ?object.subscription,
                    "payment failed, subscription past_due"
                );
            }
        }
        BillingEvent::Unrecognized { kind } => {
            info!(event = %kind, "ignoring unrecognized billing event");
        }
    }
    Ok(())
}
