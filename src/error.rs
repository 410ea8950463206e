use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("validation error: {0}")]
    Validation(String),
    /// External credential rejected, expired, malformed, or the provider was
    /// unreachable. Deliberately a single kind: callers must not be able to
    /// distinguish an expired token from a forged one.
    #[error("authentication failed")]
    CredentialInvalid,
    /// Claimed subject id did not match the provider-verified subject.
    #[error("authentication failed")]
    IdentitySpoofSuspected,
    #[error("session expired")]
    SessionExpired,
    #[error("session invalid")]
    SessionInvalid,
    #[error("account is deactivated")]
    AccountInactive,
    #[error("monthly question limit reached")]
    UsageLimitExceeded { used: i32, limit: i32 },
    #[error("user not found")]
    UserNotFound,
    #[error("no active subscription found")]
    SubscriptionNotFound,
    #[error("invalid webhook signature")]
    WebhookSignatureInvalid,
    #[error("payment provider error")]
    PaymentFailed(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("upstream error")]
    BadGateway(String),
    #[error("{0}")]
    Message(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::WebhookSignatureInvalid => {
                StatusCode::BAD_REQUEST
            }
            AppError::CredentialInvalid
            | AppError::IdentitySpoofSuspected
            | AppError::SessionExpired
            | AppError::SessionInvalid
            | AppError::AccountInactive => StatusCode::UNAUTHORIZED,
            AppError::UsageLimitExceeded { .. } => StatusCode::FORBIDDEN,
            AppError::UserNotFound | AppError::SubscriptionNotFound => StatusCode::NOT_FOUND,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Db(_) | AppError::PaymentFailed(_) | AppError::Message(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::CredentialInvalid | AppError::IdentitySpoofSuspected => "AUTH_FAILED",
            AppError::SessionExpired => "SESSION_EXPIRED",
            AppError::SessionInvalid => "SESSION_INVALID",
            AppError::AccountInactive => "ACCOUNT_INACTIVE",
            AppError::UsageLimitExceeded { .. } => "USAGE_LIMIT_EXCEEDED",
            AppError::UserNotFound => "USER_NOT_FOUND",
            AppError::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
            AppError::WebhookSignatureInvalid => "WEBHOOK_SIGNATURE_INVALID",
            AppError::PaymentFailed(_) => "PAYMENT_FAILED",
            AppError::RateLimited => "RATE_LIMITED",
            AppError::BadGateway(_) => "BAD_GATEWAY",
            AppError::Db(_) | AppError::Message(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to return to callers. Internal detail stays in the logs.
    fn public_message(&self) -> String {
        match self {
            AppError::Db(_) | AppError::Message(_) => "internal error".to_string(),
            AppError::PaymentFailed(_) => "payment provider error".to_string(),
            AppError::BadGateway(_) => "upstream error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self, "request failed");
        }
        let mut error = json!({
            "code": self.code(),
            "message": self.public_message(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let AppError::UsageLimitExceeded { used, limit } = &self {
            error["questionsUsed"] = json!(used);
            error["questionsLimit"] = json!(limit);
            error["upgradeUrl"] = json!("/subscriptions/create-checkout-session");
        }
        (status, Json(json!({ "error": error }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spoof_and_invalid_share_a_public_code() {
        assert_eq!(AppError::CredentialInvalid.code(), "AUTH_FAILED");
        assert_eq!(AppError::IdentitySpoofSuspected.code(), "AUTH_FAILED");
    }

    #[test]
    fn internal_detail_is_elided() {
        let err = AppError::Message("secret connection string".into());
        assert_eq!(err.public_message(), "internal error");
        let err = AppError::PaymentFailed("provider said: card_declined cus_123".into());
        assert_eq!(err.public_message(), "payment provider error");
    }

    #[test]
    fn usage_limit_maps_to_forbidden() {
        let err = AppError::UsageLimitExceeded { used: 50, limit: 50 };
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.code(), "USAGE_LIMIT_EXCEEDED");
    }
}
