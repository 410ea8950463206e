use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::identity::User;

/// Distinguishes the short-lived bearer token from the longer-lived refresh
/// token. Both are signed with the same secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    Session,
    Refresh,
}

impl TokenClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenClass::Session => "session",
            TokenClass::Refresh => "refresh",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i32,
    class: String,
    iat: i64,
    exp: i64,
}

pub fn issue_session(config: &AppConfig, user_id: i32, class: TokenClass) -> AppResult<String> {
    let now = Utc::now();
    let ttl_hours = match class {
        TokenClass::Session => config.session_ttl_hours,
        TokenClass::Refresh => config.refresh_ttl_hours,
    };
    let claims = Claims {
        sub: user_id,
        class: class.as_str().to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(ttl_hours)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.session_secret.as_bytes()),
    )
    .map_err(|e| AppError::Message(format!("token encoding failed: {e}")))
}

/// Decode and validate a session token, then re-fetch the user row. The
/// re-fetch is what makes deactivation take effect immediately for every
/// outstanding token, with no revocation list.
pub async fn verify_session(pool: &PgPool, config: &AppConfig, token: &str) -> AppResult<User> {
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.session_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AppError::SessionExpired,
        _ => AppError::SessionInvalid,
    })?;

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(decoded.claims.sub)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::SessionInvalid)?;

    if !user.is_active {
        return Err(AppError::AccountInactive);
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_config(secret: &str) -> AppConfig {
        AppConfig {
            bind_address: "127.0.0.1".into(),
            bind_port: 0,
            database_url: String::new(),
            session_secret: secret.into(),
            session_ttl_hours: 24,
            refresh_ttl_hours: 720,
            free_question_limit: 50,
            premium_question_limit: 1000,
            identity_base_url: String::new(),
            billing_api_base: String::new(),
            billing_api_key: String::new(),
            billing_webhook_secret: String::new(),
            billing_premium_price: String::new(),
            checkout_success_url: String::new(),
            checkout_cancel_url: String::new(),
            upstream_chat_url: String::new(),
            upstream_api_key: None,
            rate_limit_per_minute: 60,
            allowed_origins: HashSet::new(),
            usage_reset_scan_interval_secs: 300,
            webhook_tolerance_secs: 300,
            http_timeout_secs: 10,
        }
    }

    #[test]
    fn issued_token_decodes_with_same_secret() {
        let config = test_config("secret-a");
        let token = issue_session(&config, 7, TokenClass::Session).unwrap();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"secret-a"),
            &Validation::default(),
        )
        .unwrap();
        assert_eq!(decoded.claims.sub, 7);
        assert_eq!(decoded.claims.class, "session");
    }

    #[test]
    fn token_signed_with_other_secret_fails() {
        let config = test_config("secret-a");
        let token = issue_session(&config, 7, TokenClass::Session).unwrap();
        let result = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"secret-b"),
            &Validation::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn refresh_tokens_carry_their_class() {
        let config = test_config("secret-a");
        let token = issue_session(&config, 3, TokenClass::Refresh).unwrap();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"secret-a"),
            &Validation::default(),
        )
        .unwrap();
        assert_eq!(decoded.claims.class, "refresh");
        assert!(decoded.claims.exp > decoded.claims.iat);
    }
}
