use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::usage;

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i32,
    pub email: String,
    pub display_name: Option<String>,
    pub provider_subject: Option<String>,
    pub avatar_url: Option<String>,
    pub is_active: bool,
    pub preferences: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Identity payload the client claims to hold. Always cross-checked against
/// what the provider actually verified before any row is touched.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedIdentity {
    pub subject: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedIdentity {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// Introspects externally-issued access tokens against the identity
/// provider's userinfo endpoint.
pub struct IdentityVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl IdentityVerifier {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Rejection, unreachability, timeout, and malformed responses all
    /// collapse into `CredentialInvalid`: the caller learns nothing about
    /// which one it was.
    pub async fn verify(&self, access_token: &str) -> AppResult<VerifiedIdentity> {
        let response = self
            .client
            .get(format!("{}/oauth2/v3/userinfo", self.base_url))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| {
                warn!(?err, "identity provider unreachable");
                AppError::CredentialInvalid
            })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "identity provider rejected credential");
            return Err(AppError::CredentialInvalid);
        }

        response.json::<VerifiedIdentity>().await.map_err(|err| {
            warn!(?err, "identity provider returned malformed body");
            AppError::CredentialInvalid
        })
    }
}

/// Verify an external credential, cross-check the claimed identity, and
/// create-or-update the local user. New users get their default free
/// subscription and current-period usage record in the same transaction, so a
/// half-created account is never observable.
pub async fn bind_identity(
    pool: &PgPool,
    verifier: &IdentityVerifier,
    config: &AppConfig,
    access_token: &str,
    claimed: &ClaimedIdentity,
) -> AppResult<(User, bool)> {
    if access_token.is_empty() {
        return Err(AppError::Validation("accessToken is required".into()));
    }
    if claimed.subject.is_empty() || claimed.email.is_empty() {
        return Err(AppError::Validation(
            "profile.subject and profile.email are required".into(),
        ));
    }

    let verified = match verifier.verify(access_token).await {
        Ok(verified) => verified,
        Err(err) => {
            info!(outcome = "failure", subject = %claimed.subject, "auth attempt");
            return Err(err);
        }
    };

    if verified.sub != claimed.subject {
        // Possible forged claims rather than a stale token; higher severity.
        warn!(
            security = "identity_spoof_suspected",
            claimed_subject = %claimed.subject,
            verified_subject = %verified.sub,
            "claimed subject does not match provider-verified subject"
        );
        return Err(AppError::IdentitySpoofSuspected);
    }

    let email = verified.email.as_deref().unwrap_or(&claimed.email);
    let display_name = verified.name.as_deref().or(claimed.name.as_deref());
    let avatar_url = verified.picture.as_deref().or(claimed.picture.as_deref());

    let by_subject = sqlx::query_as::<_, User>("SELECT * FROM users WHERE provider_subject = $1")
        .bind(&verified.sub)
        .fetch_optional(pool)
        .await?;
    let by_email = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(pool)
        .await?;

    if let (Some(subject_row), Some(email_row)) = (&by_subject, &by_email) {
        if subject_row.id != email_row.id {
            tracing::error!(
                subject_user = subject_row.id,
                email_user = email_row.id,
                "provider subject and email resolve to different users"
            );
            return Err(AppError::Message(
                "identity records are inconsistent".into(),
            ));
        }
    }

    let existing = by_subject.or(by_email);
    let (user, is_new) = match existing {
        Some(user) => {
            let user = sqlx::query_as::<_, User>(
                r#"
                UPDATE users SET
                    provider_subject = $2,
                    display_name = COALESCE($3, display_name),
                    avatar_url = COALESCE($4, avatar_url),
                    last_login_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(user.id)
            .bind(&verified.sub)
            .bind(display_name)
            .bind(avatar_url)
            .fetch_one(pool)
            .await?;
            (user, false)
        }
        None => {
            let mut tx = pool.begin().await?;
            let user = sqlx::query_as::<_, User>(
                r#"
                INSERT INTO users (email, display_name, provider_subject, avatar_url, last_login_at)
                VALUES ($1, $2, $3, $4, NOW())
                RETURNING *
                "#,
            )
            .bind(email)
            .bind(display_name)
            .bind(&verified.sub)
            .bind(avatar_url)
            .fetch_one(&mut tx)
            .await?;

            sqlx::query(
                "INSERT INTO subscriptions (id, user_id, plan, status) VALUES ($1, $2, 'free', 'active')",
            )
            .bind(Uuid::new_v4())
            .bind(user.id)
            .execute(&mut tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO usage_records (id, user_id, period, questions_used, questions_limit)
                VALUES ($1, $2, $3, 0, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user.id)
            .bind(usage::period_key(Utc::now()))
            .bind(config.free_question_limit)
            .execute(&mut tx)
            .await?;

            tx.commit().await?;
            (user, true)
        }
    };

    info!(
        outcome = "success",
        user_id = user.id,
        new_user = is_new,
        "auth attempt"
    );
    Ok((user, is_new))
}
