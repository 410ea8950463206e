use axum::{extract::Extension, Json};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

use crate::billing::{BillingService, PlanTier};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

/// Calendar-month key scoping a usage counter, e.g. `2026-08`.
pub fn period_key(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

/// First instant of the following month, when counters roll over.
pub fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month is always valid")
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub questions_used: i32,
    pub questions_limit: i32,
    pub can_ask_more: bool,
}

/// Admission check and increment for one metered question. The
/// check-and-increment is a single conditional UPDATE so that concurrent
/// requests can never push the counter past the limit.
pub async fn record_usage(
    pool: &PgPool,
    config: &AppConfig,
    user_id: i32,
) -> AppResult<UsageSnapshot> {
    let period = period_key(Utc::now());
    ensure_record(pool, config, user_id, &period).await?;

    let row = sqlx::query(
        r#"
        UPDATE usage_records
        SET questions_used = questions_used + 1
        WHERE user_id = $1 AND period = $2 AND questions_used < questions_limit
        RETURNING questions_used, questions_limit
        "#,
    )
    .bind(user_id)
    .bind(&period)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let used: i32 = row.get("questions_used");
            let limit: i32 = row.get("questions_limit");
            Ok(UsageSnapshot {
                questions_used: used,
                questions_limit: limit,
                can_ask_more: used < limit,
            })
        }
        None => {
            let row = sqlx::query(
                "SELECT questions_used, questions_limit FROM usage_records WHERE user_id = $1 AND period = $2",
            )
            .bind(user_id)
            .bind(&period)
            .fetch_one(pool)
            .await?;
            Err(AppError::UsageLimitExceeded {
                used: row.get("questions_used"),
                limit: row.get("questions_limit"),
            })
        }
    }
}

/// Lazily create the (user, period) record, snapshotting the limit from the
/// governing subscription's plan. Safe under concurrency: the unique key
/// absorbs duplicate creation attempts.
async fn ensure_record(
    pool: &PgPool,
    config: &AppConfig,
    user_id: i32,
    period: &str,
) -> AppResult<()> {
    let billing = BillingService::new(pool.clone());
    let tier = billing
        .governing_subscription(user_id)
        .await
        .map_err(|e| AppError::Message(e.to_string()))?
        .map(|subscription| subscription.tier())
        .unwrap_or(PlanTier::Free);

    sqlx::query(
        r#"
        INSERT INTO usage_records (id, user_id, period, questions_used, questions_limit)
        VALUES ($1, $2, $3, 0, $4)
        ON CONFLICT (user_id, period) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(period)
    .bind(config.question_limit_for(tier))
    .execute(pool)
    .await?;
    Ok(())
}

/// Rewrite the current period's limit after a plan change. The consumed count
/// is preserved; cancelling mid-period does not hand back quota.
pub async fn refresh_limit(pool: &PgPool, user_id: i32, new_limit: i32) -> AppResult<()> {
    let period = period_key(Utc::now());
    sqlx::query(
        "UPDATE usage_records SET questions_limit = $3 WHERE user_id = $1 AND period = $2",
    )
    .bind(user_id)
    .bind(&period)
    .bind(new_limit)
    .execute(pool)
    .await?;
    Ok(())
}

/// Seed fresh counters for a new period for every user with a governing
/// subscription. Idempotent: conflicts leave existing rows untouched, so a
/// re-run never clobbers counts already accumulated in the period.
pub async fn reset_all_usage(pool: &PgPool, config: &AppConfig, period: &str) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO usage_records (id, user_id, period, questions_used, questions_limit, last_reset_at)
        SELECT gen_random_uuid(), s.user_id, $1, 0,
               CASE WHEN s.plan = 'premium' THEN $2 ELSE $3 END,
               NOW()
        FROM subscriptions s
        WHERE s.status IN ('active', 'trialing', 'past_due')
        ON CONFLICT (user_id, period) DO NOTHING
        "#,
    )
    .bind(period)
    .bind(config.premium_question_limit)
    .bind(config.free_question_limit)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatus {
    pub questions_used: i32,
    pub questions_limit: i32,
    pub questions_remaining: i32,
    pub plan_type: String,
    pub next_reset: DateTime<Utc>,
}

pub async fn increment_usage(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    AuthUser { user }: AuthUser,
) -> AppResult<Json<UsageSnapshot>> {
    let snapshot = record_usage(&pool, &config, user.id).await?;
    Ok(Json(snapshot))
}

pub async fn usage_status(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    AuthUser { user }: AuthUser,
) -> AppResult<Json<UsageStatus>> {
    let now = Utc::now();
    let period = period_key(now);
    let billing = BillingService::new(pool.clone());
    let tier = billing
        .governing_subscription(user.id)
        .await
        .map_err(|e| AppError::Message(e.to_string()))?
        .map(|subscription| subscription.tier())
        .unwrap_or(PlanTier::Free);

    let row = sqlx::query(
        "SELECT questions_used, questions_limit FROM usage_records WHERE user_id = $1 AND period = $2",
    )
    .bind(user.id)
    .bind(&period)
    .fetch_optional(&pool)
    .await?;

    let (used, limit) = match row {
        Some(row) => (row.get("questions_used"), row.get("questions_limit")),
        None => (0, config.question_limit_for(tier)),
    };

    Ok(Json(UsageStatus {
        questions_used: used,
        questions_limit: limit,
        questions_remaining: (limit - used).max(0),
        plan_type: tier.as_str().to_string(),
        next_reset: next_reset(now),
    }))
}
