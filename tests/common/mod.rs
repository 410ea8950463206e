use std::collections::HashSet;

use askgate::config::AppConfig;

/// Config fixture pointing all external collaborators at test-controlled
/// URLs. Individual tests override the endpoints they exercise.
pub fn test_config() -> AppConfig {
    AppConfig {
        bind_address: "127.0.0.1".into(),
        bind_port: 0,
        database_url: String::new(),
        session_secret: "test-session-secret".into(),
        session_ttl_hours: 24,
        refresh_ttl_hours: 720,
        free_question_limit: 50,
        premium_question_limit: 1000,
        identity_base_url: "http://127.0.0.1:1".into(),
        billing_api_base: "http://127.0.0.1:1".into(),
        billing_api_key: "sk_test".into(),
        billing_webhook_secret: "whsec_test".into(),
        billing_premium_price: "price_premium_monthly".into(),
        checkout_success_url: "https://askgate.test/success".into(),
        checkout_cancel_url: "https://askgate.test/cancel".into(),
        upstream_chat_url: "http://127.0.0.1:1/v1/chat".into(),
        upstream_api_key: None,
        rate_limit_per_minute: 60,
        allowed_origins: HashSet::new(),
        usage_reset_scan_interval_secs: 300,
        webhook_tolerance_secs: 300,
        http_timeout_secs: 5,
    }
}

/// Insert a user row and return its id.
pub async fn seed_user(pool: &sqlx::PgPool, email: &str, subject: &str) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO users (email, provider_subject) VALUES ($1, $2) RETURNING id",
    )
    .bind(email)
    .bind(subject)
    .fetch_one(pool)
    .await
    .unwrap()
}

/// Insert a governing subscription row for a user.
pub async fn seed_subscription(
    pool: &sqlx::PgPool,
    user_id: i32,
    plan: &str,
    status: &str,
    external_id: Option<&str>,
) -> uuid::Uuid {
    let id = uuid::Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO subscriptions (id, user_id, plan, status, billing_customer_id, billing_subscription_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(id)
    .bind(user_id)
    .bind(plan)
    .bind(status)
    .bind(external_id.map(|_| "cus_seeded"))
    .bind(external_id)
    .execute(pool)
    .await
    .unwrap();
    id
}

/// Insert a usage record with the given counters for the current period.
pub async fn seed_usage(pool: &sqlx::PgPool, user_id: i32, used: i32, limit: i32) -> String {
    let period = askgate::usage::period_key(chrono::Utc::now());
    sqlx::query(
        r#"
        INSERT INTO usage_records (id, user_id, period, questions_used, questions_limit)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(uuid::Uuid::new_v4())
    .bind(user_id)
    .bind(&period)
    .bind(used)
    .bind(limit)
    .execute(pool)
    .await
    .unwrap();
    period
}
