mod common;

use askgate::error::AppError;
use askgate::identity::{bind_identity, ClaimedIdentity, IdentityVerifier};
use httpmock::prelude::*;
use serde_json::json;
use sqlx::{PgPool, Row};

fn claimed(subject: &str, email: &str) -> ClaimedIdentity {
    ClaimedIdentity {
        subject: subject.to_string(),
        email: email.to_string(),
        name: Some("Ada Lovelace".to_string()),
        picture: Some("https://cdn.test/avatar.png".to_string()),
    }
}

fn verifier_for(server: &MockServer) -> IdentityVerifier {
    IdentityVerifier::new(reqwest::Client::new(), &server.base_url())
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn first_bind_creates_user_subscription_and_usage(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET)
            .path("/oauth2/v3/userinfo")
            .header("authorization", "Bearer tok_valid");
        then.status(200).json_body(json!({
            "sub": "S1",
            "email": "a@x.com",
            "name": "Ada Lovelace",
            "picture": "https://cdn.test/avatar.png",
        }));
    });

    let config = common::test_config();
    let (user, is_new) = bind_identity(
        &pool,
        &verifier_for(&server),
        &config,
        "tok_valid",
        &claimed("S1", "a@x.com"),
    )
    .await
    .unwrap();

    assert!(is_new);
    assert_eq!(user.email, "a@x.com");
    assert_eq!(user.provider_subject.as_deref(), Some("S1"));
    assert!(user.is_active);

    let sub = sqlx::query("SELECT plan, status FROM subscriptions WHERE user_id = $1")
        .bind(user.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(sub.get::<String, _>("plan"), "free");
    assert_eq!(sub.get::<String, _>("status"), "active");

    let usage =
        sqlx::query("SELECT questions_used, questions_limit FROM usage_records WHERE user_id = $1")
            .bind(user.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(usage.get::<i32, _>("questions_used"), 0);
    assert_eq!(usage.get::<i32, _>("questions_limit"), 50);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn repeat_bind_updates_profile_without_new_rows(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/oauth2/v3/userinfo");
        then.status(200).json_body(json!({
            "sub": "S1",
            "email": "a@x.com",
            "name": "Ada L.",
        }));
    });

    let config = common::test_config();
    let verifier = verifier_for(&server);
    let (first, is_new) = bind_identity(&pool, &verifier, &config, "tok", &claimed("S1", "a@x.com"))
        .await
        .unwrap();
    assert!(is_new);

    let (second, is_new) =
        bind_identity(&pool, &verifier, &config, "tok", &claimed("S1", "a@x.com"))
            .await
            .unwrap();
    assert!(!is_new);
    assert_eq!(first.id, second.id);
    assert_eq!(second.display_name.as_deref(), Some("Ada L."));
    assert!(second.last_login_at.is_some());

    let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(users, 1);
    let subs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(subs, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn subject_mismatch_is_treated_as_spoof(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/oauth2/v3/userinfo");
        then.status(200)
            .json_body(json!({ "sub": "S2", "email": "a@x.com" }));
    });

    let config = common::test_config();
    let err = bind_identity(
        &pool,
        &verifier_for(&server),
        &config,
        "tok",
        &claimed("S1", "a@x.com"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::IdentitySpoofSuspected));

    let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(users, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn provider_rejection_is_one_opaque_error_kind(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/oauth2/v3/userinfo");
        then.status(401).json_body(json!({ "error": "invalid_token" }));
    });

    let config = common::test_config();
    let err = bind_identity(
        &pool,
        &verifier_for(&server),
        &config,
        "tok_expired",
        &claimed("S1", "a@x.com"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::CredentialInvalid));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn conflicting_subject_and_email_rows_are_surfaced(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    common::seed_user(&pool, "b@x.com", "S1").await;
    common::seed_user(&pool, "a@x.com", "S9").await;

    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/oauth2/v3/userinfo");
        then.status(200)
            .json_body(json!({ "sub": "S1", "email": "a@x.com" }));
    });

    let config = common::test_config();
    let err = bind_identity(
        &pool,
        &verifier_for(&server),
        &config,
        "tok",
        &claimed("S1", "a@x.com"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Message(_)));
}
