mod common;

use askgate::billing::scheduler::process_tick;
use chrono::Utc;
use sqlx::PgPool;

// key: usage-scheduler-tests -> rollover seeding,idempotence
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn tick_seeds_counters_for_governing_subscriptions_only(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let config = common::test_config();

    let active = common::seed_user(&pool, "active@x.com", "S60").await;
    common::seed_subscription(&pool, active, "premium", "active", Some("sub_a")).await;
    let trialing = common::seed_user(&pool, "trial@x.com", "S61").await;
    common::seed_subscription(&pool, trialing, "premium", "trialing", Some("sub_t")).await;
    let cancelled = common::seed_user(&pool, "gone@x.com", "S62").await;
    common::seed_subscription(&pool, cancelled, "premium", "cancelled", Some("sub_c")).await;

    let seeded = process_tick(&pool, &config, Utc::now()).await.unwrap();
    assert_eq!(seeded, 2);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_records")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 2);
    let cancelled_rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM usage_records WHERE user_id = $1")
            .bind(cancelled)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(cancelled_rows, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn rerunning_a_tick_preserves_accrued_counts(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let config = common::test_config();
    let user_id = common::seed_user(&pool, "accrued@x.com", "S63").await;
    common::seed_subscription(&pool, user_id, "free", "active", None).await;

    let now = Utc::now();
    assert_eq!(process_tick(&pool, &config, now).await.unwrap(), 1);

    sqlx::query("UPDATE usage_records SET questions_used = 12 WHERE user_id = $1")
        .bind(user_id)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(process_tick(&pool, &config, now).await.unwrap(), 0);

    let used: i32 =
        sqlx::query_scalar("SELECT questions_used FROM usage_records WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(used, 12);
}
