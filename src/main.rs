use axum::{middleware, routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use askgate::billing::{spawn_usage_scheduler, BillingProvider, HttpBillingProvider};
use askgate::config::AppConfig;
use askgate::identity::IdentityVerifier;
use askgate::rate_limit::{self, RateLimitGate};
use askgate::routes::api_routes;

async fn root() -> &'static str {
    "askgate API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let config = Arc::new(AppConfig::from_env()?);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()?;
    let verifier = Arc::new(IdentityVerifier::new(
        http.clone(),
        &config.identity_base_url,
    ));
    let billing_provider: Arc<dyn BillingProvider> = Arc::new(HttpBillingProvider::new(
        http.clone(),
        &config.billing_api_base,
        &config.billing_api_key,
    ));

    spawn_usage_scheduler(pool.clone(), config.clone());

    let gate = RateLimitGate::new(&config);
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(middleware::from_fn(rate_limit::throttle))
        .layer(prometheus_layer)
        .layer(Extension(pool.clone()))
        .layer(Extension(config.clone()))
        .layer(Extension(http))
        .layer(Extension(verifier))
        .layer(Extension(billing_provider))
        .layer(Extension(gate));

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.bind_port).parse()?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
