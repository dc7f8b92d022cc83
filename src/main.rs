use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use gym_billing::billing::{
    spawn_billing_scheduler, FanOutSettings, GatewayClient, GatewayEventIngestor,
    HttpGatewayClient, PackageFanOutEngine, PaymentMethodCatalog, ReceivableChainGenerator,
    ReconciliationEngine, SubscriptionService,
};
use gym_billing::config;
use gym_billing::routes::api_routes;
use gym_billing::webhooks::WebhookSecret;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Gym Billing API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();
    let pool = PgPoolOptions::new()
        .max_connections(*config::DATABASE_MAX_CONNECTIONS)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let catalog = Arc::new(PaymentMethodCatalog::load(&pool).await?);
    let gateway: Arc<dyn GatewayClient> =
        Arc::new(HttpGatewayClient::new(config::gateway_config_from_env())?);
    let default_cycle = config::default_billing_cycle();

    let fan_out = PackageFanOutEngine::new(
        pool.clone(),
        FanOutSettings {
            gateway: gateway.gateway().to_string(),
            default_cycle,
        },
    );
    let engine = ReconciliationEngine::new(
        pool.clone(),
        gateway.gateway(),
        catalog.clone(),
        fan_out.clone(),
        default_cycle,
    );
    let ingestor = GatewayEventIngestor::new(pool.clone(), gateway.clone(), engine);
    let receivables = ReceivableChainGenerator::new(pool.clone(), catalog.clone());
    let subscriptions = SubscriptionService::new(pool.clone(), gateway.clone(), default_cycle);

    if *config::BILLING_SCHEDULER_ENABLED {
        spawn_billing_scheduler(
            pool.clone(),
            ingestor.clone(),
            config::billing_settings_from_env(),
        );
    } else {
        tracing::info!("billing scheduler disabled");
    }

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(pool.clone()))
        .layer(Extension(ingestor))
        .layer(Extension(fan_out))
        .layer(Extension(receivables))
        .layer(Extension(subscriptions))
        .layer(Extension(catalog))
        .layer(Extension(WebhookSecret(config::GATEWAY_WEBHOOK_SECRET.clone())));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
