//! Pharmacy checkout - order placement and payment reconciliation service

use anyhow::Result;
use pharmacy_checkout::{
    config::AppConfig,
    gateway::{http_client, CashGateway, Gateways, MpesaGateway, PayPalGateway},
    http::{router, AppState},
    notify::EventPublisher,
    orchestrator::Orchestrator,
    store::{MemoryStore, OrderStore, PgStore},
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();
    let config = AppConfig::from_env()?;

    let store: Arc<dyn OrderStore> = if config.database_url.starts_with("memory://") {
        tracing::warn!("using the in-memory store, data is lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        let pg = PgStore::connect(&config.database_url, config.database_max_connections).await?;
        pg.migrate().await?;
        Arc::new(pg)
    };

    let nats = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unavailable, events disabled");
                None
            }
        },
        None => None,
    };

    let http = http_client(config.gateway_timeout)?;
    let gateways = Gateways::new()
        .with(Arc::new(MpesaGateway::new(config.mpesa.clone(), http.clone(), config.simulation_delay)))
        .with(Arc::new(PayPalGateway::new(config.paypal.clone(), http, config.simulation_delay)))
        .with(Arc::new(CashGateway));
    let orchestrator = Orchestrator::new(store, gateways, EventPublisher::new(nats), config.currency.clone());
    let app = router(AppState { orchestrator: Arc::new(orchestrator) });

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("🚀 Pharmacy checkout listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(&addr).await?, app).await?;
    Ok(())
}
