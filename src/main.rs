use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use customer_erp_sync::config::AppConfig;
use customer_erp_sync::create_app;
use customer_erp_sync::handlers::AppState;
use customer_erp_sync::repositories::{PgSyncStore, SyncStore};
use customer_erp_sync::services::erp::{
    ChangeDetector, ErpClient, ErpSyncScheduler, SyncRuleEngine, UnifiedSyncService, ZhibangErpClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO; override with RUST_LOG
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "customer_erp_sync=info,tower_http=info,sqlx=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;

    let pool = config.database.connect().await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run database migrations")?;
    tracing::info!("Database ready");

    let erp = Arc::new(ZhibangErpClient::new(config.erp.clone()).context("invalid ERP configuration")?);
    let store: Arc<dyn SyncStore> = Arc::new(PgSyncStore::new(pool));
    let detector = Arc::new(ChangeDetector::with_overrides(&config.sync.field_strategies));
    let engine = Arc::new(SyncRuleEngine::load(store.clone()).await);

    let service = Arc::new(UnifiedSyncService::new(
        erp.clone() as Arc<dyn ErpClient>,
        store,
        detector,
        engine,
        config.sync.clone(),
    ));
    let scheduler = Arc::new(ErpSyncScheduler::new(service, config.scheduler.clone()));
    scheduler.start().await;

    let app = create_app(AppState::new(scheduler.clone()));

    let addr = config.server_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Customer ERP sync listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    scheduler.stop().await;
    if let Err(e) = erp.logout().await {
        tracing::warn!("ERP logout failed: {}", e);
    }

    tracing::info!("Customer ERP sync stopped");
    Ok(())
}
