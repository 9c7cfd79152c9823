mod auth;
mod config;
mod error;
mod rate_limit;
mod routes;

use std::sync::Arc;

use config::AppConfig;
use fundsync_core::db::Database;
use fundsync_core::SyncService;
use routes::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production injects the environment directly.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fundsync_api=info".parse()?)
                .add_directive("fundsync_core=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting fundsync-api with config: {:?}", config);

    let db = if config.uses_in_memory_database() {
        tracing::warn!("Using an in-memory database; sync state is lost on restart");
        Database::open_in_memory()?
    } else {
        Database::open(&config.database_path)?
    };
    let sync = SyncService::new(db, config.max_batch_size)?;

    let state = AppState::new(config, sync);
    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("fundsync-api listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
