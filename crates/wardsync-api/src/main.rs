mod config;
mod error;
mod jobs;
mod routes;

use std::sync::Arc;

use config::AppConfig;
use jobs::BackgroundJobs;
use routes::{app_router, AppState};
use wardsync_core::{SessionManager, SyncSchema, SyncStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wardsync_api=info".parse()?)
                .add_directive("wardsync_core=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting wardsync-api with config: {:?}", config);

    let store = SyncStore::open_path(&config.database_path, SyncSchema::clinical()).await?;
    let summary = store.rebuild_lookup().await?;
    tracing::info!(
        upserted = summary.upserted,
        up_to_tick = summary.up_to_tick,
        "Sync lookup rebuilt"
    );

    let sessions = SessionManager::new(store, config.sync.clone());
    let _jobs = BackgroundJobs::spawn(&sessions, &config);

    let state = AppState::new(config.clone(), sessions);
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("wardsync-api listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
