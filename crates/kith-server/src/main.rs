mod config;

use std::sync::Arc;

use tracing::{info, warn};

use kith_api::{AppStateInner, AuthConfig, FILES_PATH};
use kith_blob::BlobStore;
use kith_db::Database;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kith=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let addr = config.addr()?;

    let db = Arc::new(Database::open(&config.db_path)?);
    let blobs = Arc::new(BlobStore::new(config.upload_dir.clone(), FILES_PATH).await?);

    let state = AppStateInner::new(
        db,
        blobs,
        AuthConfig {
            jwt_secret: config.jwt_secret,
            token_ttl: config.token_ttl,
            require_auth: config.require_auth,
        },
    );
    if config.require_auth {
        info!("Bearer tokens required on API routes");
    }

    let app = kith_api::router(state);

    info!("Kith server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
