mod config;
mod db;
mod frame;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::services::pg_store::PgStore;
use crate::services::relay::Relay;
use crate::services::store::{MemStore, SessionStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().expect("invalid configuration");

    let store: Arc<dyn SessionStore> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections)
                .await
                .expect("database init failed");
            tracing::info!(max_connections = config.db_max_connections, "postgres session store ready");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; sessions are kept in memory only");
            Arc::new(MemStore::new())
        }
    };

    let (relay, relay_task) = Relay::spawn(store.clone(), config.relay);
    let state = state::AppState::new(relay, store);

    let app = routes::app(state);
    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");

    tracing::info!(
        addr = %bind_addr,
        outbound_buffer = config.relay.outbound_buffer,
        max_connections = ?config.relay.max_connections,
        "whiteboard relay listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    relay_task.abort();
    tracing::info!("whiteboard relay stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
