mod handlers;
mod monitor;
mod state;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

pub const MONITOR_SWEEP_INTERVAL_MS: u64 = 500;

/// - En Docker: MASTER_ADDR=0.0.0.0:8080, MASTER_DATA_DIR=/data/objects
/// - MASTER_SETTLE_MS: cuánto queda un job en "running" antes de "done"
fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("master=debug,axum=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = env_or("MASTER_ADDR", "0.0.0.0:8080");
    let data_dir = PathBuf::from(env_or("MASTER_DATA_DIR", "/data/objects"));
    let settle_ms: u64 = env_or("MASTER_SETTLE_MS", "2000")
        .parse()
        .context("MASTER_SETTLE_MS inválido")?;

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("no se pudo crear {}", data_dir.display()))?;

    let state = AppState::new(data_dir, Duration::from_millis(settle_ms));

    // router HTTP
    let app = handlers::build_router(state.clone());

    // jobs running -> done en segundo plano
    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::run_monitor_loop(monitor_state).await;
    });

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {addr}"))?;
    info!(
        "master escuchando en {} (objetos en {})",
        listener.local_addr()?,
        state.data_dir.display()
    );

    axum::serve(listener, app).await?;
    Ok(())
}
