use std::path::PathBuf;

use axum_transfer::config::Config;
use axum_transfer::server::{router, AppState};
use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on, overrides BIND_ADDR's port
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory for finalized uploads, overrides UPLOADS_DIR
    #[arg(short, long)]
    uploads_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "axum_transfer=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.bind_addr.set_port(port);
    }
    if let Some(dir) = args.uploads_dir {
        config.uploads_root = dir;
    }
    info!(
        "Uploads in {}, max upload {} MiB, strict chunk order {}",
        config.uploads_root.display(),
        config.max_upload_bytes / 1024 / 1024,
        config.strict_chunk_order
    );

    let state = AppState::new(config.clone());
    state.store.prepare().await?;

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("Server running at http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
