use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use paystream::{
    config::Config, payment::GraphQlPaymentClient, routes::create_router, utils::init_tracing, AppState,
};

#[derive(Parser, Debug)]
#[command(name = "paystream")]
#[command(about = "Pay-as-you-watch Lightning micropayment metering service", version)]
struct Args {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Directory for session state (overrides DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep all state in memory; nothing survives a restart
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    if args.in_memory {
        config.storage.provider = "memory".to_string();
    }

    let _log_guard = init_tracing(config.log.dir.as_deref());
    info!("Configuration loaded: {:?}", config.server);

    let api = Arc::new(GraphQlPaymentClient::from_config(&config.payment));
    let state = AppState::new(config.clone(), api)?;
    state.registry.restore().await?;

    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
