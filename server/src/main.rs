//! codecortex server — thin CLI shell over the [`codecortex_server`] library
//! crate's HTTP/WebSocket/MCP router and the optional gRPC listener, all
//! driven by one [`Runtime`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use codecortex_core::config::RootConfig;
use codecortex_core::Runtime;
use codecortex_server::{grpc, mcp};

/// codecortex API server — HTTP, gRPC, WebSocket, and MCP surfaces over the
/// hybrid code-search core.
#[derive(Parser)]
#[command(name = "codecortex-server", version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file (defaults to ./codecortex.toml, or built-in
    /// defaults if that doesn't exist)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Run as an MCP stdio server instead of starting the HTTP/gRPC listeners
    #[arg(long)]
    mcp: bool,

    /// Bind 0.0.0.0 instead of 127.0.0.1
    #[arg(long)]
    bind_all: bool,

    /// HTTP port
    #[arg(long, default_value_t = 8070)]
    port: u16,

    /// gRPC port; omit to disable the gRPC listener
    #[arg(long)]
    grpc_port: Option<u16>,
}

const PORT_SCAN_RANGE: u16 = 10;

async fn shutdown_signal(runtime: Arc<Runtime>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl-c");
        info!("received ctrl-c, shutting down");
    }

    runtime.lifecycle.begin_shutdown();
    runtime.lifecycle.drain(std::time::Duration::from_secs(30)).await;
    runtime.bus.close(std::time::Duration::from_secs(5)).await;
    if let Err(e) = runtime.telemetry.flush_query_log() {
        error!(error = %e, "failed to flush query log during shutdown");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_target(false).init();

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from("codecortex.toml"));
    let mut config = match RootConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "failed to load config");
            std::process::exit(1);
        }
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let runtime = match Runtime::new(config) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            std::process::exit(1);
        }
    };

    {
        let lifecycle = runtime.lifecycle.clone();
        std::panic::set_hook(Box::new(move |info| {
            error!(panic = %info, "background task panicked");
            lifecycle.trip_process_health(std::time::Duration::from_secs(30));
        }));
    }

    if cli.mcp {
        info!("starting MCP stdio server");
        mcp::run_stdio(runtime).await;
        return;
    }

    if let Some(grpc_port) = cli.grpc_port {
        let grpc_runtime = runtime.clone();
        let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
        let addr: SocketAddr = format!("{bind_addr}:{grpc_port}").parse().expect("invalid gRPC bind address");
        tokio::spawn(async move {
            info!(addr = %addr, "starting gRPC listener");
            if let Err(e) =
                tonic::transport::Server::builder().add_service(grpc::GrpcService::new(grpc_runtime)).serve(addr).await
            {
                error!(error = %e, "gRPC server exited");
            }
        });
    }

    let app = codecortex_server::app(runtime.clone());

    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };

    let port = std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(cli.port);
    let listener = match tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
        Ok(l) => l,
        Err(e) => {
            warn!(port = port, error = %e, "requested port unavailable, scanning for a free one");
            let mut found = None;
            for candidate in port..port.saturating_add(PORT_SCAN_RANGE) {
                if let Ok(l) = tokio::net::TcpListener::bind(format!("{bind_addr}:{candidate}")).await {
                    found = Some(l);
                    break;
                }
            }
            found.unwrap_or_else(|| {
                error!("no free port found near {port}");
                std::process::exit(1);
            })
        }
    };

    let port = listener.local_addr().expect("listener has a local address").port();
    info!(port = port, bind = bind_addr, "codecortex server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(runtime)).await.unwrap();
}
