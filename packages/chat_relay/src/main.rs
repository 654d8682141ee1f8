use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::prelude::*;

use chat_relay::AppState;
use chat_relay::config::RelayConfig;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "WebSocket chat relay with private and broadcast messages")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground (default)
    Serve(ServeArgs),

    /// Exercise a running relay with two clients and verify the replies
    Smoke(SmokeArgs),
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port to listen on (overrides relay.toml / RELAY_SERVER__PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides relay.toml / RELAY_SERVER__HOST)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,
}

#[derive(Parser)]
struct SmokeArgs {
    /// Base WebSocket URL of the relay
    #[arg(long, default_value = "ws://127.0.0.1:8000")]
    url: String,

    /// Seconds to wait for each expected message
    #[arg(long, default_value = "3")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "chat_relay=debug,chat_registry=debug,relay=debug,tower_http=debug"
    } else {
        "chat_relay=info,chat_registry=info,relay=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    match cli.command {
        Some(Commands::Smoke(args)) => {
            chat_relay::smoke::run(&args.url, Duration::from_secs(args.timeout_secs)).await
        }
        Some(Commands::Serve(args)) => run_server(args).await,
        None => {
            let args = ServeArgs {
                config: PathBuf::from("relay.toml"),
                ..Default::default()
            };
            run_server(args).await
        }
    }
}

async fn run_server(args: ServeArgs) -> Result<()> {
    let config = RelayConfig::load(&args.config, args.host.as_deref(), args.port)?;
    info!(
        config_file = %args.config.display(),
        outbound_buffer = config.session.outbound_buffer,
        confirm_on_delivery_only = config.session.confirm_on_delivery_only,
        "Configuration loaded"
    );

    let state = AppState::new(config.session.clone());

    let listener = tokio::net::TcpListener::bind(config.server.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.addr))?;
    let actual_addr = listener.local_addr()?;
    info!("Chat relay listening on http://{}", actual_addr);
    info!("WebSocket endpoint: ws://{}/ws/{{username}}", actual_addr);

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    chat_relay::serve(listener, state, shutdown_signal)
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}
