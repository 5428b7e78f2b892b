//! wevd - Named-event WebSocket server
//!
//! Runs an event server with a small set of demo handlers.
//!
//! # Usage
//!
//! ```bash
//! # Serve on the default address (127.0.0.1:8080)
//! wevd serve
//!
//! # Serve with a config file and an explicit address
//! wevd serve --config wev.toml --bind 0.0.0.0:9000
//!
//! # Validate a config file
//! wevd check-config wev.toml
//!
//! # Override the address from the environment
//! WEV_BIND=0.0.0.0:9000 wevd serve
//!
//! # Enable debug logging
//! RUST_LOG=wevd=debug wevd serve
//! ```
//!
//! # Demo Events
//!
//! | Event    | Args        | Reply                         |
//! |----------|-------------|-------------------------------|
//! | `ping`   | none        | `pong`                        |
//! | `echo`   | anything    | `echo` with the same args     |
//! | `sum`    | `[a, b]`    | `sumResult` with `a + b`      |
//! | `nick`   | `[name]`    | none; stored on the connection|
//! | `say`    | `[text]`    | `said` sent to every client   |
//! | `who`    | none        | `clients` with ids and nicks  |
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown ("going away" close to all clients)

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wev_protocol::Args;
use wevd::{ClientHandle, CloseInfo, ConnectInfo, EventServer, HandlerTable, ServerConfig};

/// wev server - named events over WebSocket
#[derive(Parser, Debug)]
#[command(name = "wevd", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server
    Serve {
        /// Listen address, overrides the config file and WEV_BIND
        #[arg(short, long)]
        bind: Option<String>,

        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate a config file and print the effective settings
    CheckConfig {
        /// TOML config file
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Default to 'serve' if no subcommand given
    let command = cli.command.unwrap_or(Command::Serve {
        bind: None,
        config: None,
    });

    match command {
        Command::Serve { bind, config } => {
            let config = load_config(config, bind)?;
            run_server(config)
        }
        Command::CheckConfig { path } => {
            let config = ServerConfig::load(&path)
                .with_context(|| format!("Invalid config {}", path.display()))?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render config")?;
            println!("{rendered}");
            Ok(())
        }
    }
}

/// Layers defaults, config file, `WEV_BIND` and `--bind`.
fn load_config(path: Option<PathBuf>, bind: Option<String>) -> Result<ServerConfig> {
    let config = match path {
        Some(path) => ServerConfig::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ServerConfig::default(),
    };

    let config = config.with_env().context("Invalid WEV_BIND")?;

    match bind {
        Some(bind) => config.with_bind_str(&bind).context("Invalid --bind"),
        None => Ok(config),
    }
}

/// Runs the server (async entry point).
#[tokio::main]
async fn run_server(config: ServerConfig) -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("wevd=info".parse()?)
                .add_directive("wev_core=info".parse()?)
                .add_directive("wev_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        bind = %config.bind,
        "wevd starting"
    );

    let cancel_token = CancellationToken::new();

    // Setup signal handlers
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let handlers = demo_handlers().context("Invalid handler table")?;
    let server = EventServer::new(config, handlers).with_cancel_token(cancel_token);

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("wevd stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

// ============================================================================
// Demo Handlers
// ============================================================================

fn demo_handlers() -> Result<HandlerTable, wevd::ConfigError> {
    HandlerTable::builder()
        .on("ping", ping)
        .on("echo", echo)
        .on("sum", sum)
        .on("nick", nick)
        .on("say", say)
        .on("who", who)
        .on_connection(on_connection)
        .on_close(on_close)
        .build()
}

async fn ping(_client: ClientHandle, _args: Args) -> Result<Value> {
    Ok(json!(["pong"]))
}

async fn echo(_client: ClientHandle, args: Args) -> Result<Value> {
    Ok(json!({ "type": "echo", "args": args.into_value() }))
}

async fn sum(_client: ClientHandle, args: Args) -> Result<Value> {
    let (a, b): (f64, f64) = args.deserialize().context("sum expects [a, b]")?;
    Ok(json!(["sumResult", a + b]))
}

async fn nick(client: ClientHandle, args: Args) -> Result<Value> {
    let (name,): (String,) = args.deserialize().context("nick expects [name]")?;
    client.set("nick", json!(name)).await?;
    Ok(Value::Null)
}

async fn say(client: ClientHandle, args: Args) -> Result<Value> {
    let (text,): (String,) = args.deserialize().context("say expects [text]")?;
    let from = client.get("nick").await?.unwrap_or_else(|| json!(client.id().as_str()));

    let peers = client.directory().map(|data| data.client().clone()).await;
    for peer in peers {
        // A peer closing mid-broadcast is not our failure
        if let Err(e) = peer.emit("said", vec![from.clone(), json!(text)]).await {
            tracing::debug!(connection_id = %peer.id(), error = %e, "Skipped closed peer");
        }
    }
    Ok(Value::Null)
}

async fn who(client: ClientHandle, _args: Args) -> Result<Value> {
    let clients = client
        .directory()
        .map(|data| json!({ "id": data.id().as_str(), "nick": data.field("nick") }))
        .await;
    Ok(json!(["clients", clients]))
}

async fn on_connection(client: ClientHandle, info: Arc<ConnectInfo>) -> Result<Value> {
    let online = client.directory().len().await;
    info!(connection_id = %client.id(), path = %info.path, online, "Welcoming client");
    Ok(json!(["welcome", client.id().as_str(), online]))
}

async fn on_close(client: ClientHandle, info: CloseInfo) -> Result<Value> {
    let remaining = client.directory().len().await;
    info!(
        connection_id = %client.id(),
        code = info.code,
        remaining,
        "Client left"
    );
    Ok(Value::Null)
}
