//! Switchboard server binary.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default path, any origin
//! switchboard-server --port 3000
//!
//! # Restrict origins
//! switchboard-server --port 3000 --origins "example.com:443 localhost:*"
//! ```
//!
//! Every event received on `/` is echoed back to its sender.

use std::{sync::Arc, time::Duration};

use clap::Parser;
use switchboard_core::Socket;
use switchboard_server::{AttachOptions, EngineOptions, OriginPolicy, Server, ServerConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Switchboard event server
#[derive(Parser, Debug)]
#[command(name = "switchboard-server")]
#[command(about = "Real-time event server with namespaces and rooms")]
#[command(version)]
struct Args {
    /// Host to bind
    #[arg(long, default_value = switchboard_server::DEFAULT_HOST)]
    host: String,

    /// Port to bind (0 picks a free port)
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Handshake path
    #[arg(long, default_value = switchboard_server::DEFAULT_PATH)]
    path: String,

    /// Allowed origins: `*:*`, or space/comma separated `host:port` patterns
    #[arg(long, default_value = "*:*")]
    origins: String,

    /// Interval between heartbeats in milliseconds
    #[arg(long, default_value = "25000")]
    ping_interval_ms: u64,

    /// Time allowed for a heartbeat reply in milliseconds
    #[arg(long, default_value = "20000")]
    ping_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        path: args.path,
        origins: OriginPolicy::parse(&args.origins),
        engine: EngineOptions {
            ping_interval: Duration::from_millis(args.ping_interval_ms),
            ping_timeout: Duration::from_millis(args.ping_timeout_ms),
            ..EngineOptions::default()
        },
        ..ServerConfig::default()
    };

    let server = Server::with_config(config);
    server.on(echo);
    server.attach(AttachOptions::default()).await?;

    if let Some(addr) = server.local_addr() {
        tracing::info!("Listening on {}{}", addr, server.path());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    server.close().await;

    Ok(())
}

/// Echo every event back to the sender, answering acks with the same args.
fn echo(socket: &Arc<Socket>) {
    tracing::info!(sid = %socket.id(), "client connected");

    socket.on_any(|socket, event, args, ack| {
        let result = match ack {
            Some(ack) => ack.send(args.to_vec()).map(|_| ()),
            None => socket.emit(event, args.to_vec()),
        };
        if let Err(e) = result {
            tracing::debug!(sid = %socket.id(), error = %e, "echo failed");
        }
    });

    socket.on_disconnect(|socket, reason| {
        tracing::info!(sid = %socket.id(), reason, "client disconnected");
    });
}
