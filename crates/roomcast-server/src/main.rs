use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use roomcast_server::{router, AppState};

const MAX_MESSAGE_CAP: usize = 10_000;
const MAX_OUTBOX_CAPACITY: usize = 4_096;

#[derive(Parser, Debug)]
#[command(name = "roomcast-server")]
struct Args {
    /// TCP listen address
    #[arg(long, env = "ROOMCAST_LISTEN_ADDR", default_value = "127.0.0.1:5000")]
    listen: SocketAddr,

    /// Retained chat messages per room (oldest dropped beyond this)
    #[arg(long, env = "ROOMCAST_MESSAGE_CAP", default_value_t = 500)]
    message_cap: usize,

    /// Per-connection send-queue depth; slow consumers drop frames beyond it
    #[arg(
        long,
        env = "ROOMCAST_OUTBOX_CAPACITY",
        default_value_t = roomcast_server::signal::DEFAULT_OUTBOX_CAPACITY
    )]
    outbox_capacity: usize,
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn validate_args(args: &Args) -> Result<()> {
    if args.message_cap == 0 || args.message_cap > MAX_MESSAGE_CAP {
        return Err(anyhow!(
            "--message-cap must be between 1 and {}",
            MAX_MESSAGE_CAP
        ));
    }
    if args.outbox_capacity == 0 || args.outbox_capacity > MAX_OUTBOX_CAPACITY {
        return Err(anyhow!(
            "--outbox-capacity must be between 1 and {}",
            MAX_OUTBOX_CAPACITY
        ));
    }
    if !args.listen.ip().is_loopback() && !env_bool("ROOMCAST_ALLOW_PUBLIC_BIND", false) {
        return Err(anyhow!(
            "refusing non-loopback bind without ROOMCAST_ALLOW_PUBLIC_BIND=1"
        ));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    roomcast_common::init_tracing();

    let args = Args::parse();
    validate_args(&args)?;

    let state = AppState::new(args.message_cap).with_outbox_capacity(args.outbox_capacity);
    let app = router(state).layer(CorsLayer::permissive());

    let listener = TcpListener::bind(args.listen).await?;
    let bound_addr = listener.local_addr()?;
    info!("signaling server listening on {}", bound_addr);
    info!("websocket endpoint ws://{}/ws", bound_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
