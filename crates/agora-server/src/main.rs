//! # Agora
//!
//! - `agora serve`: run the signaling relay that remote devices connect to
//! - `agora demo`: place a call between two in-process devices over loopback
//!   media, answer it, upgrade it to video and hang up

use agora_call::media::LoopbackMedia;
use agora_call::{CallHandle, CallPhase, CallSessionController, CallView};
use agora_common::config::{self, AppConfig};
use agora_common::models::CallType;
use agora_signaling::relay::{build_router, RelayState};
use agora_signaling::{MemorySignaling, RelaySignaling, SignalingChannel};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "agora", version, about = "Peer-to-peer call signaling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the signaling relay (default).
    Serve {
        /// Override `server.host`.
        #[arg(long)]
        host: Option<String>,
        /// Override `server.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a scripted call between two in-process devices.
    Demo {
        /// Route signaling through a WebSocket relay on a local port.
        #[arg(long)]
        relay: bool,
        /// Seconds to stay in each phase of the call.
        #[arg(long, default_value_t = 2)]
        hold_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting Agora v{}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => serve(config, host, port).await,
        Command::Demo { relay, hold_secs } => {
            demo(config, relay, Duration::from_secs(hold_secs)).await
        }
    }
}

async fn serve(config: &AppConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let addr = SocketAddr::new(
        host.parse().context("invalid server host")?,
        port.unwrap_or(config.server.port),
    );

    let store = MemorySignaling::with_capacity(config.signaling.broadcast_capacity);
    let router = build_router(RelayState::new(store.clone()));

    // Finished calls are kept for a while so late subscribers still see the outcome.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            store.purge_finished().await;
        }
    });

    tracing::info!("Signaling relay listening on ws://{addr}/signaling");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Start a relay on an ephemeral local port and return its URL.
async fn spawn_local_relay(config: &AppConfig) -> anyhow::Result<String> {
    let store = MemorySignaling::with_capacity(config.signaling.broadcast_capacity);
    let router = build_router(RelayState::new(store));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Local relay stopped");
        }
    });
    Ok(format!("ws://{addr}/signaling"))
}

async fn demo(config: &AppConfig, over_relay: bool, hold: Duration) -> anyhow::Result<()> {
    let (alice_channel, bob_channel): (Arc<dyn SignalingChannel>, Arc<dyn SignalingChannel>) =
        if over_relay {
            let mut signaling = config.signaling.clone();
            signaling.url = spawn_local_relay(config).await?;
            tracing::info!(url = %signaling.url, "Demo devices connect through relay");
            (
                Arc::new(RelaySignaling::connect(&signaling).await?),
                Arc::new(RelaySignaling::connect(&signaling).await?),
            )
        } else {
            let store: Arc<dyn SignalingChannel> = Arc::new(MemorySignaling::new());
            (Arc::clone(&store), store)
        };

    let ice_servers: Vec<&str> = config
        .ice_servers
        .iter()
        .flat_map(|s| s.urls.iter().map(String::as_str))
        .collect();
    tracing::info!(?ice_servers, "Loopback media ignores ICE servers");

    let alice = CallSessionController::new(Uuid::now_v7(), alice_channel, config.call.clone());
    let bob = CallSessionController::new(Uuid::now_v7(), bob_channel, config.call.clone());
    tracing::info!(alice = %alice.user_id(), bob = %bob.user_id(), "Demo devices ready");

    // Alice calls Bob (voice)
    let (media, _) = LoopbackMedia::new("alice");
    let caller = alice.place_call(bob.user_id(), CallType::Voice, media);
    wait_until(&caller, "ringing", |v| v.phase == CallPhase::AwaitingAnswer).await?;

    // Bob picks up
    let (media, _) = LoopbackMedia::new("bob");
    let callee = bob.answer_call(caller.call_id(), media);
    wait_until(&callee, "connected", |v| v.phase == CallPhase::Connected).await?;
    wait_until(&caller, "connected", |v| v.phase == CallPhase::Connected).await?;
    tokio::time::sleep(hold).await;

    // Alice turns on her camera, which asks Bob to upgrade
    caller.toggle_camera().await?;
    wait_until(&callee, "upgrade prompt", |v| v.upgrade_prompt.is_some()).await?;
    callee.respond_to_upgrade(true).await?;
    wait_until(&caller, "video", |v| v.call_type == CallType::Video && v.remote_video).await?;
    wait_until(&callee, "video", |v| v.call_type == CallType::Video && v.remote_video).await?;
    tokio::time::sleep(hold).await;

    caller.hang_up().await?;
    let caller_outcome = caller.outcome().await;
    let callee_outcome = callee.outcome().await;
    tracing::info!(?caller_outcome, "Alice's call finished");
    tracing::info!(?callee_outcome, "Bob's call finished");
    Ok(())
}

async fn wait_until(
    handle: &CallHandle,
    what: &str,
    pred: impl FnMut(&CallView) -> bool,
) -> anyhow::Result<()> {
    let mut view = handle.watch();
    let current = tokio::time::timeout(Duration::from_secs(10), view.wait_for(pred))
        .await
        .with_context(|| format!("timed out waiting for {what}"))?
        .with_context(|| format!("call ended while waiting for {what}"))?;
    tracing::info!(call = %current.call_id, status = %current.status_text, "Reached {what}");
    Ok(())
}
