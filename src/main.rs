//! game-arbiter: turn-based message orchestrator for multiplayer game
//! sessions.
//!
//! The authoritative game server drives us over stdio (bridged by a
//! side-channel process such as socat): one roster line, then addressed
//! messages paired with delays (init) or deadlines (turns), closed by the
//! phase sentinels. Client processes connect over TCP and are spoken to
//! in newline-delimited JSON. All game logic stays on the server side;
//! this binary only routes, times, and collects.

mod collect;
mod protocol;
mod registry;
mod router;
mod sequencer;
mod transport;

use tokio::net::TcpListener;
use tokio::time::Duration;

use protocol::ControlChannel;
use sequencer::Sequencer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing always goes to stderr — stdout is the control stream.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "game_arbiter=info".parse().unwrap()),
        )
        .init();

    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:6000".into());
    let secret = std::env::var("GAME_SECRET").unwrap_or_default();
    let connect_window: u64 = std::env::var("CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!("Listening for clients on {}", listen_addr);

    let mut sequencer = Sequencer::new(ControlChannel::from_stdio());

    let roster = sequencer.ingest_roster().await?;
    let channels = transport::connect_clients(
        &listener,
        &roster,
        &secret,
        Duration::from_secs(connect_window),
    )
    .await;
    sequencer.attach_channels(channels)?;

    sequencer.run().await?;

    tracing::info!("Session complete");
    Ok(())
}
