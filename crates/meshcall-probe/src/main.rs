//! meshcall-probe: watch a room's presence channel from the command line.
//!
//! Connects with the configured credentials, subscribes to the room and logs
//! the roster, joins and leaves, every signaling envelope on the channel
//! (whoever it is addressed to) and the connection lifecycle. Ctrl-C leaves
//! the channel and closes the socket normally.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use meshcall_common::MeshcallError;
use meshcall_config::MeshcallConfig;
use meshcall_mesh::{RoomConfig, SignalEnvelope};
use meshcall_realtime::{RealtimeClient, RealtimeConfig, TransportEvent};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "meshcall-probe", about = "Log presence and signaling for a meshcall room")]
struct Args {
    /// Room to watch.
    #[arg(short, long)]
    room: String,

    /// Config file (defaults to the platform config directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bearer credential for channel authorization.
    #[arg(long, env = "MESHCALL_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("meshcall-probe: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> meshcall_common::Result<()> {
    let config = match &args.config {
        Some(path) => meshcall_config::load_config_from(path)?,
        None => meshcall_config::load_config()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.as_filter().into()),
        )
        .init();

    let token = args
        .token
        .or_else(|| config.realtime.token.clone())
        .ok_or_else(|| MeshcallError::Other("no token: pass --token or set MESHCALL_TOKEN".into()))?;

    let client = RealtimeClient::init(realtime_config(&config), token)
        .map_err(|e| MeshcallError::Realtime(e.to_string()))?;
    tokio::spawn(log_lifecycle(client.lifecycle()));

    let socket_id = client
        .connect()
        .await
        .map_err(|e| MeshcallError::Realtime(e.to_string()))?;
    info!(socket_id = %socket_id, "Connected");

    let channel = client
        .presence(&RoomConfig::channel_name(&args.room))
        .await
        .map_err(|e| MeshcallError::Realtime(e.to_string()))?;
    if let Some(me) = channel.me() {
        info!(id = %me.id, name = me.name().unwrap_or("-"), "Local member");
    }

    channel
        .listen_for_whisper(&config.room.signal_event, |payload| {
            match SignalEnvelope::from_value(payload) {
                Some(envelope) => info!(
                    from = %envelope.from,
                    to = %envelope.to,
                    kind = envelope.data.kind(),
                    "Signal"
                ),
                None => warn!(payload = %payload, "Undecodable signal"),
            }
        })
        .error(|e| warn!(error = %e, "Channel error"));
    channel
        .here(|members| {
            let ids: Vec<String> = members.iter().map(|m| m.id.to_string()).collect();
            info!(count = members.len(), members = ?ids, "Roster");
        })
        .joining(|member| info!(id = %member.id, name = member.name().unwrap_or("-"), "Joined"))
        .leaving(|member| info!(id = %member.id, "Left"));

    tokio::signal::ctrl_c().await?;
    info!("Interrupted; leaving");
    channel.leave().await;
    client.shutdown().await;
    Ok(())
}

fn realtime_config(config: &MeshcallConfig) -> RealtimeConfig {
    let section = &config.realtime;
    RealtimeConfig {
        host: section.host.clone(),
        app_key: section.app_key.clone(),
        auth_endpoint: section.auth_endpoint.clone(),
        heartbeat_interval: Duration::from_secs(section.heartbeat_interval.into()),
        connect_timeout: Duration::from_secs(section.connect_timeout.into()),
        reconnect_base: Duration::from_millis(section.reconnect_base_ms.into()),
        max_reconnect_attempts: section.max_reconnect_attempts,
    }
}

async fn log_lifecycle(mut events: broadcast::Receiver<TransportEvent>) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Connected { socket_id }) => info!(socket_id = %socket_id, "Session up"),
            Ok(TransportEvent::Disconnected { code, reason }) => {
                info!(code, reason = %reason, "Disconnected")
            }
            Ok(TransportEvent::Error(e)) => warn!(error = %e, "Server error"),
            Ok(TransportEvent::Reconnecting { attempt, delay }) => {
                warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting")
            }
            Ok(TransportEvent::PermanentlyDisconnected) => {
                warn!("Gave up reconnecting");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "Lifecycle events lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
