use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mesh_call::audio::Speaker;
use mesh_call::media::{MediaSource, Microphone, SilentSource};
use mesh_call::presentation::LogPresenter;
use mesh_call::signaling::WsSignalingChannel;
use mesh_call::{Config, Error, MeshController, MeshExit, MeshHandle, WebRtcEngine};

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    ToggleMute,
    SetMuted(bool),
    MutePeer { peer_id: String, muted: bool },
    Status,
    Leave,
}

fn parse_command(line: &str) -> Option<ConsoleCommand> {
    let mut words = line.split_whitespace();
    let command = match (words.next()?, words.next()) {
        ("m" | "toggle", None) => ConsoleCommand::ToggleMute,
        ("mute", None) => ConsoleCommand::SetMuted(true),
        ("unmute", None) => ConsoleCommand::SetMuted(false),
        ("mute", Some(peer)) => ConsoleCommand::MutePeer {
            peer_id: peer.to_string(),
            muted: true,
        },
        ("unmute", Some(peer)) => ConsoleCommand::MutePeer {
            peer_id: peer.to_string(),
            muted: false,
        },
        ("status", None) => ConsoleCommand::Status,
        ("leave" | "quit" | "q", None) => ConsoleCommand::Leave,
        _ => return None,
    };
    Some(command)
}

async fn operator_console(handle: MeshHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(command) = parse_command(&line) else {
            warn!("Commands: m | mute [peer] | unmute [peer] | status | leave");
            continue;
        };
        let outcome = match command {
            ConsoleCommand::ToggleMute => handle.toggle_local_audio().await.map(|enabled| {
                info!("Microphone {}", if enabled { "on" } else { "muted" });
            }),
            ConsoleCommand::SetMuted(muted) => handle.set_local_audio(!muted).await.map(|_| ()),
            ConsoleCommand::MutePeer { peer_id, muted } => {
                handle.mute_peer(&peer_id, muted).await
            }
            ConsoleCommand::Status => handle.snapshot().await.map(|snapshot| {
                info!(
                    "role={:?} audio_enabled={}",
                    snapshot.role, snapshot.audio_enabled
                );
                for peer in snapshot.peers {
                    info!(
                        "  {} {:?} state={} transport={} offers={}{}",
                        peer.peer_id,
                        peer.role,
                        peer.state,
                        peer.transport,
                        peer.offers_sent,
                        peer.last_error
                            .map(|e| format!(" last_error={}", e))
                            .unwrap_or_default()
                    );
                }
            }),
            ConsoleCommand::Leave => {
                let _ = handle.leave().await;
                return;
            }
        };
        if let Err(e) = outcome {
            warn!("{}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    let room_id = config.room_id()?;

    let (channel, inbound) = WsSignalingChannel::connect_with_retry(
        &config.signaling_url,
        config.connect_attempts,
        config.connect_delay(),
    )
    .await
    .context("could not reach the signaling relay")?;
    let mut engine = WebRtcEngine::new(&config.ice_servers).context("could not set up WebRTC")?;
    if !config.no_audio_device {
        match Speaker::open() {
            Ok(speaker) => engine = engine.with_audio_sink(Arc::new(speaker)),
            Err(e) => warn!("Remote audio will not be played: {}", e),
        }
    }

    let (mut controller, handle) = MeshController::new(
        Arc::new(channel),
        Arc::new(engine),
        Arc::new(LogPresenter),
        config.mesh_options(),
    );

    let media: Box<dyn MediaSource> = if config.no_audio_device {
        Box::new(SilentSource)
    } else {
        Box::new(Microphone)
    };
    controller
        .join(&room_id, media.as_ref())
        .await
        .with_context(|| format!("could not join room {}", room_id))?;

    tokio::spawn(operator_console(handle.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, leaving the room");
            let _ = handle.leave().await;
        }
    });

    match controller.run(inbound).await? {
        MeshExit::Left => info!("Left room {}", room_id),
        MeshExit::RoomFull => {
            error!("Room {} is full", room_id);
            return Err(Error::RoomFull).with_context(|| format!("could not join room {}", room_id));
        }
        MeshExit::SignalingClosed => warn!("Signaling relay went away"),
    }
    Ok(())
}
