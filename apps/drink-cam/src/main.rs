use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use drink_cam_core::config::Config;
use drink_cam_core::media::{IvfFileCamera, MediaSource, PacketCounter, StreamSink};
use drink_cam_core::peer::WebRtcPeerFactory;
use drink_cam_core::telemetry::logging::{self, LogSettings, Verbosity};
use drink_cam_core::{Role, RoomCode, SessionConfig, SessionDeps, SessionHandle};
use signal_relay::WsRelay;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "drink-cam", about = "Stream a party camera to viewers sharing a room code")]
struct Cli {
    /// Signaling relay base URL
    #[arg(long, global = true, env = "DRINK_CAM_RELAY_URL")]
    relay: Option<String>,

    #[arg(long, short = 'v', global = true, value_enum, default_value_t = Verbosity::Warn)]
    verbosity: Verbosity,

    #[arg(long, global = true, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture video and offer it to the room
    Camera {
        #[command(flatten)]
        room: RoomArgs,

        /// VP8 IVF file to stream in a loop
        #[arg(long, short = 's')]
        source: PathBuf,
    },
    /// Wait for the camera and receive its stream
    Viewer {
        #[command(flatten)]
        room: RoomArgs,
    },
}

#[derive(Args, Debug)]
struct RoomArgs {
    #[arg(long, short = 'r')]
    room: String,

    /// Access key, when the session requires one
    #[arg(long, short = 'k')]
    access: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&LogSettings {
        verbosity: cli.verbosity,
        file: cli.log_file.clone(),
    })?;

    let mut config = Config::from_env();
    if let Some(relay) = cli.relay {
        config.relay_url = relay;
    }

    let (role, room_args, media, sink) = match cli.command {
        Command::Camera { room, source } => {
            let camera: Arc<dyn MediaSource> = Arc::new(IvfFileCamera::new(source));
            (Role::Camera, room, Some(camera), None)
        }
        Command::Viewer { room } => {
            let counter: Arc<dyn StreamSink> = Arc::new(PacketCounter::new());
            (Role::Viewer, room, None, Some(counter))
        }
    };
    let room = RoomCode::parse(&room_args.room)?;

    let relay = WsRelay::new(&config.relay_url)
        .with_context(|| format!("invalid relay url {}", config.relay_url))?;
    let peers = WebRtcPeerFactory::new(config.stun_urls.clone())?;
    let session = SessionHandle::spawn(
        SessionConfig::new(role)
            .with_room(room.clone())
            .with_access_key(config.access_key.clone())
            .with_ready_timeout(config.ready_timeout),
        SessionDeps {
            relay: Arc::new(relay),
            peers: Arc::new(peers),
            media,
            sink,
        },
    );

    if let Some(key) = room_args.access.as_deref() {
        session.grant_access(key).await?;
    }
    if !session.can_operate() {
        bail!("this session requires an access key; pass --access");
    }

    let mut states = session.watch_state();
    let mut notices = session.notices();
    println!("{role} in room {}: {}", room.masked(), session.status_label());
    session.start().await.context("failed to start")?;

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", states.borrow_and_update().label());
            }
            notice = notices.recv() => match notice {
                Ok(notice) => eprintln!("{}", notice.message()),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                if let Err(err) = session.stop().await {
                    tracing::warn!(error = %err, "stop failed");
                }
                break;
            }
        }
    }

    session.shutdown().await;
    println!("{}", session.status_label());
    Ok(())
}
