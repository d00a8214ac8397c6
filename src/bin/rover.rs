//! Rover process
//!
//! Serves the shared and drive channels, talks to the controller boards and
//! runs one media server per camera plus the audio server.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rover_link::{
    channel::{Channel, ChannelEvent, ChannelOptions, ChannelState},
    config::{AppConfig, CameraConfig, CameraRole},
    constants::DRIVE_MESSAGE_TAG,
    device::{DeviceChannel, DeviceEvent, DeviceOptions, DeviceState},
    discovery::SHARED_CHANNEL_NAME,
    media::{AudioServer, MediaServerEvent, MediaServerEvents, ProcessLauncher, StreamFormat, VideoServer},
    protocol::SharedMessage,
};

/// Rover-side link process
#[derive(Parser, Debug)]
#[command(name = "rover")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long, default_value = "false")]
    print_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.print_config {
        println!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

struct Camera {
    config: CameraConfig,
    server: VideoServer,
}

async fn run(config: AppConfig) -> Result<()> {
    info!("Starting rover");
    let bind = config.network.bind_address;
    let timing = config.channel.timing();

    let (mut shared, mut shared_events) = Channel::new(
        ChannelOptions::tcp_server(
            SHARED_CHANNEL_NAME,
            SocketAddr::new(bind, config.network.shared_port),
        )
        .with_timing(timing)
        .with_simulated_delay(Duration::from_millis(config.channel.simulated_delay_ms)),
    );
    shared.open().context("opening shared channel")?;

    let (mut drive, mut drive_events) = Channel::new(
        ChannelOptions::udp_server("drive", SocketAddr::new(bind, config.network.drive_port))
            .with_timing(timing),
    );
    drive.open().context("opening drive channel")?;

    // Controller boards, events merged into one stream
    let (device_tx, mut device_events) = mpsc::unbounded_channel::<(u8, DeviceEvent)>();
    let mut devices = HashMap::new();
    for board in &config.device.boards {
        let options = DeviceOptions::new(board.device_id, SocketAddr::new(bind, board.port))
            .with_idle_timeout(Duration::from_millis(config.device.idle_timeout_ms))
            .with_broadcast_address(config.device.broadcast_address);
        let (device, mut events) = DeviceChannel::open(options);
        info!("Board '{}' on device id {}", board.name, board.device_id);
        let sink = device_tx.clone();
        let id = board.device_id;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if sink.send((id, event)).is_err() {
                    break;
                }
            }
        });
        devices.insert(board.device_id, device);
    }

    // Media servers, events merged by name
    let (media_tx, mut media_events) = mpsc::unbounded_channel::<(String, MediaServerEvent)>();
    let server_timing = config.media.server_timing(timing);
    let mut cameras = Vec::new();
    for camera in &config.media.cameras {
        let (server, events) = VideoServer::new(
            camera.name.clone(),
            SocketAddr::new(bind, camera.port),
            Box::new(ProcessLauncher::new(&config.media.encoder_program)),
            server_timing,
        )
        .with_context(|| format!("opening media server '{}'", camera.name))?;
        forward_media_events(camera.name.clone(), events, &media_tx);
        cameras.push(Camera {
            config: camera.clone(),
            server,
        });
    }
    let audio = match &config.media.audio {
        Some(audio) => {
            let (server, events) = AudioServer::new(
                audio.name.clone(),
                SocketAddr::new(bind, audio.port),
                Box::new(ProcessLauncher::new(&config.media.encoder_program)),
                server_timing,
            )
            .with_context(|| format!("opening audio server '{}'", audio.name))?;
            forward_media_events(audio.name.clone(), events, &media_tx);
            Some((audio.device.clone(), server))
        }
        None => None,
    };

    loop {
        tokio::select! {
            Some(event) = shared_events.recv() => match event {
                ChannelEvent::StateChanged(ChannelState::Connected) => {
                    let connected = all_connected(&devices);
                    shared.send_message(SharedMessage::RoverStatusUpdate(connected).to_bytes());
                }
                ChannelEvent::StateChanged(state) => debug!("Shared channel {:?}", state),
                ChannelEvent::MessageReceived(message) => {
                    handle_shared(message, &cameras, audio.as_ref());
                }
                ChannelEvent::Statistics(stats) => debug!("Shared channel {:?}", stats),
                ChannelEvent::Failed(e) => {
                    error!("Shared channel failed: {}", e);
                    return Err(e.into());
                }
            },
            Some(event) = drive_events.recv() => match event {
                ChannelEvent::MessageReceived(message) => {
                    forward_drive(message, config.device.drive_board, &devices);
                }
                ChannelEvent::Failed(e) => {
                    error!("Drive channel failed: {}", e);
                    return Err(e.into());
                }
                ChannelEvent::StateChanged(state) => info!("Drive channel {:?}", state),
                ChannelEvent::Statistics(_) => {}
            },
            Some((id, event)) = device_events.recv() => match event {
                DeviceEvent::StateChanged(state) => {
                    info!("Board {} {:?}", id, state);
                    let connected = all_connected(&devices);
                    shared.send_message(SharedMessage::RoverStatusUpdate(connected).to_bytes());
                }
                DeviceEvent::Message(payload) => debug!("Board {} sent {} bytes", id, payload.len()),
                DeviceEvent::Log(_) => {}
            },
            Some((name, event)) = media_events.recv() => match event {
                MediaServerEvent::Error(e) => {
                    let report = format!("{}: {}", name, e);
                    shared.send_message(SharedMessage::Error(report).to_bytes());
                }
                MediaServerEvent::Eos => info!("Stream '{}' ended", name),
                MediaServerEvent::StateChanged(state) => debug!("Stream '{}' {:?}", name, state),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    for camera in &cameras {
        camera.server.stop();
    }
    if let Some((_, server)) = &audio {
        server.stop();
    }
    // Let the servers kill their encoders before the runtime goes away
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

fn forward_media_events(
    name: String,
    mut events: MediaServerEvents,
    sink: &mpsc::UnboundedSender<(String, MediaServerEvent)>,
) {
    let sink = sink.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if sink.send((name.clone(), event)).is_err() {
                break;
            }
        }
    });
}

fn all_connected(devices: &HashMap<u8, DeviceChannel>) -> bool {
    devices
        .values()
        .all(|device| device.state() == DeviceState::Connected)
}

fn forward_drive(message: Bytes, drive_board: Option<u8>, devices: &HashMap<u8, DeviceChannel>) {
    if message.first() != Some(&DRIVE_MESSAGE_TAG) {
        warn!("Unknown drive message ({} bytes)", message.len());
        return;
    }
    let Some(device) = drive_board.and_then(|id| devices.get(&id)) else {
        return;
    };
    if let Err(e) = device.send_message(message) {
        debug!("Drive message not delivered: {}", e);
    }
}

fn handle_shared(message: Bytes, cameras: &[Camera], audio: Option<&(String, AudioServer)>) {
    let message = match SharedMessage::decode(message) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping shared message: {}", e);
            return;
        }
    };
    info!("Shared command {:?}", message);

    let start = |roles: &[CameraRole], format: &StreamFormat| {
        for camera in cameras.iter().filter(|c| roles.contains(&c.config.role)) {
            camera.server.start(camera.config.device.clone(), *format);
        }
    };
    let stop = |roles: &[CameraRole]| {
        for camera in cameras.iter().filter(|c| roles.contains(&c.config.role)) {
            camera.server.stop();
        }
    };

    match message {
        SharedMessage::RequestActivateAudioStream(format) => {
            if let Some((device, server)) = audio {
                server.start(device.clone(), format);
            }
        }
        SharedMessage::RequestDeactivateAudioStream => {
            if let Some((_, server)) = audio {
                server.stop();
            }
        }
        SharedMessage::StartStereoCameraStream(format) => {
            stop(&[CameraRole::Mono]);
            start(&[CameraRole::StereoLeft, CameraRole::StereoRight], &format);
        }
        SharedMessage::StartMonoCameraStream(format) => {
            stop(&[CameraRole::StereoLeft, CameraRole::StereoRight]);
            start(&[CameraRole::Mono], &format);
        }
        SharedMessage::EndStereoAndMonoCameraStream => {
            stop(&[CameraRole::StereoLeft, CameraRole::StereoRight, CameraRole::Mono]);
        }
        SharedMessage::StartAux1CameraStream(format) => start(&[CameraRole::Aux1], &format),
        SharedMessage::EndAux1CameraStream => stop(&[CameraRole::Aux1]),
        SharedMessage::StartDataRecording(_) | SharedMessage::StopDataRecording => {
            debug!("Recording is handled by the stations");
        }
        SharedMessage::RoverStatusUpdate(_)
        | SharedMessage::RoverGpsUpdate(_)
        | SharedMessage::Error(_) => {
            warn!("Unexpected station-bound message on the rover");
        }
    }
}
