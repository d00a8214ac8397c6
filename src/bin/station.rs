//! Operator station process
//!
//! Runs as the master (owns the rover link and relays for everyone else) or
//! as a slave found by broadcast, and subscribes to the configured media
//! streams.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rover_link::{
    channel::ChannelState,
    config::{AppConfig, StreamClientConfig, StreamKind},
    discovery::{MasterStation, Origin, SlaveStation, StationEvent},
    media::{AudioClient, MediaClientEvent, MediaClientEvents, MediaFormat, VideoClient},
    protocol::SharedMessage,
};

/// Operator-station link process
#[derive(Parser, Debug)]
#[command(name = "station")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,

    /// Run as a slave station regardless of the configuration
    #[arg(long, default_value = "false")]
    slave: bool,

    /// Ask the rover for the mono camera stream once connected
    #[arg(long, default_value = "false")]
    mono: bool,

    /// Ask the rover for the audio stream once connected
    #[arg(long, default_value = "false")]
    audio: bool,

    /// Tell all stations to start recording once connected
    #[arg(long, default_value = "false")]
    record: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.slave {
        config.discovery.master = false;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, args))
}

enum Station {
    Master(MasterStation),
    Slave(SlaveStation),
}

impl Station {
    fn send(&self, message: SharedMessage) {
        let payload = message.to_bytes();
        match self {
            Self::Master(master) => master.send(payload),
            Self::Slave(slave) => slave.send(payload),
        }
    }
}

/// Time the station task gets to flush a last message before the runtime stops
const SIGN_OFF_GRACE: Duration = Duration::from_millis(100);

/// Close the recording session on the rover before exiting
async fn sign_off(station: &Station, record: bool) {
    if record {
        station.send(SharedMessage::StopDataRecording);
        tokio::time::sleep(SIGN_OFF_GRACE).await;
    }
}

/// Keeps stream clients alive for the life of the process
enum StreamClient {
    Video(VideoClient),
    Audio(AudioClient),
}

impl StreamClient {
    fn name(&self) -> &str {
        match self {
            Self::Video(client) => client.name(),
            Self::Audio(client) => client.name(),
        }
    }
}

async fn run(config: AppConfig, args: Args) -> Result<()> {
    let timing = config.discovery.timing(config.channel.timing());
    let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    let (station, mut events) = if config.discovery.master {
        info!("Starting master station");
        let rover = SocketAddr::new(config.network.rover_address, config.network.shared_port);
        let listen = SocketAddr::new(any, config.discovery.broadcast_port);
        let (master, events) =
            MasterStation::new(rover, listen, timing).context("starting master station")?;
        (Station::Master(master), events)
    } else {
        info!("Starting slave station");
        let broadcast = SocketAddr::new(
            config.discovery.broadcast_address,
            config.discovery.broadcast_port,
        );
        let (slave, events) =
            SlaveStation::new(any, broadcast, timing).context("starting slave station")?;
        (Station::Slave(slave), events)
    };

    let mut clients = Vec::new();
    for stream in &config.media.streams {
        clients.push(open_stream(&config, stream)?);
    }
    info!("Subscribed to {} stream(s)", clients.len());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StationEvent::RoverState(ChannelState::Connected)) => {
                    info!("Connected to the rover");
                    send_requests(&station, &config, &args);
                }
                Some(StationEvent::RoverState(state)) => info!("Rover link {:?}", state),
                Some(StationEvent::Message { origin, payload }) => handle_shared(origin, payload),
                Some(StationEvent::PeerJoined(peer)) => info!("Station {} joined", peer),
                Some(StationEvent::PeerLeft(peer)) => info!("Station {} left", peer),
                Some(StationEvent::Fatal(e)) => {
                    error!("Station failed: {}", e);
                    return Err(e.into());
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                sign_off(&station, args.record).await;
                break;
            }
        }
    }

    for client in clients {
        debug!("Closing stream '{}'", client.name());
    }
    Ok(())
}

fn open_stream(config: &AppConfig, stream: &StreamClientConfig) -> Result<StreamClient> {
    let server = SocketAddr::new(config.network.rover_address, stream.port);
    let host = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let timing = config.media.client_timing(config.channel.timing());

    let client = match stream.kind {
        StreamKind::Video => {
            let (client, events) = VideoClient::new(stream.name.clone(), server, host, timing)
                .with_context(|| format!("opening stream '{}'", stream.name))?;
            for address in &stream.forward {
                client.add_forwarding_address(*address);
            }
            log_stream_events(stream.name.clone(), events);
            StreamClient::Video(client)
        }
        StreamKind::Audio => {
            let (client, events) = AudioClient::new(stream.name.clone(), server, host, timing)
                .with_context(|| format!("opening stream '{}'", stream.name))?;
            for address in &stream.forward {
                client.add_forwarding_address(*address);
            }
            log_stream_events(stream.name.clone(), events);
            StreamClient::Audio(client)
        }
    };
    Ok(client)
}

fn log_stream_events<F: MediaFormat>(name: String, mut events: MediaClientEvents<F>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MediaClientEvent::StateChanged(state) => info!("Stream '{}' {:?}", name, state),
                MediaClientEvent::Streaming(format) => {
                    info!("Stream '{}' playing {:?}", name, format)
                }
                MediaClientEvent::Eos => info!("Stream '{}' ended", name),
                MediaClientEvent::Error(e) => warn!("Stream '{}': {}", name, e),
                MediaClientEvent::Bitrate(bits) => debug!("Stream '{}' at {} bit/s", name, bits),
            }
        }
    });
}

fn send_requests(station: &Station, config: &AppConfig, args: &Args) {
    if args.mono {
        station.send(SharedMessage::StartMonoCameraStream(
            config.media.default_video_format,
        ));
    }
    if args.audio {
        station.send(SharedMessage::RequestActivateAudioStream(
            config.media.default_audio_format,
        ));
    }
    if args.record {
        let start = chrono::Utc::now().timestamp_millis();
        station.send(SharedMessage::StartDataRecording(start));
    }
}

fn handle_shared(origin: Origin, payload: Bytes) {
    let message = match SharedMessage::decode(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping shared message from {:?}: {}", origin, e);
            return;
        }
    };
    match message {
        SharedMessage::RoverStatusUpdate(connected) => {
            info!("Rover boards {}", if connected { "connected" } else { "disconnected" });
        }
        SharedMessage::RoverGpsUpdate(fix) => {
            debug!("GPS {:.6}, {:.6} ({} satellites)", fix.latitude, fix.longitude, fix.satellites);
        }
        SharedMessage::StartDataRecording(start) => {
            let start = chrono::DateTime::from_timestamp_millis(start)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| start.to_string());
            info!("Recording started at {}", start);
        }
        SharedMessage::StopDataRecording => info!("Recording stopped"),
        SharedMessage::Error(description) => warn!("Rover reported: {}", description),
        other => debug!("Shared {:?} from {:?}", other, origin),
    }
}
