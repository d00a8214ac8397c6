//! Configuration for rover and operator-station processes
//!
//! Loaded from a TOML file. Every section and field has a default so a
//! partial file (or none at all) yields a working local setup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::ChannelTiming;
use crate::constants::{DEFAULT_DISCOVERY_PORT, DEFAULT_DRIVE_PORT, DEFAULT_SHARED_PORT};
use crate::error::{Error, Result};
use crate::media::{AudioFormat, StreamFormat};

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub channel: ChannelConfig,
    pub device: DeviceConfig,
    pub media: MediaConfig,
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
}

/// Addresses and well-known ports of the rover
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address stations use to reach the rover
    pub rover_address: IpAddr,
    /// Local address the rover binds its servers on
    pub bind_address: IpAddr,
    /// TCP port of the shared (relay) channel
    pub shared_port: u16,
    /// UDP port of the drive control channel
    pub drive_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rover_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            shared_port: DEFAULT_SHARED_PORT,
            drive_port: DEFAULT_DRIVE_PORT,
        }
    }
}

/// ReliableChannel timing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub heartbeat_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub stats_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Artificial latency added to outbound shared-channel messages (0 = disabled)
    pub simulated_delay_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            idle_timeout_ms: 2000,
            stats_interval_ms: 1000,
            reconnect_delay_ms: 500,
            simulated_delay_ms: 0,
        }
    }
}

impl ChannelConfig {
    pub fn timing(&self) -> ChannelTiming {
        ChannelTiming {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            stats_interval: Duration::from_millis(self.stats_interval_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }
}

/// Embedded controller boards reached over the device protocol
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub idle_timeout_ms: u64,
    /// Where broadcast-token replies go; `None` answers the sender directly
    pub broadcast_address: Option<IpAddr>,
    /// Board that receives drive-channel messages
    pub drive_board: Option<u8>,
    pub boards: Vec<BoardConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 2000,
            broadcast_address: Some(IpAddr::V4(Ipv4Addr::BROADCAST)),
            drive_board: Some(1),
            boards: vec![BoardConfig {
                name: "drive".to_string(),
                device_id: 1,
                port: 5400,
            }],
        }
    }
}

/// One controller board
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BoardConfig {
    pub name: String,
    pub device_id: u8,
    pub port: u16,
}

/// Media servers (rover) and clients (station)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Encoder executable spawned for each stream
    pub encoder_program: PathBuf,
    pub handshake_retry_ms: u64,
    pub bind_retry_ms: u64,
    pub punch_interval_ms: u64,
    pub bitrate_window_ms: u64,
    pub cameras: Vec<CameraConfig>,
    pub audio: Option<AudioServerConfig>,
    pub default_video_format: StreamFormat,
    pub default_audio_format: AudioFormat,
    /// Streams an operator station subscribes to
    pub streams: Vec<StreamClientConfig>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            encoder_program: PathBuf::from("media-encoder"),
            handshake_retry_ms: 3000,
            bind_retry_ms: 500,
            punch_interval_ms: 500,
            bitrate_window_ms: 1000,
            cameras: vec![CameraConfig {
                name: "mono".to_string(),
                role: CameraRole::Mono,
                port: 5500,
                device: "/dev/video0".to_string(),
            }],
            audio: Some(AudioServerConfig {
                name: "audio".to_string(),
                port: 5510,
                device: "hw:1".to_string(),
            }),
            default_video_format: StreamFormat::mjpeg(640, 480, 30, 50),
            default_audio_format: AudioFormat::ac3(32_000),
            streams: Vec::new(),
        }
    }
}

/// Which shared-channel commands drive a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraRole {
    StereoLeft,
    StereoRight,
    Mono,
    Aux1,
}

/// A rover-side camera server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CameraConfig {
    pub name: String,
    pub role: CameraRole,
    pub port: u16,
    pub device: String,
}

/// The rover-side audio server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioServerConfig {
    pub name: String,
    pub port: u16,
    pub device: String,
}

/// Kind of stream a station-side client consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Video,
    Audio,
}

/// A station-side media client
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamClientConfig {
    pub name: String,
    pub kind: StreamKind,
    pub port: u16,
    /// Local addresses each received datagram is re-sent to
    #[serde(default)]
    pub forward: Vec<SocketAddr>,
}

/// Operator-station mesh
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Master owns the rover connection; slaves reach it through the master
    pub master: bool,
    pub broadcast_port: u16,
    pub broadcast_address: IpAddr,
    pub broadcast_interval_ms: u64,
    pub prune_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            master: true,
            broadcast_port: DEFAULT_DISCOVERY_PORT,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            broadcast_interval_ms: 1000,
            prune_interval_ms: 10_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load from `path`, or from the platform config directory, or fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/rover-link/rover-link.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "rover-link", "rover-link")
            .map(|dirs| dirs.config_dir().join("rover-link.toml"))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}
