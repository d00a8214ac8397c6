//! Error types for the rover link

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Channel transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Socket setup failed: {0}")]
    SocketSetup(String),

    #[error("Channel is already open")]
    AlreadyOpen,

    #[error("Channel is closed")]
    Closed,

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Device channel errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Device is not connected")]
    NotConnected,

    #[error("Network interface failure: {0}")]
    Interface(String),

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Media control plane errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Capture hardware error")]
    CaptureHardware,

    #[error("Encoder error")]
    Encoder,

    #[error("Encoder rejected its arguments")]
    BadArguments,

    #[error("Unknown encoder fault (exit status {0:?})")]
    Unknown(Option<i32>),

    #[error("Failed to launch encoder: {0}")]
    LaunchFailed(String),

    #[error("Format is not usable")]
    UnusableFormat,

    #[error("Server reported: {0}")]
    Remote(String),
}

/// Discovery and relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Unable to bind broadcast port {port}: {reason}")]
    BroadcastBind { port: u16, reason: String },

    #[error("Shared channel failed: {0}")]
    SharedChannel(String),
}

/// Wire decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Packet truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Unknown packet kind: {0}")]
    UnknownKind(u8),

    #[error("Unknown message tag: {0}")]
    UnknownTag(i32),

    #[error("Unknown control message: {0}")]
    UnknownControl(String),

    #[error("Unknown encoding id: {0}")]
    UnknownEncoding(u32),

    #[error("Invalid UTF-8 text")]
    InvalidText,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
