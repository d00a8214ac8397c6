//! Media control plane
//!
//! A [`MediaServer`] on the rover and a [`MediaClient`] on a station negotiate
//! a stream over a TCP control channel, learn the client's UDP address with a
//! punch datagram, and hand the data path to an external encoder process.

pub mod client;
pub mod encoder;
pub mod format;
pub mod server;

pub use client::{ClientState, MediaClient, MediaClientEvent, MediaClientEvents, MediaClientTiming};
pub use encoder::{EncoderLauncher, ProcessLauncher};
pub use format::{AudioEncoding, AudioFormat, MediaFormat, StreamFormat, VideoEncoding};
pub use server::{MediaServer, MediaServerEvent, MediaServerEvents, MediaServerTiming};

use std::time::Duration;

use crate::channel::ChannelTiming;
use crate::config::MediaConfig;

/// Server-side session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    Idle,
    /// Announcing the stream, waiting for the client's punch
    Waiting,
    /// Encoder running
    Streaming,
}

pub type VideoServer = MediaServer<StreamFormat>;
pub type AudioServer = MediaServer<AudioFormat>;
pub type VideoClient = MediaClient<StreamFormat>;
pub type AudioClient = MediaClient<AudioFormat>;

impl MediaConfig {
    pub fn server_timing(&self, channel: ChannelTiming) -> MediaServerTiming {
        MediaServerTiming {
            handshake_retry: Duration::from_millis(self.handshake_retry_ms),
            bind_retry: Duration::from_millis(self.bind_retry_ms),
            channel,
        }
    }

    pub fn client_timing(&self, channel: ChannelTiming) -> MediaClientTiming {
        MediaClientTiming {
            punch_interval: Duration::from_millis(self.punch_interval_ms),
            bitrate_window: Duration::from_millis(self.bitrate_window_ms),
            channel,
        }
    }
}
