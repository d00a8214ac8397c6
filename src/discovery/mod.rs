//! Station discovery and relay
//!
//! The master station owns the rover's shared channel and listens for
//! discovery broadcasts. Slave stations announce themselves by broadcast and
//! accept a channel from the master, which then relays shared traffic between
//! the rover and every station.

pub mod master;
pub mod relay;
pub mod slave;

pub use master::MasterStation;
pub use relay::{Origin, RelayRouter, RelayStats, Target};
pub use slave::SlaveStation;

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::channel::{ChannelState, ChannelTiming};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;

/// Literal a slave broadcasts to find the master
pub const DISCOVERY_TOKEN: &[u8] = b"MissionControlChannel\0";

/// Name of the channel between master and slave
pub const PEER_CHANNEL_NAME: &str = "MissionControlChannel";

/// Name of the rover's shared channel
pub const SHARED_CHANNEL_NAME: &str = "SharedChannel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryTiming {
    /// Slave broadcast period while unconnected
    pub broadcast_interval: Duration,
    /// Master sweep period for dead peers
    pub prune_interval: Duration,
    pub channel: ChannelTiming,
}

impl Default for DiscoveryTiming {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_millis(1000),
            prune_interval: Duration::from_millis(10_000),
            channel: ChannelTiming::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timing(&self, channel: ChannelTiming) -> DiscoveryTiming {
        DiscoveryTiming {
            broadcast_interval: Duration::from_millis(self.broadcast_interval_ms),
            prune_interval: Duration::from_millis(self.prune_interval_ms),
            channel,
        }
    }
}

/// Notifications from a master or slave station
#[derive(Debug, Clone, PartialEq)]
pub enum StationEvent {
    /// State of this station's path to the rover
    RoverState(ChannelState),
    /// A shared message arrived
    Message { origin: Origin, payload: Bytes },
    PeerJoined(SocketAddr),
    PeerLeft(SocketAddr),
    /// The station cannot continue and must be recreated
    Fatal(DiscoveryError),
}

pub type StationEvents = mpsc::UnboundedReceiver<StationEvent>;
