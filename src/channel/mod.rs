//! ReliableChannel
//!
//! A named, bidirectional message channel over TCP or UDP in either the client
//! or the server role. Each open channel is a tokio task that owns its socket
//! and timers; the [`Channel`] handle commands it and the paired
//! [`ChannelEvents`] receiver carries everything it reports.
//!
//! ```text
//!              handshake ok                     idle timeout / peer gone
//! Connecting ───────────────▶ Connected ───────────────────────────▶ Connecting
//!      │
//!      └── bind/listen failure ──▶ Error (terminal)
//! ```

pub mod latency;
pub mod stats;
mod task;

pub use stats::ChannelStats;

use bytes::Bytes;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::ChannelError;
use crate::network::socket::MAX_TCP_FRAME;
use crate::protocol::channel::{MAX_UDP_MESSAGE, PACKET_HEADER_LEN};

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for (or retrying) the handshake
    Connecting,
    /// Handshake complete, heartbeats flowing
    Connected,
    /// Unrecoverable socket failure; the channel must be recreated
    Error,
}

/// Which side initiates the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Channel timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTiming {
    /// Period of heartbeat probes while connected
    pub heartbeat_interval: Duration,
    /// Silence after which the link is declared dead
    pub idle_timeout: Duration,
    /// Period of statistics events while connected
    pub stats_interval: Duration,
    /// Delay between connection or handshake attempts
    pub reconnect_delay: Duration,
}

impl Default for ChannelTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_millis(2000),
            stats_interval: Duration::from_millis(1000),
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

/// Everything needed to open a channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Exchanged during the handshake; both ends must agree
    pub name: String,
    pub role: Role,
    pub transport: Transport,
    /// Peer address for clients, bind address for servers
    pub address: SocketAddr,
    pub timing: ChannelTiming,
    /// Extra latency applied to outbound application messages
    pub simulated_delay: Duration,
}

impl ChannelOptions {
    pub fn new(
        name: impl Into<String>,
        role: Role,
        transport: Transport,
        address: SocketAddr,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            transport,
            address,
            timing: ChannelTiming::default(),
            simulated_delay: Duration::ZERO,
        }
    }

    pub fn tcp_server(name: impl Into<String>, bind: SocketAddr) -> Self {
        Self::new(name, Role::Server, Transport::Tcp, bind)
    }

    pub fn tcp_client(name: impl Into<String>, peer: SocketAddr) -> Self {
        Self::new(name, Role::Client, Transport::Tcp, peer)
    }

    pub fn udp_server(name: impl Into<String>, bind: SocketAddr) -> Self {
        Self::new(name, Role::Server, Transport::Udp, bind)
    }

    pub fn udp_client(name: impl Into<String>, peer: SocketAddr) -> Self {
        Self::new(name, Role::Client, Transport::Udp, peer)
    }

    pub fn with_timing(mut self, timing: ChannelTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_simulated_delay(mut self, delay: Duration) -> Self {
        self.simulated_delay = delay;
        self
    }

    /// Largest application message this transport carries
    pub fn max_message_len(&self) -> usize {
        match self.transport {
            Transport::Udp => MAX_UDP_MESSAGE,
            Transport::Tcp => MAX_TCP_FRAME - PACKET_HEADER_LEN,
        }
    }
}

/// Notifications from a channel, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    MessageReceived(Bytes),
    Statistics(ChannelStats),
    /// Why the channel entered [`ChannelState::Error`]
    Failed(ChannelError),
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// State published by the task for the handle
#[derive(Debug)]
pub(crate) struct Status {
    pub state: ChannelState,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

pub(crate) enum Command {
    Send(Bytes),
    SetDelay(Duration),
}

/// Handle to one channel
///
/// Dropping the handle closes the channel.
pub struct Channel {
    options: ChannelOptions,
    events: mpsc::UnboundedSender<ChannelEvent>,
    status: Arc<RwLock<Status>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl Channel {
    /// Create a closed channel and the receiver for its events
    pub fn new(options: ChannelOptions) -> (Self, ChannelEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let channel = Self {
            options,
            events,
            status: Arc::new(RwLock::new(Status {
                state: ChannelState::Connecting,
                local_addr: None,
                peer_addr: None,
            })),
            commands: None,
            task: None,
        };
        (channel, receiver)
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Bind and start connecting
    ///
    /// Must be called from within a tokio runtime. A socket that cannot be
    /// created or bound puts the channel into [`ChannelState::Error`].
    pub fn open(&mut self) -> Result<(), ChannelError> {
        if self.task.is_some() {
            return Err(ChannelError::AlreadyOpen);
        }

        let link = match task::bind(&self.options) {
            Ok(link) => link,
            Err(e) => {
                error!("Channel({}): {}", self.options.name, e);
                self.status.write().state = ChannelState::Error;
                let _ = self.events.send(ChannelEvent::StateChanged(ChannelState::Error));
                let _ = self.events.send(ChannelEvent::Failed(e.clone()));
                return Err(e);
            }
        };

        {
            let mut status = self.status.write();
            status.state = ChannelState::Connecting;
            status.local_addr = link.local_addr();
            status.peer_addr = None;
        }

        let (commands, receiver) = mpsc::unbounded_channel();
        let task = task::ChannelTask::new(
            self.options.clone(),
            link,
            self.events.clone(),
            self.status.clone(),
            receiver,
        );
        self.task = Some(tokio::spawn(task.run()));
        self.commands = Some(commands);
        debug!("Channel({}): opened", self.options.name);
        Ok(())
    }

    /// Queue a message for the peer
    ///
    /// Returns false (and drops the message) unless the channel is connected.
    pub fn send_message(&self, message: impl Into<Bytes>) -> bool {
        let message = message.into();
        if self.state() != ChannelState::Connected {
            return false;
        }
        if message.len() > self.options.max_message_len() {
            warn!(
                "Channel({}): dropping {} byte message, limit is {}",
                self.options.name,
                message.len(),
                self.options.max_message_len()
            );
            return false;
        }
        match &self.commands {
            Some(commands) => commands.send(Command::Send(message)).is_ok(),
            None => false,
        }
    }

    /// Change the artificial outbound latency (zero disables it)
    pub fn set_simulated_delay(&mut self, delay: Duration) {
        self.options.simulated_delay = delay;
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::SetDelay(delay));
        }
    }

    pub fn simulated_delay(&self) -> Duration {
        self.options.simulated_delay
    }

    /// Release the socket and stop all timers
    pub fn close(&mut self) {
        self.commands = None;
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Channel({}): closed", self.options.name);
        }
        let mut status = self.status.write();
        if status.state != ChannelState::Error {
            status.state = ChannelState::Connecting;
        }
        status.peer_addr = None;
    }

    pub fn is_open(&self) -> bool {
        self.task.is_some()
    }

    pub fn state(&self) -> ChannelState {
        self.status.read().state
    }

    /// Bound address, available once a server or UDP channel is open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.status.read().local_addr
    }

    /// Address of the connected peer
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.status.read().peer_addr
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_dropped_before_open() {
        let (channel, _events) =
            Channel::new(ChannelOptions::tcp_client("drive", "127.0.0.1:9".parse().unwrap()));
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert!(!channel.send_message(&b"go"[..]));
    }

    #[test]
    fn test_message_limits() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_eq!(
            ChannelOptions::udp_client("a", addr).max_message_len(),
            65_000
        );
        assert!(ChannelOptions::tcp_client("a", addr).max_message_len() > 65_000);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let (mut channel, mut events) = Channel::new(ChannelOptions::tcp_server("shared", addr));
        assert!(channel.open().is_err());
        assert_eq!(channel.state(), ChannelState::Error);
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::StateChanged(ChannelState::Error))
        );
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Failed(ChannelError::BindFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_open_twice() {
        let (mut channel, _events) =
            Channel::new(ChannelOptions::udp_server("drive", "127.0.0.1:0".parse().unwrap()));
        channel.open().unwrap();
        assert!(channel.local_addr().is_some());
        assert_eq!(channel.open(), Err(ChannelError::AlreadyOpen));
        channel.close();
        assert!(!channel.is_open());
    }
}
