//! Slave station
//!
//! Listens for the master on an ephemeral TCP port and broadcasts the
//! discovery token from the same port number until the master connects.

use bytes::Bytes;
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, trace, warn};

use super::relay::Origin;
use super::{DiscoveryTiming, StationEvent, StationEvents, DISCOVERY_TOKEN, PEER_CHANNEL_NAME};
use crate::channel::{Channel, ChannelEvent, ChannelEvents, ChannelOptions, ChannelState};
use crate::error::DiscoveryError;
use crate::network::socket::create_udp_socket;

/// Handle to a slave station
pub struct SlaveStation {
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Bytes>,
    state: Arc<RwLock<ChannelState>>,
    task: JoinHandle<()>,
}

impl SlaveStation {
    /// Bind on `host` and announce to `broadcast`
    pub fn new(
        host: IpAddr,
        broadcast: SocketAddr,
        timing: DiscoveryTiming,
    ) -> Result<(Self, StationEvents), DiscoveryError> {
        let (mut channel, channel_events) = Channel::new(
            ChannelOptions::tcp_server(PEER_CHANNEL_NAME, SocketAddr::new(host, 0))
                .with_timing(timing.channel),
        );
        channel
            .open()
            .map_err(|e| DiscoveryError::SharedChannel(e.to_string()))?;
        let local_addr = channel
            .local_addr()
            .ok_or_else(|| DiscoveryError::SharedChannel("listener has no address".to_string()))?;

        let socket = create_udp_socket(local_addr, true, false).map_err(|e| {
            error!("Slave: unable to bind broadcast port {}: {}", local_addr.port(), e);
            DiscoveryError::BroadcastBind {
                port: local_addr.port(),
                reason: e.to_string(),
            }
        })?;
        info!("Slave: waiting for master on {}", local_addr);

        let (events, receiver) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ChannelState::Connecting));

        let task = SlaveTask {
            timing,
            broadcast,
            socket,
            channel,
            channel_events,
            events,
            commands: command_rx,
            state: state.clone(),
            buffer: [0u8; 64],
        };
        let task = tokio::spawn(task.run());

        Ok((
            Self {
                local_addr,
                commands,
                state,
                task,
            },
            receiver,
        ))
    }

    /// TCP and broadcast port this station uses
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// State of the channel from the master
    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    /// Send a shared message; the master relays it onwards
    pub fn send(&self, payload: impl Into<Bytes>) {
        let _ = self.commands.send(payload.into());
    }
}

impl Drop for SlaveStation {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct SlaveTask {
    timing: DiscoveryTiming,
    broadcast: SocketAddr,
    socket: UdpSocket,
    channel: Channel,
    channel_events: ChannelEvents,
    events: mpsc::UnboundedSender<StationEvent>,
    commands: mpsc::UnboundedReceiver<Bytes>,
    state: Arc<RwLock<ChannelState>>,
    buffer: [u8; 64],
}

impl SlaveTask {
    async fn run(mut self) {
        let mut announce = time::interval(self.timing.broadcast_interval);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                payload = self.commands.recv() => match payload {
                    Some(payload) => {
                        if !self.channel.send_message(payload) {
                            trace!("Slave: not connected, message dropped");
                        }
                    }
                    None => break,
                },
                Some(event) = self.channel_events.recv() => self.on_channel_event(event),
                // Other stations' announcements land here too
                _ = self.socket.recv_from(&mut self.buffer) => {}
                _ = announce.tick(), if self.channel.state() != ChannelState::Connected => {
                    self.announce().await;
                }
            }
        }
    }

    async fn announce(&self) {
        trace!("Slave: announcing to {}", self.broadcast);
        if let Err(e) = self.socket.send_to(DISCOVERY_TOKEN, self.broadcast).await {
            warn!("Slave: broadcast failed: {}", e);
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged(state) => {
                info!("Slave: master link {:?}", state);
                *self.state.write() = state;
                let _ = self.events.send(StationEvent::RoverState(state));
            }
            ChannelEvent::MessageReceived(payload) => {
                let origin = match self.channel.peer_addr() {
                    Some(master) => Origin::Peer(master),
                    None => Origin::Rover,
                };
                let _ = self.events.send(StationEvent::Message { origin, payload });
            }
            ChannelEvent::Failed(e) => {
                error!("Slave: channel failed: {}", e);
                let _ = self
                    .events
                    .send(StationEvent::Fatal(DiscoveryError::SharedChannel(e.to_string())));
            }
            ChannelEvent::Statistics(_) => {}
        }
    }
}
