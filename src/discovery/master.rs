//! Master station
//!
//! Connects to the rover, accepts slaves found by broadcast and relays shared
//! messages between all of them.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::relay::{Origin, RelayRouter, Target};
use super::{
    DiscoveryTiming, StationEvent, StationEvents, DISCOVERY_TOKEN, PEER_CHANNEL_NAME,
    SHARED_CHANNEL_NAME,
};
use crate::channel::{Channel, ChannelEvent, ChannelOptions, ChannelState};
use crate::error::DiscoveryError;
use crate::network::socket::create_udp_socket;

#[derive(Debug)]
struct MasterStatus {
    rover_state: ChannelState,
    peers: Vec<SocketAddr>,
    listen_addr: SocketAddr,
}

/// Handle to the master station
pub struct MasterStation {
    commands: mpsc::UnboundedSender<Bytes>,
    status: Arc<RwLock<MasterStatus>>,
    task: JoinHandle<()>,
}

impl MasterStation {
    /// Connect to the rover's shared channel and listen for slaves on `listen`
    pub fn new(
        rover: SocketAddr,
        listen: SocketAddr,
        timing: DiscoveryTiming,
    ) -> Result<(Self, StationEvents), DiscoveryError> {
        let socket = create_udp_socket(listen, true, true).map_err(|e| {
            error!("Master: unable to bind broadcast port {}: {}", listen.port(), e);
            DiscoveryError::BroadcastBind {
                port: listen.port(),
                reason: e.to_string(),
            }
        })?;
        let listen_addr = socket.local_addr().unwrap_or(listen);
        info!("Master: listening for stations on {}", listen_addr);

        let (mut rover_channel, rover_events) = Channel::new(
            ChannelOptions::tcp_client(SHARED_CHANNEL_NAME, rover).with_timing(timing.channel),
        );
        rover_channel
            .open()
            .map_err(|e| DiscoveryError::SharedChannel(e.to_string()))?;

        let (events, receiver) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (peer_events, peer_event_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(MasterStatus {
            rover_state: ChannelState::Connecting,
            peers: Vec::new(),
            listen_addr,
        }));

        let task = MasterTask {
            timing,
            socket,
            rover: rover_channel,
            rover_events,
            peers: HashMap::new(),
            router: RelayRouter::new(),
            peer_events,
            peer_event_rx,
            events,
            commands: command_rx,
            status: status.clone(),
            buffer: [0u8; 64],
        };
        let task = tokio::spawn(task.run());

        Ok((
            Self {
                commands,
                status,
                task,
            },
            receiver,
        ))
    }

    /// Send a locally originated shared message to the rover and every peer
    pub fn send(&self, payload: impl Into<Bytes>) {
        let _ = self.commands.send(payload.into());
    }

    pub fn rover_state(&self) -> ChannelState {
        self.status.read().rover_state
    }

    /// Peers currently known, connected or not
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.status.read().peers.clone()
    }

    /// Address the discovery listener is bound to
    pub fn listen_addr(&self) -> SocketAddr {
        self.status.read().listen_addr
    }
}

impl Drop for MasterStation {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Peer {
    channel: Channel,
    created: Instant,
    joined: bool,
    forwarder: JoinHandle<()>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

struct MasterTask {
    timing: DiscoveryTiming,
    socket: UdpSocket,
    rover: Channel,
    rover_events: mpsc::UnboundedReceiver<ChannelEvent>,
    peers: HashMap<SocketAddr, Peer>,
    router: RelayRouter,
    peer_events: mpsc::UnboundedSender<(SocketAddr, ChannelEvent)>,
    peer_event_rx: mpsc::UnboundedReceiver<(SocketAddr, ChannelEvent)>,
    events: mpsc::UnboundedSender<StationEvent>,
    commands: mpsc::UnboundedReceiver<Bytes>,
    status: Arc<RwLock<MasterStatus>>,
    buffer: [u8; 64],
}

impl MasterTask {
    async fn run(mut self) {
        let period = self.timing.prune_interval;
        let mut prune = time::interval_at(Instant::now() + period, period);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                payload = self.commands.recv() => match payload {
                    Some(payload) => self.relay(Origin::Local, payload),
                    None => break,
                },
                Some(event) = self.rover_events.recv() => self.on_rover_event(event),
                Some((peer, event)) = self.peer_event_rx.recv() => self.on_peer_event(peer, event),
                received = self.socket.recv_from(&mut self.buffer) => match received {
                    Ok((len, from)) => self.on_datagram(len, from),
                    Err(e) => warn!("Master: broadcast socket error: {}", e),
                },
                _ = prune.tick() => self.prune(),
            }
        }
    }

    fn emit(&self, event: StationEvent) {
        let _ = self.events.send(event);
    }

    fn publish_peers(&self) {
        self.status.write().peers = self.router.peers().to_vec();
    }

    fn on_datagram(&mut self, len: usize, from: SocketAddr) {
        if &self.buffer[..len] != DISCOVERY_TOKEN {
            trace!("Master: ignoring {} byte datagram from {}", len, from);
            return;
        }
        if !self.router.register(from) {
            trace!("Master: {} already known", from);
            return;
        }

        info!("Master: station found at {}, connecting", from);
        let (mut channel, mut channel_events) = Channel::new(
            ChannelOptions::tcp_client(PEER_CHANNEL_NAME, from).with_timing(self.timing.channel),
        );
        if let Err(e) = channel.open() {
            error!("Master: cannot open channel to {}: {}", from, e);
            self.router.unregister(&from);
            return;
        }

        let sink = self.peer_events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = channel_events.recv().await {
                if sink.send((from, event)).is_err() {
                    break;
                }
            }
        });

        self.peers.insert(
            from,
            Peer {
                channel,
                created: Instant::now(),
                joined: false,
                forwarder,
            },
        );
        self.publish_peers();
    }

    fn on_rover_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged(state) => {
                info!("Master: rover {:?}", state);
                self.status.write().rover_state = state;
                self.emit(StationEvent::RoverState(state));
            }
            ChannelEvent::MessageReceived(payload) => self.relay(Origin::Rover, payload),
            ChannelEvent::Failed(e) => {
                error!("Master: shared channel failed: {}", e);
                self.emit(StationEvent::Fatal(DiscoveryError::SharedChannel(
                    e.to_string(),
                )));
            }
            ChannelEvent::Statistics(_) => {}
        }
    }

    fn on_peer_event(&mut self, address: SocketAddr, event: ChannelEvent) {
        let Some(peer) = self.peers.get_mut(&address) else {
            return;
        };
        match event {
            ChannelEvent::StateChanged(ChannelState::Connected) => {
                if !peer.joined {
                    peer.joined = true;
                    info!("Master: station {} joined", address);
                    self.emit(StationEvent::PeerJoined(address));
                }
            }
            ChannelEvent::StateChanged(state) => {
                debug!("Master: station {} {:?}", address, state);
            }
            ChannelEvent::MessageReceived(payload) => self.relay(Origin::Peer(address), payload),
            ChannelEvent::Failed(e) => {
                warn!("Master: channel to {} failed: {}", address, e);
            }
            ChannelEvent::Statistics(_) => {}
        }
    }

    /// Deliver a message along the relay rule
    fn relay(&mut self, origin: Origin, payload: Bytes) {
        if origin != Origin::Local {
            self.emit(StationEvent::Message {
                origin,
                payload: payload.clone(),
            });
        }

        let mut delivered = 0;
        for target in self.router.route(origin) {
            let sent = match target {
                Target::Rover => self.rover.send_message(payload.clone()),
                Target::Peer(address) => self
                    .peers
                    .get(&address)
                    .map(|peer| peer.channel.send_message(payload.clone()))
                    .unwrap_or(false),
            };
            if sent {
                delivered += 1;
            }
        }
        self.router.record(payload.len(), delivered);
    }

    /// Drop peers that have had a full period to connect and are not connected
    fn prune(&mut self) {
        let now = Instant::now();
        let period = self.timing.prune_interval;
        let dead: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.channel.state() != ChannelState::Connected
                    && now.duration_since(peer.created) >= period
            })
            .map(|(address, _)| *address)
            .collect();

        for address in dead {
            info!("Master: dropping station {}", address);
            if let Some(peer) = self.peers.remove(&address) {
                self.router.unregister(&address);
                if peer.joined {
                    self.emit(StationEvent::PeerLeft(address));
                }
            }
        }
        self.publish_peers();
    }
}
