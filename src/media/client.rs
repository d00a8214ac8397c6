//! Station-side media client
//!
//! Connects the control channel to a [`MediaServer`](super::MediaServer),
//! punches its UDP address when the server announces a stream, and relays
//! every received media datagram to the registered forwarding addresses.

use bytes::Bytes;
use parking_lot::RwLock;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::MediaFormat;
use crate::channel::{Channel, ChannelEvent, ChannelEvents, ChannelOptions, ChannelState, ChannelTiming};
use crate::error::{ChannelError, MediaError};
use crate::network::socket::create_udp_socket;
use crate::protocol::media::ControlMessage;

const MEDIA_BUFFER_LEN: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaClientTiming {
    /// Period of punch datagrams while the server is waiting for one
    pub punch_interval: Duration,
    /// Window the bitrate is averaged over
    pub bitrate_window: Duration,
    pub channel: ChannelTiming,
}

impl Default for MediaClientTiming {
    fn default() -> Self {
        Self {
            punch_interval: Duration::from_millis(500),
            bitrate_window: Duration::from_millis(1000),
            channel: ChannelTiming::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Control channel not connected
    Connecting,
    /// Connected, no stream running
    Connected,
    Streaming,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaClientEvent<F> {
    StateChanged(ClientState),
    /// The server started streaming with this format
    Streaming(F),
    Eos,
    /// The server reported a fault
    Error(MediaError),
    /// Received bits per second over the last window
    Bitrate(u64),
}

pub type MediaClientEvents<F> = mpsc::UnboundedReceiver<MediaClientEvent<F>>;

enum Command {
    AddForward(SocketAddr),
    RemoveForward(SocketAddr),
}

#[derive(Debug)]
struct ClientStatus<F> {
    state: ClientState,
    format: Option<F>,
    bitrate: u64,
    media_addr: Option<SocketAddr>,
}

/// Handle to a media client
pub struct MediaClient<F: MediaFormat> {
    name: String,
    server: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<RwLock<ClientStatus<F>>>,
    task: JoinHandle<()>,
}

impl<F: MediaFormat> MediaClient<F> {
    /// Connect to the server named `name` at `server`
    ///
    /// The media socket binds an ephemeral port on `host`.
    pub fn new(
        name: impl Into<String>,
        server: SocketAddr,
        host: IpAddr,
        timing: MediaClientTiming,
    ) -> Result<(Self, MediaClientEvents<F>), ChannelError> {
        let name = name.into();
        info!("Media({}): creating client for {}", name, server);

        let socket = create_udp_socket(SocketAddr::new(host, 0), false, false).map_err(|e| {
            ChannelError::BindFailed {
                addr: host.to_string(),
                reason: e.to_string(),
            }
        })?;
        let media_addr = socket.local_addr().ok();

        let (mut control, control_events) =
            Channel::new(ChannelOptions::tcp_client(name.clone(), server).with_timing(timing.channel));
        control.open()?;

        let (events, receiver) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(ClientStatus {
            state: ClientState::Connecting,
            format: None,
            bitrate: 0,
            media_addr,
        }));

        let task = ClientTask {
            name: name.clone(),
            server,
            timing,
            control,
            control_events,
            socket,
            events,
            commands: command_rx,
            status: status.clone(),
            state: ClientState::Connecting,
            punching: false,
            forwards: Vec::new(),
            bit_count: 0,
            buffer: vec![0u8; MEDIA_BUFFER_LEN].into_boxed_slice(),
        };
        let task = tokio::spawn(task.run());

        Ok((
            Self {
                name,
                server,
                commands,
                status,
                task,
            },
            receiver,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_address(&self) -> SocketAddr {
        self.server
    }

    /// Local address media datagrams arrive on
    pub fn media_address(&self) -> Option<SocketAddr> {
        self.status.read().media_addr
    }

    pub fn state(&self) -> ClientState {
        self.status.read().state
    }

    /// Format of the running stream
    pub fn format(&self) -> Option<F> {
        self.status.read().format.clone()
    }

    /// Bits per second over the last full window
    pub fn bitrate(&self) -> u64 {
        self.status.read().bitrate
    }

    pub fn add_forwarding_address(&self, address: SocketAddr) {
        let _ = self.commands.send(Command::AddForward(address));
    }

    pub fn remove_forwarding_address(&self, address: SocketAddr) {
        let _ = self.commands.send(Command::RemoveForward(address));
    }
}

impl<F: MediaFormat> Drop for MediaClient<F> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ClientTask<F> {
    name: String,
    server: SocketAddr,
    timing: MediaClientTiming,
    control: Channel,
    control_events: ChannelEvents,
    socket: UdpSocket,
    events: mpsc::UnboundedSender<MediaClientEvent<F>>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: Arc<RwLock<ClientStatus<F>>>,
    state: ClientState,
    punching: bool,
    forwards: Vec<SocketAddr>,
    bit_count: u64,
    buffer: Box<[u8]>,
}

impl<F: MediaFormat> ClientTask<F> {
    async fn run(mut self) {
        let mut punch = time::interval(self.timing.punch_interval);
        punch.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let window = self.timing.bitrate_window;
        let mut bitrate = time::interval_at(Instant::now() + window, window);
        bitrate.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = self.control_events.recv() => self.on_control_event(event),
                received = self.socket.recv_from(&mut self.buffer) => match received {
                    Ok((len, from)) => self.on_media(len, from).await,
                    Err(e) => warn!("Media({}): media socket error: {}", self.name, e),
                },
                _ = punch.tick(), if self.punching => self.send_punch().await,
                _ = bitrate.tick() => self.roll_bitrate(),
            }
        }
    }

    fn emit(&self, event: MediaClientEvent<F>) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state != state {
            info!("Media({}): {:?}", self.name, state);
            self.state = state;
            self.status.write().state = state;
            self.emit(MediaClientEvent::StateChanged(state));
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::AddForward(address) => {
                if !self.forwards.contains(&address) {
                    debug!("Media({}): forwarding to {}", self.name, address);
                    self.forwards.push(address);
                }
            }
            Command::RemoveForward(address) => {
                self.forwards.retain(|a| *a != address);
            }
        }
    }

    fn on_control_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged(ChannelState::Connected) => {
                self.set_state(ClientState::Connected);
            }
            ChannelEvent::StateChanged(_) => {
                self.punching = false;
                self.status.write().format = None;
                self.set_state(ClientState::Connecting);
            }
            ChannelEvent::MessageReceived(message) => self.on_control_message(message),
            ChannelEvent::Failed(e) => {
                error!("Media({}): control channel failed: {}", self.name, e);
            }
            ChannelEvent::Statistics(_) => {}
        }
    }

    fn on_control_message(&mut self, message: Bytes) {
        let message = match ControlMessage::<F>::decode(message) {
            Ok(message) => message,
            Err(e) => {
                warn!("Media({}): bad control message: {}", self.name, e);
                return;
            }
        };
        match message {
            ControlMessage::Start => {
                debug!("Media({}): server announced a stream, punching", self.name);
                self.punching = true;
            }
            ControlMessage::Streaming(format) => {
                info!("Media({}): server is streaming {:?}", self.name, format);
                self.punching = false;
                self.status.write().format = Some(format.clone());
                self.set_state(ClientState::Streaming);
                self.emit(MediaClientEvent::Streaming(format));
            }
            ControlMessage::Eos => {
                info!("Media({}): end of stream", self.name);
                self.punching = false;
                self.status.write().format = None;
                self.set_state(ClientState::Connected);
                self.emit(MediaClientEvent::Eos);
            }
            ControlMessage::Error(description) => {
                error!("Media({}): server error: {}", self.name, description);
                self.punching = false;
                self.status.write().format = None;
                self.set_state(ClientState::Connected);
                self.emit(MediaClientEvent::Error(MediaError::Remote(description)));
            }
        }
    }

    async fn send_punch(&mut self) {
        trace!("Media({}): punch to {}", self.name, self.server);
        if let Err(e) = self.socket.send_to(self.name.as_bytes(), self.server).await {
            warn!("Media({}): punch failed: {}", self.name, e);
        }
    }

    async fn on_media(&mut self, len: usize, from: SocketAddr) {
        if from.ip() != self.server.ip() {
            trace!("Media({}): ignoring datagram from {}", self.name, from);
            return;
        }
        self.bit_count += len as u64 * 8;
        for address in &self.forwards {
            if let Err(e) = self.socket.send_to(&self.buffer[..len], address).await {
                debug!("Media({}): forward to {} failed: {}", self.name, address, e);
            }
        }
    }

    fn roll_bitrate(&mut self) {
        let millis = self.timing.bitrate_window.as_millis().max(1) as u64;
        let bitrate = self.bit_count * 1000 / millis;
        self.bit_count = 0;
        self.status.write().bitrate = bitrate;
        if self.state == ClientState::Streaming {
            self.emit(MediaClientEvent::Bitrate(bitrate));
        }
    }
}
