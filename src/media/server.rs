//! Rover-side media server
//!
//! Owns a TCP control channel bound on the stream's address and, while
//! waiting for a client, a UDP socket bound to the same address. Once the
//! client's punch arrives the socket is released so the encoder can bind it.

use parking_lot::RwLock;
use std::io;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use super::encoder::{exit_status_to_result, EncoderLauncher};
use super::{MediaFormat, MediaState};
use crate::channel::{Channel, ChannelEvent, ChannelEvents, ChannelOptions, ChannelState, ChannelTiming};
use crate::error::{ChannelError, MediaError};
use crate::network::socket::create_udp_socket;
use crate::protocol::media::ControlMessage;

/// Longest punch datagram looked at
const PUNCH_BUFFER_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaServerTiming {
    /// Re-announce `start` if the client has not punched within this period
    pub handshake_retry: Duration,
    /// Retry period for a failed data socket bind, and the poll period while
    /// the control channel is down
    pub bind_retry: Duration,
    pub channel: ChannelTiming,
}

impl Default for MediaServerTiming {
    fn default() -> Self {
        Self {
            handshake_retry: Duration::from_millis(3000),
            bind_retry: Duration::from_millis(500),
            channel: ChannelTiming::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaServerEvent {
    StateChanged(MediaState),
    /// The encoder finished normally
    Eos,
    Error(MediaError),
}

pub type MediaServerEvents = mpsc::UnboundedReceiver<MediaServerEvent>;

enum Command<F> {
    Start { device: String, format: F },
    Stop,
}

#[derive(Debug)]
struct ServerStatus<F> {
    state: MediaState,
    format: Option<F>,
}

/// Handle to a media server
///
/// Dropping the handle kills a running encoder and closes all sockets.
pub struct MediaServer<F: MediaFormat> {
    name: String,
    address: SocketAddr,
    commands: mpsc::UnboundedSender<Command<F>>,
    status: Arc<RwLock<ServerStatus<F>>>,
    task: JoinHandle<()>,
}

impl<F: MediaFormat> MediaServer<F> {
    /// Open the control channel on `host` and wait for a client
    ///
    /// `host` may use port 0; [`MediaServer::address`] reports the port chosen.
    pub fn new(
        name: impl Into<String>,
        host: SocketAddr,
        launcher: Box<dyn EncoderLauncher>,
        timing: MediaServerTiming,
    ) -> Result<(Self, MediaServerEvents), ChannelError> {
        let name = name.into();
        info!("Media({}): creating server on {}", name, host);

        let (mut control, control_events) =
            Channel::new(ChannelOptions::tcp_server(name.clone(), host).with_timing(timing.channel));
        control.open()?;
        let address = control.local_addr().unwrap_or(host);

        let (events, receiver) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(ServerStatus {
            state: MediaState::Idle,
            format: None,
        }));

        let task = ServerTask {
            name: name.clone(),
            address,
            timing,
            launcher,
            control,
            control_events,
            events,
            commands: command_rx,
            status: status.clone(),
            state: MediaState::Idle,
            device: String::new(),
            format: None,
            socket: None,
            encoder: None,
            retry_at: None,
            buffer: [0u8; PUNCH_BUFFER_LEN],
        };
        let task = tokio::spawn(task.run());

        Ok((
            Self {
                name,
                address,
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

    /// Control and data address
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> MediaState {
        self.status.read().state
    }

    /// Format of the current session, if any
    pub fn format(&self) -> Option<F> {
        self.status.read().format.clone()
    }

    /// Begin a session, stopping any current one first
    pub fn start(&self, device: impl Into<String>, format: F) {
        let _ = self.commands.send(Command::Start {
            device: device.into(),
            format,
        });
    }

    /// End the session; does nothing while idle
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

impl<F: MediaFormat> Drop for MediaServer<F> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ServerTask<F> {
    name: String,
    address: SocketAddr,
    timing: MediaServerTiming,
    launcher: Box<dyn EncoderLauncher>,
    control: Channel,
    control_events: ChannelEvents,
    events: mpsc::UnboundedSender<MediaServerEvent>,
    commands: mpsc::UnboundedReceiver<Command<F>>,
    status: Arc<RwLock<ServerStatus<F>>>,
    state: MediaState,
    device: String,
    format: Option<F>,
    socket: Option<UdpSocket>,
    encoder: Option<Child>,
    retry_at: Option<Instant>,
    buffer: [u8; PUNCH_BUFFER_LEN],
}

impl<F: MediaFormat> ServerTask<F> {
    async fn run(mut self) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start { device, format }) => self.start(device, format).await,
                    Some(Command::Stop) => self.stop().await,
                    None => break,
                },
                Some(event) = self.control_events.recv() => self.on_control_event(event).await,
                received = recv(&self.socket, &mut self.buffer) => match received {
                    Ok((len, from)) => self.on_punch(len, from),
                    Err(e) => {
                        warn!("Media({}): data socket error: {}", self.name, e);
                        self.socket = None;
                        self.schedule(self.timing.bind_retry);
                    }
                },
                status = wait(&mut self.encoder) => self.on_encoder_exit(status),
                _ = time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.start_internal();
                }
            }
        }

        if let Some(mut encoder) = self.encoder.take() {
            let _ = encoder.start_kill();
        }
    }

    fn set_state(&mut self, state: MediaState) {
        if self.state != state {
            info!("Media({}): {:?}", self.name, state);
            self.state = state;
            {
                let mut status = self.status.write();
                status.state = state;
                status.format = self.format.clone();
            }
            let _ = self.events.send(MediaServerEvent::StateChanged(state));
        }
    }

    fn schedule(&mut self, after: Duration) {
        self.retry_at = Some(Instant::now() + after);
    }

    fn send_control(&self, message: ControlMessage<F>) {
        if !self.control.send_message(message.to_bytes()) {
            debug!("Media({}): control channel down, {} not sent", self.name, message.tag());
        }
    }

    async fn start(&mut self, device: String, format: F) {
        info!("Media({}): start requested for {}", self.name, device);
        if self.state != MediaState::Idle {
            self.stop().await;
        }
        if !format.is_usable() {
            warn!("Media({}): starting with an unusable format, no client will be accepted", self.name);
        }
        self.device = device;
        self.format = Some(format);
        self.set_state(MediaState::Waiting);
        self.start_internal();
    }

    /// Announce the stream, or poll until the control channel is up
    fn start_internal(&mut self) {
        if self.state != MediaState::Waiting {
            return;
        }
        if self.control.state() != ChannelState::Connected {
            debug!("Media({}): waiting for client to connect", self.name);
            self.schedule(self.timing.bind_retry);
            return;
        }
        if self.socket.is_none() {
            match create_udp_socket(self.address, false, false) {
                Ok(socket) => self.socket = Some(socket),
                Err(e) => {
                    error!("Media({}): cannot bind data port {}: {}", self.name, self.address, e);
                    self.schedule(self.timing.bind_retry);
                    return;
                }
            }
        }
        info!("Media({}): announcing stream to client", self.name);
        self.send_control(ControlMessage::Start);
        self.schedule(self.timing.handshake_retry);
    }

    fn on_punch(&mut self, len: usize, from: SocketAddr) {
        if self.state != MediaState::Waiting {
            return;
        }
        let payload = &self.buffer[..len];
        let payload = payload.strip_suffix(&[0]).unwrap_or(payload);
        if payload != self.name.as_bytes() {
            warn!("Media({}): unexpected datagram from {}", self.name, from);
            return;
        }
        if self.control.state() != ChannelState::Connected {
            warn!("Media({}): punch from {} ignored, control channel is down", self.name, from);
            return;
        }
        let format = match &self.format {
            Some(format) if format.is_usable() => format.clone(),
            _ => {
                warn!("Media({}): punch from {} ignored, format is not usable", self.name, from);
                return;
            }
        };

        info!("Media({}): client completed handshake from {}", self.name, from);
        self.send_control(ControlMessage::Streaming(format.clone()));
        // The encoder binds this port next
        self.socket = None;
        self.retry_at = None;

        let mut args = Vec::with_capacity(10);
        args.push(self.device.clone());
        args.extend(format.encoder_args());
        args.push(from.ip().to_string());
        args.push(from.port().to_string());
        args.push(self.address.ip().to_string());
        args.push(self.address.port().to_string());

        match self.launcher.launch(&args) {
            Ok(child) => {
                debug!("Media({}): encoder started with {:?}", self.name, args);
                self.encoder = Some(child);
                self.set_state(MediaState::Streaming);
            }
            Err(e) => {
                error!("Media({}): failed to launch encoder: {}", self.name, e);
                let err = MediaError::LaunchFailed(e.to_string());
                self.send_control(ControlMessage::Error(err.to_string()));
                let _ = self.events.send(MediaServerEvent::Error(err));
                self.format = None;
                self.set_state(MediaState::Idle);
            }
        }
    }

    fn on_encoder_exit(&mut self, status: io::Result<ExitStatus>) {
        self.encoder = None;
        let result = match status {
            Ok(status) => {
                info!("Media({}): encoder exited ({})", self.name, status);
                exit_status_to_result(status)
            }
            Err(e) => {
                error!("Media({}): lost track of encoder: {}", self.name, e);
                Err(MediaError::Unknown(None))
            }
        };
        match result {
            Ok(()) => {
                self.send_control(ControlMessage::Eos);
                let _ = self.events.send(MediaServerEvent::Eos);
            }
            Err(err) => {
                error!("Media({}): {}", self.name, err);
                self.send_control(ControlMessage::Error(err.to_string()));
                let _ = self.events.send(MediaServerEvent::Error(err));
            }
        }
        self.format = None;
        self.set_state(MediaState::Idle);
    }

    async fn stop(&mut self) {
        if self.state == MediaState::Idle {
            debug!("Media({}): stop() while idle", self.name);
            return;
        }
        if let Some(mut encoder) = self.encoder.take() {
            info!("Media({}): killing encoder", self.name);
            let _ = encoder.start_kill();
            let _ = encoder.wait().await;
        }
        self.device.clear();
        self.format = None;
        if self.control.state() == ChannelState::Connected {
            self.send_control(ControlMessage::Eos);
        }
        self.socket = None;
        self.retry_at = None;
        self.set_state(MediaState::Idle);
    }

    async fn on_control_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged(ChannelState::Connected) => {
                if self.state == MediaState::Waiting {
                    self.retry_at = None;
                    self.start_internal();
                }
            }
            ChannelEvent::StateChanged(state) => {
                if self.state == MediaState::Streaming {
                    warn!("Media({}): control channel lost while streaming", self.name);
                    self.stop().await;
                } else if self.state == MediaState::Waiting {
                    debug!("Media({}): control channel {:?}, releasing data port", self.name, state);
                    // Rebound and announced again once the client is back
                    self.socket = None;
                } else {
                    debug!("Media({}): control channel {:?}", self.name, state);
                }
            }
            ChannelEvent::Failed(e) => {
                error!("Media({}): control channel failed: {}", self.name, e);
            }
            ChannelEvent::MessageReceived(_) | ChannelEvent::Statistics(_) => {}
        }
    }
}

async fn recv(socket: &Option<UdpSocket>, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buffer).await,
        None => std::future::pending().await,
    }
}

async fn wait(encoder: &mut Option<Child>) -> io::Result<ExitStatus> {
    match encoder {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}
