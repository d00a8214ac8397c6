//! Device channel
//!
//! Compact UDP protocol spoken with embedded controller boards. The protocol
//! logic lives in [`DeviceLink`]; [`DeviceChannel`] drives it from tokio on
//! the host, and [`DeviceEndpoint`] drives the device side from a blocking
//! poll loop.

pub mod endpoint;
pub mod link;

pub use endpoint::{BlockingDatagram, DeviceEndpoint, EndpointConfig, StdBlockingSocket};
pub use link::{Discard, DeviceLink, Inbound};

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

use crate::error::DeviceError;
use crate::network::socket::create_udp_socket;
use crate::protocol::device::{BROADCAST_TOKEN, MAX_DATAGRAM, MAX_PAYLOAD};

/// Delay before a socket error triggers a reset
const ERROR_RESET_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Connecting,
    Connected,
}

/// Host-side settings for one board
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub device_id: u8,
    /// Local address to bind
    pub bind: SocketAddr,
    /// Port the board sends from; usually the same as the bind port
    pub device_port: u16,
    /// Watchdog period
    pub idle_timeout: Duration,
    /// Where broadcast replies go; `None` replies to the sender only
    pub broadcast_address: Option<IpAddr>,
}

impl DeviceOptions {
    pub fn new(device_id: u8, bind: SocketAddr) -> Self {
        Self {
            device_id,
            bind,
            device_port: bind.port(),
            idle_timeout: Duration::from_millis(2000),
            broadcast_address: None,
        }
    }

    pub fn with_device_port(mut self, port: u16) -> Self {
        self.device_port = port;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_broadcast_address(mut self, address: Option<IpAddr>) -> Self {
        self.broadcast_address = address;
        self
    }
}

/// Notifications from a device channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    StateChanged(DeviceState),
    /// Application payload from the board
    Message(Bytes),
    /// Text the board logged remotely
    Log(String),
}

pub type DeviceEvents = mpsc::UnboundedReceiver<DeviceEvent>;

#[derive(Debug)]
struct DeviceStatus {
    state: DeviceState,
    local_addr: Option<SocketAddr>,
}

/// Handle to the host side of one board's channel
///
/// Dropping the handle stops the channel and closes its socket.
pub struct DeviceChannel {
    device_id: u8,
    commands: mpsc::UnboundedSender<Bytes>,
    status: Arc<RwLock<DeviceStatus>>,
    task: JoinHandle<()>,
}

impl DeviceChannel {
    /// Bind and start listening for the board
    ///
    /// A failed bind is logged and retried; it never prevents creation.
    pub fn open(options: DeviceOptions) -> (Self, DeviceEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let status = Arc::new(RwLock::new(DeviceStatus {
            state: DeviceState::Connecting,
            local_addr: None,
        }));

        let mut task = DeviceTask {
            link: DeviceLink::new(options.device_id, options.device_port),
            options,
            socket: None,
            events,
            commands: command_rx,
            status: status.clone(),
            buffer: vec![0u8; MAX_DATAGRAM].into_boxed_slice(),
            reset_at: None,
        };
        info!("Device({}): creating channel", task.options.device_id);
        task.bind();

        let device_id = task.options.device_id;
        let handle = tokio::spawn(task.run());
        (
            Self {
                device_id,
                commands,
                status,
                task: handle,
            },
            receiver,
        )
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn state(&self) -> DeviceState {
        self.status.read().state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.status.read().local_addr
    }

    /// Send an application payload to the board
    pub fn send_message(&self, payload: impl Into<Bytes>) -> Result<(), DeviceError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(DeviceError::PayloadTooLarge(payload.len()));
        }
        if self.state() != DeviceState::Connected {
            return Err(DeviceError::NotConnected);
        }
        self.commands
            .send(payload)
            .map_err(|_| DeviceError::Interface("device task stopped".to_string()))
    }
}

impl Drop for DeviceChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct DeviceTask {
    options: DeviceOptions,
    link: DeviceLink,
    socket: Option<UdpSocket>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    commands: mpsc::UnboundedReceiver<Bytes>,
    status: Arc<RwLock<DeviceStatus>>,
    buffer: Box<[u8]>,
    reset_at: Option<Instant>,
}

impl DeviceTask {
    async fn run(mut self) {
        let period = self.options.idle_timeout;
        let mut watchdog = time::interval_at(Instant::now() + period, period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reset_at = self.reset_at;
            tokio::select! {
                payload = self.commands.recv() => match payload {
                    Some(payload) => self.send(&payload).await,
                    None => break,
                },
                received = recv(&self.socket, &mut self.buffer), if self.socket.is_some() => {
                    match received {
                        Ok((len, from)) => self.on_datagram(len, from).await,
                        Err(e) => self.on_socket_error(e),
                    }
                }
                _ = watchdog.tick() => {
                    if self.link.watchdog_tick() {
                        warn!("Device({}): timed out", self.options.device_id);
                        self.reset();
                    }
                }
                _ = time::sleep_until(reset_at.unwrap_or_else(Instant::now)), if reset_at.is_some() => {
                    self.reset_at = None;
                    self.reset();
                }
            }
        }
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self, state: DeviceState) {
        info!("Device({}): {:?}", self.options.device_id, state);
        self.status.write().state = state;
        self.emit(DeviceEvent::StateChanged(state));
    }

    fn bind(&mut self) {
        self.socket = None;
        match create_udp_socket(self.options.bind, true, false) {
            Ok(socket) => {
                let local = socket.local_addr().ok();
                info!(
                    "Device({}): listening on {}",
                    self.options.device_id, self.options.bind
                );
                // Later rebinds reuse the port the OS picked
                if let Some(local) = local {
                    self.options.bind = local;
                }
                self.status.write().local_addr = local;
                self.socket = Some(socket);
            }
            Err(e) => {
                error!(
                    "Device({}): failed to bind {}: {}",
                    self.options.device_id, self.options.bind, e
                );
                self.schedule_reset();
            }
        }
    }

    /// Close and rebind the socket with fresh protocol state
    fn reset(&mut self) {
        debug!("Device({}): resetting connection", self.options.device_id);
        if let Some(state) = self.link.reset() {
            self.publish(state);
        }
        self.bind();
    }

    fn schedule_reset(&mut self) {
        if self.reset_at.is_none() {
            self.reset_at = Some(Instant::now() + ERROR_RESET_DELAY);
        }
    }

    fn on_socket_error(&mut self, e: io::Error) {
        error!("Device({}): socket error: {}", self.options.device_id, e);
        self.schedule_reset();
    }

    async fn send(&mut self, payload: &[u8]) {
        let Some(target) = self.link.peer() else {
            trace!("Device({}): no peer, message dropped", self.options.device_id);
            return;
        };
        let len = match self.link.encode_message(payload, &mut self.buffer) {
            Ok(len) => len,
            Err(e) => {
                trace!("Device({}): message dropped: {}", self.options.device_id, e);
                return;
            }
        };
        if let Some(socket) = &self.socket {
            if let Err(e) = socket.send_to(&self.buffer[..len], target).await {
                self.on_socket_error(e);
            }
        }
    }

    async fn on_datagram(&mut self, len: usize, from: SocketAddr) {
        let id = self.options.device_id;
        let received = self
            .link
            .receive(&self.buffer[..len], from, Instant::now().into_std());

        if let Some(state) = received.transition {
            info!("Device({}): heard from {}", id, from);
            self.status.write().state = state;
            let _ = self.events.send(DeviceEvent::StateChanged(state));
        }

        let mut answer_broadcast = false;
        match received.inbound {
            Inbound::Message(payload) => {
                let _ = self
                    .events
                    .send(DeviceEvent::Message(Bytes::copy_from_slice(payload)));
            }
            Inbound::Log(text) => {
                let text = String::from_utf8_lossy(text)
                    .trim_end_matches('\0')
                    .to_string();
                info!("Device({}) says: {}", id, text);
                let _ = self.events.send(DeviceEvent::Log(text));
            }
            Inbound::Broadcast => answer_broadcast = true,
            Inbound::Heartbeat | Inbound::Ignored => {}
            Inbound::Discarded(Discard::Stale(seq)) => {
                trace!("Device({}): stale sequence {} dropped", id, seq);
            }
            Inbound::Discarded(reason) => {
                warn!("Device({}): invalid datagram from {}: {:?}", id, from, reason);
            }
        }

        if answer_broadcast {
            let target = match self.options.broadcast_address {
                Some(address) => SocketAddr::new(address, self.options.device_port),
                None => from,
            };
            debug!("Device({}): answering broadcast via {}", id, target);
            if let Some(socket) = &self.socket {
                if let Err(e) = socket.send_to(BROADCAST_TOKEN, target).await {
                    self.on_socket_error(e);
                }
            }
        }
    }
}

async fn recv(socket: &Option<UdpSocket>, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buffer).await,
        None => std::future::pending().await,
    }
}
