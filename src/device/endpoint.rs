//! Device side of the device protocol
//!
//! Written for targets without an async runtime: everything happens inside
//! blocking calls with a receive timeout, driven by the caller's main loop.
//!
//! ```ignore
//! let mut endpoint = DeviceEndpoint::new(StdBlockingSocket::new(), config);
//! endpoint.connect()?;
//! let mut buf = [0u8; MAX_DATAGRAM];
//! loop {
//!     if let Some(len) = endpoint.poll(&mut buf)? {
//!         apply_command(&buf[..len]);
//!     }
//! }
//! ```

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::DeviceError;
use crate::protocol::device::{
    is_broadcast_token, write_datagram, DeviceHeader, DeviceMessageKind, HostHeader,
    BROADCAST_TOKEN, HEADER_LEN, MAX_DATAGRAM, MAX_PAYLOAD,
};
use crate::protocol::sequence::{SequenceFilter, SequencePolicy};

/// Blocking datagram socket the endpoint runs on
///
/// Implementations:
/// - [`StdBlockingSocket`] for hosted targets and testing
/// - board-specific network stacks
pub trait BlockingDatagram {
    /// (Re)initialise the interface and bind `port` with broadcast enabled
    fn open(&mut self, port: u16) -> Result<(), DeviceError>;

    /// Upper bound for a single receive
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), DeviceError>;

    fn send_to(&mut self, data: &[u8], dest: SocketAddr) -> Result<usize, DeviceError>;

    /// Receive one datagram, or `Ok(None)` when the timeout expires
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, DeviceError>;
}

/// [`BlockingDatagram`] over `std::net::UdpSocket`
#[derive(Default)]
pub struct StdBlockingSocket {
    socket: Option<UdpSocket>,
    timeout: Option<Duration>,
}

impl StdBlockingSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn socket(&self) -> Result<&UdpSocket, DeviceError> {
        self.socket
            .as_ref()
            .ok_or_else(|| DeviceError::Interface("socket not open".to_string()))
    }
}

impl BlockingDatagram for StdBlockingSocket {
    fn open(&mut self, port: u16) -> Result<(), DeviceError> {
        self.socket = None;
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = UdpSocket::bind(bind).map_err(|e| DeviceError::BindFailed {
            addr: bind.to_string(),
            reason: e.to_string(),
        })?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(self.timeout)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        self.timeout = Some(timeout);
        if let Some(socket) = &self.socket {
            socket.set_read_timeout(Some(timeout))?;
        }
        Ok(())
    }

    fn send_to(&mut self, data: &[u8], dest: SocketAddr) -> Result<usize, DeviceError> {
        Ok(self.socket()?.send_to(data, dest)?)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, DeviceError> {
        match self.socket()?.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Device-side settings
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub device_id: u8,
    /// Local port; the host expects datagrams from this port
    pub local_port: u16,
    /// Host address, or the subnet broadcast address when it is not known
    pub server: SocketAddr,
    /// Host-side idle timeout; receives wait a third of it
    pub idle_timeout: Duration,
    /// Pause between broadcast handshakes
    pub handshake_interval: Duration,
    /// Send a heartbeat when nothing was sent for this long
    pub heartbeat_after: Duration,
    pub sequence_policy: SequencePolicy,
    /// Give up connecting after this many handshakes (`None` retries forever)
    pub max_handshakes: Option<u32>,
}

impl EndpointConfig {
    pub fn new(device_id: u8, local_port: u16, server: SocketAddr) -> Self {
        Self {
            device_id,
            local_port,
            server,
            idle_timeout: Duration::from_millis(2000),
            handshake_interval: Duration::from_millis(200),
            heartbeat_after: Duration::from_secs(1),
            sequence_policy: SequencePolicy::Strict,
            max_handshakes: None,
        }
    }
}

/// Blocking, poll-driven device endpoint
pub struct DeviceEndpoint<T: BlockingDatagram> {
    transport: T,
    config: EndpointConfig,
    buffer: [u8; MAX_DATAGRAM],
    next_send: u32,
    filter: SequenceFilter,
    last_send: Instant,
    connected: bool,
}

impl<T: BlockingDatagram> DeviceEndpoint<T> {
    pub fn new(transport: T, config: EndpointConfig) -> Self {
        let filter = SequenceFilter::new(config.sequence_policy);
        Self {
            transport,
            config,
            buffer: [0u8; MAX_DATAGRAM],
            next_send: 0,
            filter,
            last_send: Instant::now(),
            connected: false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Bring the interface up and handshake until the host answers
    pub fn connect(&mut self) -> Result<(), DeviceError> {
        self.connected = false;
        self.next_send = 0;
        self.filter.reset();

        let mut attempts = 0u32;
        loop {
            if let Some(limit) = self.config.max_handshakes {
                if attempts >= limit {
                    return Err(DeviceError::Timeout);
                }
            }
            attempts += 1;

            if let Err(e) = self.open_interface() {
                warn!("Device({}): interface init failed: {}", self.config.device_id, e);
                thread::sleep(self.config.handshake_interval);
                continue;
            }

            if self.handshake_once()? {
                info!(
                    "Device({}): host answered, connected to {}",
                    self.config.device_id, self.config.server
                );
                self.connected = true;
                return Ok(());
            }
            thread::sleep(self.config.handshake_interval);
        }
    }

    fn open_interface(&mut self) -> Result<(), DeviceError> {
        self.transport.set_timeout(self.config.idle_timeout / 3)?;
        self.transport.open(self.config.local_port)
    }

    /// One broadcast plus draining replies until the receive times out
    fn handshake_once(&mut self) -> Result<bool, DeviceError> {
        if let Err(e) = self.send_raw(DeviceMessageKind::Broadcast, BROADCAST_TOKEN) {
            debug!("Device({}): handshake send failed: {}", self.config.device_id, e);
            return Ok(false);
        }
        let mut reply = [0u8; MAX_DATAGRAM];
        loop {
            match self.transport.recv_from(&mut reply) {
                Ok(Some((len, _))) if is_broadcast_token(&reply[..len]) => return Ok(true),
                Ok(Some(_)) => continue,
                Ok(None) => return Ok(false),
                Err(e) => {
                    debug!("Device({}): handshake receive failed: {}", self.config.device_id, e);
                    return Ok(false);
                }
            }
        }
    }

    fn send_raw(&mut self, kind: DeviceMessageKind, payload: &[u8]) -> Result<(), DeviceError> {
        let header = DeviceHeader::new(self.config.device_id, kind, self.next_send);
        let len = write_datagram(&mut self.buffer, header.to_bytes(), payload)
            .map_err(|_| DeviceError::PayloadTooLarge(payload.len()))?;
        self.next_send = self.next_send.wrapping_add(1);
        self.transport.send_to(&self.buffer[..len], self.config.server)?;
        self.last_send = Instant::now();
        Ok(())
    }

    /// Send, reconnecting first if the interface failed
    fn send_or_reconnect(&mut self, kind: DeviceMessageKind, payload: &[u8]) -> Result<(), DeviceError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(DeviceError::PayloadTooLarge(payload.len()));
        }
        match self.send_raw(kind, payload) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Device({}): send failed ({}), reconnecting", self.config.device_id, e);
                self.connect()?;
                Err(e)
            }
        }
    }

    /// Send an application payload to the host
    pub fn send(&mut self, payload: &[u8]) -> Result<(), DeviceError> {
        self.send_or_reconnect(DeviceMessageKind::Normal, payload)
    }

    /// Send a line of text to the host's log
    pub fn send_log(&mut self, text: &str) -> Result<(), DeviceError> {
        let bytes = text.as_bytes();
        let len = bytes.len().min(MAX_PAYLOAD);
        self.send_or_reconnect(DeviceMessageKind::Log, &bytes[..len])
    }

    /// Heartbeat if due, then wait for one host message
    ///
    /// Returns the payload length copied into `out`, or `None` if nothing
    /// valid arrived before the receive timeout.
    pub fn poll(&mut self, out: &mut [u8]) -> Result<Option<usize>, DeviceError> {
        if self.last_send.elapsed() >= self.config.heartbeat_after {
            self.send_or_reconnect(DeviceMessageKind::Heartbeat, &[])?;
        }

        let (len, from) = match self.transport.recv_from(&mut self.buffer) {
            Ok(Some(received)) => received,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Device({}): receive failed ({}), reconnecting", self.config.device_id, e);
                self.connect()?;
                return Ok(None);
            }
        };

        if from.port() != self.config.server.port() {
            return Ok(None);
        }
        let Some(header) = HostHeader::parse(&self.buffer[..len]) else {
            return Ok(None);
        };
        if header.device_id != self.config.device_id {
            return Ok(None);
        }
        if !self.filter.accept(header.sequence, Instant::now()) {
            debug!(
                "Device({}): stale sequence {} dropped",
                self.config.device_id, header.sequence
            );
            return Ok(None);
        }

        let payload = &self.buffer[HEADER_LEN..len];
        let copied = payload.len().min(out.len());
        out[..copied].copy_from_slice(&payload[..copied]);
        Ok(Some(copied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const HOST: u16 = 5400;

    /// Scripted transport recording everything sent
    #[derive(Default)]
    struct MockDatagram {
        opened: u32,
        sent: Vec<Vec<u8>>,
        inbox: VecDeque<Result<Option<(Vec<u8>, SocketAddr)>, ()>>,
        fail_sends: u32,
    }

    impl BlockingDatagram for MockDatagram {
        fn open(&mut self, _port: u16) -> Result<(), DeviceError> {
            self.opened += 1;
            Ok(())
        }

        fn set_timeout(&mut self, _timeout: Duration) -> Result<(), DeviceError> {
            Ok(())
        }

        fn send_to(&mut self, data: &[u8], _dest: SocketAddr) -> Result<usize, DeviceError> {
            if self.fail_sends > 0 {
                self.fail_sends -= 1;
                return Err(DeviceError::Interface("link down".to_string()));
            }
            self.sent.push(data.to_vec());
            Ok(data.len())
        }

        fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, DeviceError> {
            match self.inbox.pop_front() {
                Some(Ok(Some((data, from)))) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(Some((data.len(), from)))
                }
                Some(Ok(None)) | None => Ok(None),
                Some(Err(())) => Err(DeviceError::Interface("receive failed".to_string())),
            }
        }
    }

    fn host() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], HOST))
    }

    fn config() -> EndpointConfig {
        let mut config = EndpointConfig::new(7, HOST, SocketAddr::from(([10, 0, 0, 255], HOST)));
        config.handshake_interval = Duration::from_millis(1);
        config.max_handshakes = Some(5);
        config
    }

    fn host_datagram(id: u8, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = HostHeader {
            device_id: id,
            sequence: seq,
        }
        .to_bytes()
        .to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn connected(mut transport: MockDatagram, config: EndpointConfig) -> DeviceEndpoint<MockDatagram> {
        transport
            .inbox
            .push_back(Ok(Some((BROADCAST_TOKEN.to_vec(), host()))));
        let mut endpoint = DeviceEndpoint::new(transport, config);
        endpoint.connect().unwrap();
        endpoint
    }

    #[test]
    fn test_handshake_retries_until_token() {
        let mut transport = MockDatagram::default();
        transport.inbox.push_back(Ok(None));
        transport.inbox.push_back(Ok(Some((b"noise".to_vec(), host()))));
        transport.inbox.push_back(Ok(None));
        transport
            .inbox
            .push_back(Ok(Some((BROADCAST_TOKEN.to_vec(), host()))));

        let mut endpoint = DeviceEndpoint::new(transport, config());
        endpoint.connect().unwrap();

        assert!(endpoint.is_connected());
        let sent = &endpoint.transport().sent;
        assert_eq!(sent.len(), 3);
        let header = DeviceHeader::parse(&sent[0]).unwrap();
        assert_eq!(header.kind().unwrap(), DeviceMessageKind::Broadcast);
        assert_eq!(&sent[0][HEADER_LEN..], BROADCAST_TOKEN);
    }

    #[test]
    fn test_handshake_gives_up() {
        let mut endpoint = DeviceEndpoint::new(MockDatagram::default(), config());
        assert!(matches!(endpoint.connect(), Err(DeviceError::Timeout)));
        assert_eq!(endpoint.transport().opened, 5);
    }

    #[test]
    fn test_poll_validates_host_traffic() {
        let mut transport = MockDatagram::default();
        transport.inbox.push_back(Ok(None));
        let mut endpoint = connected(transport, config());

        let inbox = &mut endpoint.transport.inbox;
        inbox.push_back(Ok(Some((host_datagram(7, 1, b"drive"), host()))));
        inbox.push_back(Ok(Some((host_datagram(8, 2, b"other"), host()))));
        let wrong_port = SocketAddr::from(([10, 0, 0, 1], 9));
        inbox.push_back(Ok(Some((host_datagram(7, 3, b"port"), wrong_port))));
        inbox.push_back(Ok(Some((host_datagram(7, 1, b"stale"), host()))));
        inbox.push_back(Ok(Some((host_datagram(7, 2, b"next"), host()))));

        let mut out = [0u8; MAX_DATAGRAM];
        assert_eq!(endpoint.poll(&mut out).unwrap(), Some(5));
        assert_eq!(&out[..5], b"drive");
        assert_eq!(endpoint.poll(&mut out).unwrap(), None);
        assert_eq!(endpoint.poll(&mut out).unwrap(), None);
        assert_eq!(endpoint.poll(&mut out).unwrap(), None);
        assert_eq!(endpoint.poll(&mut out).unwrap(), Some(4));
        assert_eq!(&out[..4], b"next");
    }

    #[test]
    fn test_tolerant_policy_accepts_ties() {
        let mut cfg = config();
        cfg.sequence_policy = SequencePolicy::TolerateWithin(Duration::from_secs(2));
        let mut endpoint = connected(MockDatagram::default(), cfg);

        let inbox = &mut endpoint.transport.inbox;
        inbox.push_back(Ok(Some((host_datagram(7, 4, b"a"), host()))));
        inbox.push_back(Ok(Some((host_datagram(7, 4, b"b"), host()))));

        let mut out = [0u8; 16];
        assert_eq!(endpoint.poll(&mut out).unwrap(), Some(1));
        assert_eq!(endpoint.poll(&mut out).unwrap(), Some(1));
        assert_eq!(out[0], b'b');
    }

    #[test]
    fn test_heartbeat_after_quiet_period() {
        let mut cfg = config();
        cfg.heartbeat_after = Duration::ZERO;
        let mut endpoint = connected(MockDatagram::default(), cfg);
        let before = endpoint.transport().sent.len();

        let mut out = [0u8; 16];
        endpoint.poll(&mut out).unwrap();

        let sent = &endpoint.transport().sent;
        assert_eq!(sent.len(), before + 1);
        let header = DeviceHeader::parse(sent.last().unwrap()).unwrap();
        assert_eq!(header.kind().unwrap(), DeviceMessageKind::Heartbeat);
        assert_eq!(sent.last().unwrap().len(), HEADER_LEN);
    }

    #[test]
    fn test_failed_send_reconnects() {
        let mut endpoint = connected(MockDatagram::default(), config());
        assert_eq!(endpoint.transport().opened, 1);

        endpoint.transport.fail_sends = 1;
        endpoint
            .transport
            .inbox
            .push_back(Ok(Some((BROADCAST_TOKEN.to_vec(), host()))));

        assert!(endpoint.send(b"status").is_err());
        assert_eq!(endpoint.transport().opened, 2);
        assert!(endpoint.is_connected());

        endpoint.send(b"status").unwrap();
        let last = endpoint.transport().sent.last().unwrap().clone();
        assert_eq!(&last[HEADER_LEN..], b"status");
        // Counter restarted with the new handshake
        assert_eq!(DeviceHeader::parse(&last).unwrap().sequence, 1);
    }

    #[test]
    fn test_log_payload() {
        let mut endpoint = connected(MockDatagram::default(), config());
        endpoint.send_log("battery low").unwrap();
        let last = endpoint.transport().sent.last().unwrap();
        assert_eq!(DeviceHeader::parse(last).unwrap().kind().unwrap(), DeviceMessageKind::Log);
        assert_eq!(&last[HEADER_LEN..], b"battery low");
    }
}
