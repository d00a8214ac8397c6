//! Host-side device protocol state machine
//!
//! No sockets and no timers: the adapter feeds datagrams and watchdog ticks in
//! and acts on what comes back.

use std::net::SocketAddr;
use std::time::Instant;

use super::DeviceState;
use crate::error::DeviceError;
use crate::protocol::device::{
    is_broadcast_token, write_datagram, DeviceHeader, DeviceMessageKind, HostHeader,
    HEADER_LEN, HOST_MARKER, MAX_DATAGRAM, MAX_PAYLOAD,
};
use crate::protocol::sequence::SequenceFilter;

/// Why a datagram was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Shorter than a header or too long to be ours
    Length(usize),
    WrongDevice(u8),
    WrongPort(u16),
    UnknownKind(u8),
    /// Sequence number not above the last accepted one
    Stale(u32),
}

/// What a received datagram turned out to be
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// Host traffic or our own broadcast reply; not worth logging
    Ignored,
    Discarded(Discard),
    Message(&'a [u8]),
    Log(&'a [u8]),
    /// The device is looking for the host; answer with the token
    Broadcast,
    Heartbeat,
}

/// Result of feeding one datagram
#[derive(Debug, PartialEq, Eq)]
pub struct Received<'a> {
    /// Set when this datagram moved the link to a new state
    pub transition: Option<DeviceState>,
    pub inbound: Inbound<'a>,
}

impl<'a> Received<'a> {
    fn without_transition(inbound: Inbound<'a>) -> Self {
        Self {
            transition: None,
            inbound,
        }
    }
}

/// Protocol state for one embedded peer
#[derive(Debug)]
pub struct DeviceLink {
    device_id: u8,
    device_port: u16,
    state: DeviceState,
    filter: SequenceFilter,
    next_send: u32,
    active: bool,
    peer: Option<SocketAddr>,
}

impl DeviceLink {
    /// `device_port` is the source port valid device datagrams come from
    pub fn new(device_id: u8, device_port: u16) -> Self {
        Self {
            device_id,
            device_port,
            state: DeviceState::Connecting,
            filter: SequenceFilter::strict(),
            next_send: 0,
            active: false,
            peer: None,
        }
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn device_port(&self) -> u16 {
        self.device_port
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Address the device last sent from
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Classify one datagram and update the link
    pub fn receive<'a>(&mut self, datagram: &'a [u8], from: SocketAddr, now: Instant) -> Received<'a> {
        let len = datagram.len();
        if len < HEADER_LEN || len >= MAX_DATAGRAM {
            return Received::without_transition(Inbound::Discarded(Discard::Length(len)));
        }
        if datagram[0] == HOST_MARKER || is_broadcast_token(datagram) {
            return Received::without_transition(Inbound::Ignored);
        }

        let header = match DeviceHeader::parse(datagram) {
            Ok(header) => header,
            Err(_) => {
                return Received::without_transition(Inbound::Discarded(Discard::Length(len)))
            }
        };
        if header.device_id != self.device_id {
            return Received::without_transition(Inbound::Discarded(Discard::WrongDevice(
                header.device_id,
            )));
        }
        if from.port() != self.device_port {
            return Received::without_transition(Inbound::Discarded(Discard::WrongPort(
                from.port(),
            )));
        }

        let mut transition = None;
        if self.state == DeviceState::Connecting {
            self.filter.reset();
            self.state = DeviceState::Connected;
            transition = Some(DeviceState::Connected);
        }
        if !self.filter.accept(header.sequence, now) {
            return Received {
                transition,
                inbound: Inbound::Discarded(Discard::Stale(header.sequence)),
            };
        }
        self.active = true;
        self.peer = Some(from);

        let payload = &datagram[HEADER_LEN..];
        let inbound = match header.kind() {
            Ok(DeviceMessageKind::Normal) if payload.is_empty() => Inbound::Ignored,
            Ok(DeviceMessageKind::Normal) => Inbound::Message(payload),
            Ok(DeviceMessageKind::Log) => Inbound::Log(payload),
            Ok(DeviceMessageKind::Broadcast) => Inbound::Broadcast,
            Ok(DeviceMessageKind::Heartbeat) => Inbound::Heartbeat,
            Err(_) => Inbound::Discarded(Discard::UnknownKind(header.kind)),
        };
        Received { transition, inbound }
    }

    /// Periodic watchdog; returns true if the device went silent
    ///
    /// The caller is expected to run [`DeviceLink::reset`] when this fires.
    pub fn watchdog_tick(&mut self) -> bool {
        let expired = self.state == DeviceState::Connected && !self.active;
        self.active = false;
        expired
    }

    /// Back to connecting with fresh counters; returns the transition if any
    pub fn reset(&mut self) -> Option<DeviceState> {
        self.filter.reset();
        self.next_send = 0;
        self.active = false;
        self.peer = None;
        if self.state != DeviceState::Connecting {
            self.state = DeviceState::Connecting;
            Some(DeviceState::Connecting)
        } else {
            None
        }
    }

    /// Build a host datagram carrying `payload` into `out`
    pub fn encode_message(&mut self, payload: &[u8], out: &mut [u8]) -> Result<usize, DeviceError> {
        if self.state != DeviceState::Connected {
            return Err(DeviceError::NotConnected);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(DeviceError::PayloadTooLarge(payload.len()));
        }
        let header = HostHeader {
            device_id: self.device_id,
            sequence: self.next_send,
        };
        let len = write_datagram(out, header.to_bytes(), payload)
            .map_err(|_| DeviceError::PayloadTooLarge(payload.len()))?;
        self.next_send = self.next_send.wrapping_add(1);
        Ok(len)
    }
}
