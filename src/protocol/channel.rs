//! ReliableChannel packet codec
//!
//! Packet layout: `[kind:u8][sequence:u32][body]`. Over TCP every packet is
//! additionally length-prefixed by the framed socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::ensure;

/// Size of the fixed packet header
pub const PACKET_HEADER_LEN: usize = 5;

/// Largest application message a UDP channel can carry in one datagram
pub const MAX_UDP_MESSAGE: usize = 65_000;

/// Packet kinds (wire tags)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Client announces the channel name
    Handshake = 1,
    /// Server accepts the channel name
    HandshakeAck = 2,
    /// Application payload
    Message = 3,
    /// Liveness probe carrying the sender's timestamp
    Heartbeat = 4,
    /// Echo of a heartbeat timestamp
    HeartbeatAck = 5,
}

impl TryFrom<u8> for PacketKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Handshake),
            2 => Ok(Self::HandshakeAck),
            3 => Ok(Self::Message),
            4 => Ok(Self::Heartbeat),
            5 => Ok(Self::HeartbeatAck),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// One channel packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub sequence: u32,
    pub body: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, sequence: u32, body: Bytes) -> Self {
        Self {
            kind,
            sequence,
            body,
        }
    }

    pub fn handshake(sequence: u32, name: &str) -> Self {
        Self::new(
            PacketKind::Handshake,
            sequence,
            Bytes::copy_from_slice(name.as_bytes()),
        )
    }

    pub fn handshake_ack(sequence: u32, name: &str) -> Self {
        Self::new(
            PacketKind::HandshakeAck,
            sequence,
            Bytes::copy_from_slice(name.as_bytes()),
        )
    }

    pub fn heartbeat(sequence: u32, stamp_ms: u32) -> Self {
        Self::new(
            PacketKind::Heartbeat,
            sequence,
            Bytes::copy_from_slice(&stamp_ms.to_be_bytes()),
        )
    }

    pub fn heartbeat_ack(sequence: u32, stamp_ms: u32) -> Self {
        Self::new(
            PacketKind::HeartbeatAck,
            sequence,
            Bytes::copy_from_slice(&stamp_ms.to_be_bytes()),
        )
    }

    /// Timestamp carried by a heartbeat or its ack
    pub fn stamp(&self) -> Result<u32, ProtocolError> {
        let mut body = self.body.clone();
        ensure(&body, 4)?;
        Ok(body.get_u32())
    }

    /// Whether this handshake (or ack) names `name`
    pub fn names(&self, name: &str) -> bool {
        self.body.as_ref() == name.as_bytes()
    }

    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_LEN + self.body.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.sequence);
        buf.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        ensure(&data, PACKET_HEADER_LEN)?;
        let kind = PacketKind::try_from(data.get_u8())?;
        let sequence = data.get_u32();
        Ok(Self {
            kind,
            sequence,
            body: data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_layout() {
        let packet = Packet::new(PacketKind::Message, 0x01020304, Bytes::from_static(b"go"));
        let bytes = packet.to_bytes();

        assert_eq!(bytes.as_ref(), &[3, 1, 2, 3, 4, b'g', b'o']);
        assert_eq!(Packet::decode(bytes).unwrap(), packet);
    }

    #[test]
    fn test_heartbeat_stamp() {
        let packet = Packet::decode(Packet::heartbeat(7, 123_456).to_bytes()).unwrap();
        assert_eq!(packet.kind, PacketKind::Heartbeat);
        assert_eq!(packet.stamp().unwrap(), 123_456);
    }

    #[test]
    fn test_handshake_names() {
        let packet = Packet::handshake(0, "drive");
        assert!(packet.names("drive"));
        assert!(!packet.names("shared"));
    }

    #[test]
    fn test_reject_malformed() {
        assert_eq!(
            Packet::decode(Bytes::from_static(&[3, 0, 0])),
            Err(ProtocolError::Truncated { needed: 5, got: 3 })
        );
        assert_eq!(
            Packet::decode(Bytes::from_static(&[9, 0, 0, 0, 0])),
            Err(ProtocolError::UnknownKind(9))
        );
    }
}
