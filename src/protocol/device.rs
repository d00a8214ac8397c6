//! Device datagram codec
//!
//! Shared by the host-side channel and the embedded endpoint, so it only uses
//! slices and fixed-size arrays.
//!
//! ```text
//! device -> host   [device_id:1][kind:1][sequence:4][payload...]
//! host   -> device [0x00:1][device_id:1][sequence:4][payload...]
//! ```

use crate::error::ProtocolError;

/// Header length in both directions
pub const HEADER_LEN: usize = 6;

/// Largest datagram either side reads
pub const MAX_DATAGRAM: usize = 512;

/// Largest payload after the header
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

/// First byte of every host-originated datagram
pub const HOST_MARKER: u8 = 0x00;

/// Discovery token (NUL terminated) exchanged during the broadcast handshake
pub const BROADCAST_TOKEN: &[u8] = b"DeviceChannel\0";

/// Device message kinds (wire tags)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceMessageKind {
    Normal = 1,
    Log = 2,
    Broadcast = 3,
    Heartbeat = 4,
}

impl TryFrom<u8> for DeviceMessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Normal),
            2 => Ok(Self::Log),
            3 => Ok(Self::Broadcast),
            4 => Ok(Self::Heartbeat),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Header of a device-originated datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHeader {
    pub device_id: u8,
    pub kind: u8,
    pub sequence: u32,
}

impl DeviceHeader {
    pub fn new(device_id: u8, kind: DeviceMessageKind, sequence: u32) -> Self {
        Self {
            device_id,
            kind: kind as u8,
            sequence,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let seq = self.sequence.to_be_bytes();
        [self.device_id, self.kind, seq[0], seq[1], seq[2], seq[3]]
    }

    /// Parse the header; the kind byte is kept raw so an unknown kind can
    /// still be attributed to its device
    pub fn parse(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                got: datagram.len(),
            });
        }
        Ok(Self {
            device_id: datagram[0],
            kind: datagram[1],
            sequence: u32::from_be_bytes([datagram[2], datagram[3], datagram[4], datagram[5]]),
        })
    }

    pub fn kind(&self) -> Result<DeviceMessageKind, ProtocolError> {
        DeviceMessageKind::try_from(self.kind)
    }
}

/// Header of a host-originated datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostHeader {
    pub device_id: u8,
    pub sequence: u32,
}

impl HostHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let seq = self.sequence.to_be_bytes();
        [HOST_MARKER, self.device_id, seq[0], seq[1], seq[2], seq[3]]
    }

    /// Parse a host header, or `None` if the datagram is not host traffic
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < HEADER_LEN || datagram[0] != HOST_MARKER {
            return None;
        }
        Some(Self {
            device_id: datagram[1],
            sequence: u32::from_be_bytes([datagram[2], datagram[3], datagram[4], datagram[5]]),
        })
    }
}

/// Write header + payload into `out`, returning the datagram length
pub fn write_datagram(
    out: &mut [u8],
    header: [u8; HEADER_LEN],
    payload: &[u8],
) -> Result<usize, ProtocolError> {
    let total = HEADER_LEN + payload.len();
    if payload.len() > MAX_PAYLOAD || out.len() < total {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    out[..HEADER_LEN].copy_from_slice(&header);
    out[HEADER_LEN..total].copy_from_slice(payload);
    Ok(total)
}

/// Whether `data` is exactly the broadcast token
pub fn is_broadcast_token(data: &[u8]) -> bool {
    data == BROADCAST_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_header_layout() {
        let header = DeviceHeader::new(7, DeviceMessageKind::Log, 258);
        assert_eq!(header.to_bytes(), [7, 2, 0, 0, 1, 2]);

        let parsed = DeviceHeader::parse(&[7, 2, 0, 0, 1, 2, b'h', b'i']).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.kind().unwrap(), DeviceMessageKind::Log);
    }

    #[test]
    fn test_host_header_marker() {
        let header = HostHeader {
            device_id: 3,
            sequence: 9,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], HOST_MARKER);
        assert_eq!(HostHeader::parse(&bytes), Some(header));

        // Device traffic is not host traffic
        assert_eq!(HostHeader::parse(&[3, 1, 0, 0, 0, 9]), None);
    }

    #[test]
    fn test_short_datagram() {
        assert!(matches!(
            DeviceHeader::parse(&[1, 1, 0]),
            Err(ProtocolError::Truncated { needed: 6, got: 3 })
        ));
    }

    #[test]
    fn test_write_datagram_limits() {
        let mut out = [0u8; MAX_DATAGRAM];
        let header = HostHeader {
            device_id: 1,
            sequence: 0,
        }
        .to_bytes();

        let len = write_datagram(&mut out, header, &[0xAA; MAX_PAYLOAD]).unwrap();
        assert_eq!(len, MAX_DATAGRAM);
        assert!(write_datagram(&mut out, header, &[0xAA; MAX_PAYLOAD + 1]).is_err());
    }

    #[test]
    fn test_broadcast_token() {
        assert!(is_broadcast_token(b"DeviceChannel\0"));
        assert!(!is_broadcast_token(b"DeviceChannel"));
    }
}
