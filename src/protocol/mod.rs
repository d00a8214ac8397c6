//! Wire formats
//!
//! Every multi-byte field is big-endian. Each message type has an explicit
//! encode/decode pair; numeric tags are part of the wire contract and must
//! never be renumbered.

pub mod channel;
pub mod device;
pub mod media;
pub mod sequence;
pub mod shared;

pub use channel::{Packet, PacketKind};
pub use device::{DeviceHeader, DeviceMessageKind, HostHeader};
pub use media::ControlMessage;
pub use sequence::SequenceFilter;
pub use shared::{GpsFix, SharedMessage};

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Fail unless `buf` still holds `needed` bytes
pub(crate) fn ensure(buf: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            got: buf.remaining(),
        });
    }
    Ok(())
}

/// Length-prefixed UTF-8 string: `[len:u32][bytes]`
pub(crate) fn put_string(buf: &mut impl BufMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub(crate) fn get_string(buf: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| ProtocolError::InvalidText)
}

pub(crate) fn get_i32(buf: &mut impl Buf) -> Result<i32, ProtocolError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub(crate) fn get_u32(buf: &mut impl Buf) -> Result<u32, ProtocolError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}
