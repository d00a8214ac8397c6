//! Media control messages
//!
//! Exchanged over the media control channel. Each message is a length-prefixed
//! tag string followed by a tag-specific body.

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::media::MediaFormat;
use crate::protocol::{get_string, put_string};

const TAG_START: &str = "start";
const TAG_EOS: &str = "eos";
const TAG_STREAMING: &str = "streaming";
const TAG_ERROR: &str = "error";

/// Server-to-client control message
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage<F> {
    /// A stream is about to start; the client should punch its UDP address
    Start,
    /// The stream ended normally or was stopped
    Eos,
    /// The encoder is running with this format
    Streaming(F),
    /// The encoder failed
    Error(String),
}

impl<F: MediaFormat> ControlMessage<F> {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Start => TAG_START,
            Self::Eos => TAG_EOS,
            Self::Streaming(_) => TAG_STREAMING,
            Self::Error(_) => TAG_ERROR,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        put_string(&mut buf, self.tag());
        match self {
            Self::Streaming(format) => format.encode(&mut buf),
            Self::Error(description) => put_string(&mut buf, description),
            Self::Start | Self::Eos => {}
        }
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        let tag = get_string(&mut data)?;
        match tag.as_str() {
            TAG_START => Ok(Self::Start),
            TAG_EOS => Ok(Self::Eos),
            TAG_STREAMING => Ok(Self::Streaming(F::decode(&mut data)?)),
            TAG_ERROR => Ok(Self::Error(get_string(&mut data)?)),
            _ => Err(ProtocolError::UnknownControl(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioFormat, StreamFormat};
    use bytes::BufMut;

    #[test]
    fn test_start_layout() {
        let bytes = ControlMessage::<StreamFormat>::Start.to_bytes();
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 5, b's', b't', b'a', b'r', b't']);
    }

    #[test]
    fn test_streaming_carries_format() {
        let format = StreamFormat::mjpeg(320, 240, 15, 80);
        let decoded =
            ControlMessage::<StreamFormat>::decode(ControlMessage::Streaming(format).to_bytes())
                .unwrap();
        assert_eq!(decoded, ControlMessage::Streaming(format));

        let audio = ControlMessage::Streaming(AudioFormat::ac3(48_000));
        assert_eq!(
            ControlMessage::<AudioFormat>::decode(audio.to_bytes()).unwrap(),
            audio
        );
    }

    #[test]
    fn test_error_description() {
        let message = ControlMessage::<AudioFormat>::Error("encoder error".to_string());
        assert_eq!(
            ControlMessage::<AudioFormat>::decode(message.to_bytes()).unwrap(),
            message
        );
    }

    #[test]
    fn test_unknown_tag() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "rewind");
        buf.put_u8(0);
        assert_eq!(
            ControlMessage::<StreamFormat>::decode(buf.freeze()),
            Err(ProtocolError::UnknownControl("rewind".to_string()))
        );
    }
}
