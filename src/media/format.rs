//! Stream format descriptors
//!
//! Formats travel in `"streaming"` control messages and in shared-channel
//! requests, and are flattened into encoder process arguments.

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::error::ProtocolError;
use crate::protocol::{get_i32, get_u32};

/// Common behaviour of video and audio formats
pub trait MediaFormat: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Whether an encoder can be started with this format
    fn is_usable(&self) -> bool;

    /// Append the wire form to `buf`
    fn encode(&self, buf: &mut impl BufMut);

    /// Read one format from the front of `buf`
    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError>;

    /// Encoder arguments following the device descriptor
    fn encoder_args(&self) -> Vec<String>;
}

/// Video encodings (wire values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoEncoding {
    #[default]
    Unknown,
    Mjpeg,
    Mpeg2,
}

impl VideoEncoding {
    pub fn id(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Mjpeg => 1,
            Self::Mpeg2 => 2,
        }
    }

    pub fn from_id(id: u32) -> Result<Self, ProtocolError> {
        match id {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Mjpeg),
            2 => Ok(Self::Mpeg2),
            other => Err(ProtocolError::UnknownEncoding(other)),
        }
    }
}

/// Video stream format
///
/// Only the field matching `encoding` is carried on the wire: MJPEG sends its
/// quality, MPEG-2 its bitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamFormat {
    pub encoding: VideoEncoding,
    pub width: i32,
    pub height: i32,
    pub framerate: i32,
    pub mjpeg_quality: i32,
    pub mpeg2_bitrate: i32,
}

impl StreamFormat {
    pub fn mjpeg(width: i32, height: i32, framerate: i32, quality: i32) -> Self {
        Self {
            encoding: VideoEncoding::Mjpeg,
            width,
            height,
            framerate,
            mjpeg_quality: quality,
            mpeg2_bitrate: 0,
        }
    }

    pub fn mpeg2(width: i32, height: i32, framerate: i32, bitrate: i32) -> Self {
        Self {
            encoding: VideoEncoding::Mpeg2,
            width,
            height,
            framerate,
            mjpeg_quality: 0,
            mpeg2_bitrate: bitrate,
        }
    }

    /// Quality or bitrate, whichever the encoding uses
    pub fn codec_parameter(&self) -> Option<i32> {
        match self.encoding {
            VideoEncoding::Unknown => None,
            VideoEncoding::Mjpeg => Some(self.mjpeg_quality),
            VideoEncoding::Mpeg2 => Some(self.mpeg2_bitrate),
        }
    }
}

impl MediaFormat for StreamFormat {
    fn is_usable(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.framerate > 0
            && self.codec_parameter().is_some_and(|value| value > 0)
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.encoding.id());
        buf.put_i32(self.width);
        buf.put_i32(self.height);
        buf.put_i32(self.framerate);
        if let Some(value) = self.codec_parameter() {
            buf.put_i32(value);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let encoding = VideoEncoding::from_id(get_u32(buf)?)?;
        let mut format = Self {
            encoding,
            width: get_i32(buf)?,
            height: get_i32(buf)?,
            framerate: get_i32(buf)?,
            ..Self::default()
        };
        match encoding {
            VideoEncoding::Mjpeg => format.mjpeg_quality = get_i32(buf)?,
            VideoEncoding::Mpeg2 => format.mpeg2_bitrate = get_i32(buf)?,
            VideoEncoding::Unknown => {}
        }
        Ok(format)
    }

    fn encoder_args(&self) -> Vec<String> {
        let mut args = vec![
            self.encoding.id().to_string(),
            self.width.to_string(),
            self.height.to_string(),
            self.framerate.to_string(),
        ];
        if let Some(value) = self.codec_parameter() {
            args.push(value.to_string());
        }
        args
    }
}

/// Audio encodings (wire values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    #[default]
    Unknown,
    Ac3,
}

impl AudioEncoding {
    pub fn id(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Ac3 => 1,
        }
    }

    pub fn from_id(id: u32) -> Result<Self, ProtocolError> {
        match id {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Ac3),
            other => Err(ProtocolError::UnknownEncoding(other)),
        }
    }
}

/// Audio stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub bitrate: i32,
}

impl AudioFormat {
    pub fn ac3(bitrate: i32) -> Self {
        Self {
            encoding: AudioEncoding::Ac3,
            bitrate,
        }
    }
}

impl MediaFormat for AudioFormat {
    fn is_usable(&self) -> bool {
        self.encoding != AudioEncoding::Unknown && self.bitrate > 0
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.encoding.id());
        if self.encoding != AudioEncoding::Unknown {
            buf.put_i32(self.bitrate);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let encoding = AudioEncoding::from_id(get_u32(buf)?)?;
        let bitrate = match encoding {
            AudioEncoding::Unknown => 0,
            AudioEncoding::Ac3 => get_i32(buf)?,
        };
        Ok(Self { encoding, bitrate })
    }

    fn encoder_args(&self) -> Vec<String> {
        vec![self.encoding.id().to_string(), self.bitrate.to_string()]
    }
}
