//! Shared-channel envelope
//!
//! `[message_type:i32][body]`. Tags are append-only; a decoder that meets an
//! unknown tag reports it and the caller drops the message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::media::{AudioFormat, MediaFormat, StreamFormat};
use crate::protocol::{ensure, get_i32, get_string, put_string};

/// Position fix reported by the rover
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GpsFix {
    /// Unix time in milliseconds
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub ground_speed: f64,
    pub heading: f64,
    pub satellites: i32,
}

impl GpsFix {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64(self.timestamp_ms);
        buf.put_f64(self.latitude);
        buf.put_f64(self.longitude);
        buf.put_f64(self.altitude_m);
        buf.put_f64(self.ground_speed);
        buf.put_f64(self.heading);
        buf.put_i32(self.satellites);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        ensure(buf, 8 * 6 + 4)?;
        Ok(Self {
            timestamp_ms: buf.get_i64(),
            latitude: buf.get_f64(),
            longitude: buf.get_f64(),
            altitude_m: buf.get_f64(),
            ground_speed: buf.get_f64(),
            heading: buf.get_f64(),
            satellites: buf.get_i32(),
        })
    }
}

/// Messages carried on the shared channel between rover and stations
#[derive(Debug, Clone, PartialEq)]
pub enum SharedMessage {
    /// Whether the rover's controller boards are connected
    RoverStatusUpdate(bool),
    RoverGpsUpdate(GpsFix),
    RequestActivateAudioStream(AudioFormat),
    RequestDeactivateAudioStream,
    StartStereoCameraStream(StreamFormat),
    StartMonoCameraStream(StreamFormat),
    EndStereoAndMonoCameraStream,
    StartAux1CameraStream(StreamFormat),
    EndAux1CameraStream,
    /// Recording start time, unix milliseconds
    StartDataRecording(i64),
    StopDataRecording,
    Error(String),
}

impl SharedMessage {
    pub fn tag(&self) -> i32 {
        match self {
            Self::RoverStatusUpdate(_) => 1,
            Self::RoverGpsUpdate(_) => 2,
            Self::RequestActivateAudioStream(_) => 3,
            Self::RequestDeactivateAudioStream => 4,
            Self::StartStereoCameraStream(_) => 5,
            Self::StartMonoCameraStream(_) => 6,
            Self::EndStereoAndMonoCameraStream => 7,
            Self::StartAux1CameraStream(_) => 8,
            Self::EndAux1CameraStream => 9,
            Self::StartDataRecording(_) => 10,
            Self::StopDataRecording => 11,
            Self::Error(_) => 12,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_i32(self.tag());
        match self {
            Self::RoverStatusUpdate(connected) => buf.put_u8(u8::from(*connected)),
            Self::RoverGpsUpdate(fix) => fix.encode(&mut buf),
            Self::RequestActivateAudioStream(format) => format.encode(&mut buf),
            Self::StartStereoCameraStream(format)
            | Self::StartMonoCameraStream(format)
            | Self::StartAux1CameraStream(format) => format.encode(&mut buf),
            Self::StartDataRecording(start_ms) => buf.put_i64(*start_ms),
            Self::Error(description) => put_string(&mut buf, description),
            Self::RequestDeactivateAudioStream
            | Self::EndStereoAndMonoCameraStream
            | Self::EndAux1CameraStream
            | Self::StopDataRecording => {}
        }
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        let tag = get_i32(&mut data)?;
        let message = match tag {
            1 => {
                ensure(&data, 1)?;
                Self::RoverStatusUpdate(data.get_u8() != 0)
            }
            2 => Self::RoverGpsUpdate(GpsFix::decode(&mut data)?),
            3 => Self::RequestActivateAudioStream(AudioFormat::decode(&mut data)?),
            4 => Self::RequestDeactivateAudioStream,
            5 => Self::StartStereoCameraStream(StreamFormat::decode(&mut data)?),
            6 => Self::StartMonoCameraStream(StreamFormat::decode(&mut data)?),
            7 => Self::EndStereoAndMonoCameraStream,
            8 => Self::StartAux1CameraStream(StreamFormat::decode(&mut data)?),
            9 => Self::EndAux1CameraStream,
            10 => {
                ensure(&data, 8)?;
                Self::StartDataRecording(data.get_i64())
            }
            11 => Self::StopDataRecording,
            12 => Self::Error(get_string(&mut data)?),
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(message)
    }
}
