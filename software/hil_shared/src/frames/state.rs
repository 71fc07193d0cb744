//! Plant state published once per tick.

use super::{decode, write_frame, ByteStructLen, Frame, FrameHeader, FrameType, MalformedFrame};

/// Output from the plant server to the controller client each tick.
///
/// Sequence numbers are strictly increasing within a session,
/// and a frame is never modified once it has been sent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateFrame {
    pub sequence: u64,

    /// Plant time at the tick that produced this state [s]
    pub tick_time: f64,

    pub state: Vec<f64>,
}

impl StateFrame {
    pub(crate) fn from_parts(header: &FrameHeader, values: Vec<f64>) -> Self {
        Self {
            sequence: header.sequence,
            tick_time: header.timestamp,
            state: values,
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader::new(
            FrameType::State,
            self.sequence,
            self.tick_time,
            self.state.len(),
        )
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        write_frame(&self.header(), &self.state, buf);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FrameHeader::BYTE_LEN + 8 * self.state.len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a frame that must be a state frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedFrame> {
        match decode(bytes)? {
            Frame::State(f) => Ok(f),
            other => Err(MalformedFrame::UnexpectedFrameType {
                expected: FrameType::State,
                found: other.kind(),
            }),
        }
    }
}
