//! State and command frames and their binary encoding.
//!
//! `plant` => StateFrame => `controller` => CommandFrame => `plant`
//!
//! Both frame types share [`FrameHeader`]; the payload is a run of
//! big-endian `f64` values whose byte count is declared in the header.

pub mod command;
pub mod header;
pub mod state;

use thiserror::Error;

pub use command::CommandFrame;
pub use header::{ByteStruct, ByteStructLen, FrameHeader, FrameType};
pub use state::StateFrame;

/// Reasons a byte sequence is not a valid frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MalformedFrame {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("bad magic number 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported wire version {0}")]
    BadVersion(u8),

    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("declared payload of {declared} bytes but {available} bytes follow the header")]
    LengthMismatch { declared: usize, available: usize },

    #[error("payload length {0} is not a whole number of f64 values")]
    PayloadAlignment(usize),

    #[error("expected {expected} payload values, found {found}")]
    PayloadCount { expected: usize, found: usize },

    #[error("non-finite timestamp")]
    NonFiniteTimestamp,

    #[error("non-finite payload value at index {index}")]
    NonFinitePayload { index: usize },

    #[error("expected a {expected:?} frame, found {found:?}")]
    UnexpectedFrameType { expected: FrameType, found: FrameType },
}

/// Either frame type, as read off the link.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    State(StateFrame),
    Command(CommandFrame),
}

impl Frame {
    pub fn kind(&self) -> FrameType {
        match self {
            Frame::State(_) => FrameType::State,
            Frame::Command(_) => FrameType::Command,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            Frame::State(f) => f.sequence,
            Frame::Command(f) => f.sequence,
        }
    }

    /// `tick_time` of a state frame or `issued_time` of a command frame.
    pub fn timestamp(&self) -> f64 {
        match self {
            Frame::State(f) => f.tick_time,
            Frame::Command(f) => f.issued_time,
        }
    }

    pub fn set_timestamp(&mut self, t: f64) {
        match self {
            Frame::State(f) => f.tick_time = t,
            Frame::Command(f) => f.issued_time = t,
        }
    }

    /// Mutable view of the numeric payload.
    pub fn payload_mut(&mut self) -> &mut [f64] {
        match self {
            Frame::State(f) => &mut f.state[..],
            Frame::Command(f) => std::slice::from_mut(&mut f.command),
        }
    }

    /// Write the frame to a buffer, clearing it first and keeping its capacity.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::State(f) => f.encode_into(buf),
            Frame::Command(f) => f.encode_into(buf),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }
}

impl From<StateFrame> for Frame {
    fn from(f: StateFrame) -> Self {
        Frame::State(f)
    }
}

impl From<CommandFrame> for Frame {
    fn from(f: CommandFrame) -> Self {
        Frame::Command(f)
    }
}

/// Decode exactly one frame of either type from `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Frame, MalformedFrame> {
    let header = FrameHeader::parse(bytes)?;
    let values = read_payload(&header, &bytes[FrameHeader::BYTE_LEN..])?;
    match header.kind() {
        FrameType::State => Ok(Frame::State(StateFrame::from_parts(&header, values))),
        FrameType::Command => Ok(Frame::Command(CommandFrame::from_parts(&header, &values)?)),
        FrameType::Unknown(t) => Err(MalformedFrame::UnknownFrameType(t)),
    }
}

/// Size of the frame starting at the front of a stream buffer,
/// or `None` if the header has not fully arrived yet.
///
/// The header is not validated here, so a corrupt header still yields
/// a boundary and the bad frame can be dropped by [`decode`].
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < FrameHeader::BYTE_LEN {
        return None;
    }
    let payload_len = u16::from_be_bytes([buf[22], buf[23]]) as usize;
    Some(FrameHeader::BYTE_LEN + payload_len)
}

/// Check the payload against the header and read its values.
fn read_payload(header: &FrameHeader, payload: &[u8]) -> Result<Vec<f64>, MalformedFrame> {
    let declared = header.payload_len as usize;
    if payload.len() != declared {
        return Err(MalformedFrame::LengthMismatch {
            declared,
            available: payload.len(),
        });
    }
    if declared % 8 != 0 {
        return Err(MalformedFrame::PayloadAlignment(declared));
    }

    let mut values = Vec::with_capacity(declared / 8);
    for (index, chunk) in payload.chunks_exact(8).enumerate() {
        let mut arr = [0_u8; 8];
        arr.copy_from_slice(chunk);
        let v = f64::from_be_bytes(arr);
        if !v.is_finite() {
            return Err(MalformedFrame::NonFinitePayload { index });
        }
        values.push(v);
    }

    Ok(values)
}

/// Append big-endian payload values after a header.
pub(crate) fn write_frame(header: &FrameHeader, values: &[f64], buf: &mut Vec<u8>) {
    buf.clear();
    buf.resize(FrameHeader::BYTE_LEN, 0);
    header.write_bytes(&mut buf[..FrameHeader::BYTE_LEN]);
    for v in values {
        buf.extend_from_slice(&v.to_be_bytes());
    }
}
