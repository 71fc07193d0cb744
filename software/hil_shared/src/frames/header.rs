//! Header layout shared by every frame type.

use byte_struct::*;
pub use byte_struct::{ByteStruct, ByteStructLen};

use crate::enum_with_unknown;
use crate::{MAGIC, VERSION};

use super::MalformedFrame;

enum_with_unknown!(
    /// Discriminant carried in the `type` byte of the header
    pub enum FrameType(u8) {
        State = 0,
        Command = 1,
    }
);

/// Fixed-size header at the start of every frame.
///
/// ```text
/// ┌──────────┬────────────┬─────────┬──────────────┬───────────────┬────────────────┐
/// │ magic(4) │ version(1) │ type(1) │ sequence(8)  │ timestamp(8)  │ payload_len(2) │
/// └──────────┴────────────┴─────────┴──────────────┴───────────────┴────────────────┘
/// ```
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq)]
#[byte_struct_be]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u8,
    pub frame_type: u8,
    pub sequence: u64,
    pub timestamp: f64,

    /// Payload size in bytes, not in values
    pub payload_len: u16,
}

impl FrameHeader {
    /// Header for a frame of the current wire version.
    ///
    /// # Panics
    ///
    /// If `n_values` exceeds [`MAX_PAYLOAD_VALUES`](crate::MAX_PAYLOAD_VALUES),
    /// which the 16-bit payload length cannot describe.
    pub fn new(frame_type: FrameType, sequence: u64, timestamp: f64, n_values: usize) -> Self {
        assert!(
            n_values <= crate::MAX_PAYLOAD_VALUES,
            "{n_values} values do not fit in one frame"
        );
        Self {
            magic: MAGIC,
            version: VERSION,
            frame_type: frame_type.into(),
            sequence,
            timestamp,
            payload_len: (n_values * 8) as u16,
        }
    }

    /// Read and validate the header at the start of `bytes`.
    ///
    /// Only the header itself is checked here; payload checks belong to
    /// the frame decoders.
    pub fn parse(bytes: &[u8]) -> Result<Self, MalformedFrame> {
        if bytes.len() < Self::BYTE_LEN {
            return Err(MalformedFrame::Truncated {
                need: Self::BYTE_LEN,
                have: bytes.len(),
            });
        }

        let header = Self::read_bytes(&bytes[..Self::BYTE_LEN]);
        if header.magic != MAGIC {
            return Err(MalformedFrame::BadMagic(header.magic));
        }
        if header.version != VERSION {
            return Err(MalformedFrame::BadVersion(header.version));
        }
        if let FrameType::Unknown(t) = header.kind() {
            return Err(MalformedFrame::UnknownFrameType(t));
        }
        if !header.timestamp.is_finite() {
            return Err(MalformedFrame::NonFiniteTimestamp);
        }

        Ok(header)
    }

    pub fn kind(&self) -> FrameType {
        FrameType::from(self.frame_type)
    }

    /// Total frame size in bytes declared by this header.
    pub fn frame_len(&self) -> usize {
        Self::BYTE_LEN + self.payload_len as usize
    }
}
