//! Actuator command returned by the controller.

use super::{decode, write_frame, ByteStructLen, Frame, FrameHeader, FrameType, MalformedFrame};

/// Output from the controller client to the plant server.
///
/// `sequence` echoes the [`StateFrame`](super::StateFrame) this command
/// responds to, which lets the plant reject stale commands.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CommandFrame {
    pub sequence: u64,

    /// Controller time when the command was computed [s]
    pub issued_time: f64,

    pub command: f64,
}

impl CommandFrame {
    pub(crate) fn from_parts(header: &FrameHeader, values: &[f64]) -> Result<Self, MalformedFrame> {
        match values {
            [command] => Ok(Self {
                sequence: header.sequence,
                issued_time: header.timestamp,
                command: *command,
            }),
            _ => Err(MalformedFrame::PayloadCount {
                expected: 1,
                found: values.len(),
            }),
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader::new(FrameType::Command, self.sequence, self.issued_time, 1)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        write_frame(&self.header(), &[self.command], buf);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FrameHeader::BYTE_LEN + 8);
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a frame that must be a command frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedFrame> {
        match decode(bytes)? {
            Frame::Command(f) => Ok(f),
            other => Err(MalformedFrame::UnexpectedFrameType {
                expected: FrameType::Command,
                found: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateFrame;

    #[test]
    fn state_bytes_are_not_a_command() {
        let bytes = StateFrame {
            sequence: 9,
            tick_time: 0.09,
            state: vec![0.5],
        }
        .encode();

        assert_eq!(
            CommandFrame::decode(&bytes),
            Err(MalformedFrame::UnexpectedFrameType {
                expected: FrameType::Command,
                found: FrameType::State
            })
        );
        assert!(StateFrame::decode(&bytes).is_ok());
    }
}
