//! Frame links between the plant and the controller.
//!
//! A transport moves whole encoded frames. Stream framing, buffering of
//! partial reads and disconnect detection happen here, while decoding and
//! the handling of malformed frames is left to the loops on either end.

pub mod tcp;
pub mod thread_channel;

use std::time::Duration;

use crate::error::TransportError;

pub use tcp::TcpTransport;
pub use thread_channel::ThreadChannelTransport;

/// One end of a plant/controller link.
pub trait Transport: Send {
    /// Send one encoded frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next whole frame.
    ///
    /// `Ok(None)` means nothing arrived in time. A zero timeout polls
    /// without blocking.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    /// Release the link. Further calls fail with `Disconnected`.
    fn close(&mut self);

    /// Frames this end failed to enqueue without blocking.
    fn dropped(&self) -> u64 {
        0
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).recv(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn dropped(&self) -> u64 {
        (**self).dropped()
    }
}
