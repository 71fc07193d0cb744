//! Link between two threads of one process.

use std::time::Duration;

use crossbeam::channel::{
    Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded,
};
use tracing::{debug, info};

use super::Transport;
use crate::error::TransportError;

/// One end of a pair of bounded crossbeam channels.
///
/// Sending never blocks. A frame that does not fit is counted as dropped,
/// the same as a datagram lost on a congested network.
pub struct ThreadChannelTransport {
    name: &'static str,
    tx: Option<Sender<Vec<u8>>>,
    rx: Option<Receiver<Vec<u8>>>,
    dropped: u64,
}

impl ThreadChannelTransport {
    /// Make both ends of a link that buffers up to `capacity` frames each way.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (plant_tx, controller_rx) = bounded(capacity);
        let (controller_tx, plant_rx) = bounded(capacity);
        let plant = Self {
            name: "plant",
            tx: Some(plant_tx),
            rx: Some(plant_rx),
            dropped: 0,
        };
        let controller = Self {
            name: "controller",
            tx: Some(controller_tx),
            rx: Some(controller_rx),
            dropped: 0,
        };
        (plant, controller)
    }
}

impl Transport for ThreadChannelTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Disconnected)?;
        match tx.try_send(frame.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                debug!("{} end of thread channel full; frame dropped", self.name);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Disconnected),
        }
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        let rx = self.rx.as_ref().ok_or(TransportError::Disconnected)?;
        if timeout.is_zero() {
            match rx.try_recv() {
                Ok(frame) => Ok(Some(frame)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
            }
        } else {
            match rx.recv_timeout(timeout) {
                Ok(frame) => Ok(Some(frame)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
            }
        }
    }

    fn close(&mut self) {
        if self.tx.take().is_some() {
            info!("Closed {} end of thread channel", self.name);
        }
        self.rx = None;
    }

    fn dropped(&self) -> u64 {
        self.dropped
    }
}
