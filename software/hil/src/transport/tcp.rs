//! Framed TCP link.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use hil_shared::frame_len;
use tracing::{debug, info, warn};

use super::Transport;
use crate::error::TransportError;

/// Size of a single socket read.
const READ_CHUNK_LEN: usize = 4096;

/// Default limit on how long a send may wait for a peer that stopped reading.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(5);

/// A TCP stream carrying back-to-back frames.
///
/// Frame boundaries come from the `payload_len` field of each header.
/// Bytes of a partially received frame are kept across calls, so a read
/// timeout never loses data. A frame the peer cannot take within the write
/// timeout is dropped and counted.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    rxbuf: Vec<u8>,
    chunk: Box<[u8; READ_CHUNK_LEN]>,
    dropped: u64,
}

impl TcpTransport {
    /// Wrap a connected stream, disabling Nagle's algorithm and
    /// bounding sends by [`DEFAULT_WRITE_TIMEOUT`].
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(DEFAULT_WRITE_TIMEOUT))?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream: Some(stream),
            peer,
            rxbuf: Vec::new(),
            chunk: Box::new([0_u8; READ_CHUNK_LEN]),
            dropped: 0,
        })
    }

    /// Wait at most `timeout` for the peer to take a frame.
    pub fn with_write_timeout(self, timeout: Duration) -> Result<Self, TransportError> {
        if let Some(stream) = &self.stream {
            // A zero duration is rejected by the socket
            stream.set_write_timeout(Some(timeout.max(Duration::from_micros(1))))?;
        }
        Ok(self)
    }

    /// Connect to a plant, retrying until `timeout` passes
    /// in case it is not listening yet.
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self, TransportError> {
        let start = Instant::now();
        loop {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    let transport = Self::from_stream(stream)?;
                    info!("Connected to plant at {}", transport.peer);
                    return Ok(transport);
                }
                Err(e) if start.elapsed() < timeout => {
                    debug!("Connection attempt failed, retrying: {e}");
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait up to `timeout` for a controller to connect.
    pub fn accept(listener: &TcpListener, timeout: Duration) -> Result<Self, TransportError> {
        listener.set_nonblocking(true)?;
        let start = Instant::now();
        let accepted = loop {
            match listener.accept() {
                Ok((stream, _)) => break Ok(stream),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        break Err(io::Error::new(
                            ErrorKind::TimedOut,
                            "no controller connected before timeout",
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => break Err(e),
            }
        };
        listener.set_nonblocking(false)?;

        let transport = Self::from_stream(accepted?)?;
        info!("Accepted controller connection from {}", transport.peer);
        Ok(transport)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Split the next whole frame off the front of the receive buffer.
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let n = frame_len(&self.rxbuf)?;
        if self.rxbuf.len() < n {
            return None;
        }
        let rest = self.rxbuf.split_off(n);
        Some(std::mem::replace(&mut self.rxbuf, rest))
    }

    /// One read into the receive buffer. `Ok(false)` if nothing arrived in time.
    fn fill(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Disconnected)?;

        let polling = timeout.is_zero();
        if polling {
            stream.set_nonblocking(true)?;
        } else {
            stream.set_read_timeout(Some(timeout))?;
        }
        let result = stream.read(&mut self.chunk[..]);
        if polling {
            stream.set_nonblocking(false)?;
        }

        match result {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => {
                self.rxbuf.extend_from_slice(&self.chunk[..n]);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(true),
            Err(e) => Err(classify(e)),
        }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Disconnected)?;
        let mut written = 0;
        while written < frame.len() {
            match stream.write(&frame[written..]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if written == 0 {
                        self.dropped += 1;
                        debug!("Peer {} is not reading; dropped a frame", self.peer);
                        return Ok(());
                    }
                    // The stream is no longer on a frame boundary
                    warn!("Send to {} timed out partway through a frame", self.peer);
                    return Err(TransportError::Disconnected);
                }
                Err(e) => return Err(classify(e)),
            }
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        let start = Instant::now();
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() && !timeout.is_zero() {
                return Ok(None);
            }
            // A poll ends as soon as the socket has nothing more to give
            if !self.fill(remaining)? && timeout.is_zero() {
                return Ok(None);
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            info!("Closed TCP link to {}", self.peer);
        }
        self.rxbuf.clear();
    }

    fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Map connection-loss errors to `Disconnected`.
fn classify(e: io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => TransportError::Disconnected,
        _ => TransportError::Io(e),
    }
}
