use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use super::{SessionOutcome, SessionReport};
use crate::error::SessionError;

type SessionThread = JoinHandle<Result<SessionReport, SessionError>>;

/// A session running on a background thread.
///
/// The session's result is kept once the thread has been joined, so it can
/// be read any number of times. Dropping the handle asks the session to stop
/// without waiting for it.
pub struct SessionHandle {
    stop: Arc<AtomicBool>,

    /// Exactly one of these is set
    thread: Option<SessionThread>,
    finished: Option<Result<SessionReport, SessionError>>,
}

impl SessionHandle {
    pub(super) fn new(stop: Arc<AtomicBool>, thread: SessionThread) -> Self {
        Self {
            stop,
            thread: Some(thread),
            finished: None,
        }
    }

    /// Ask the session to wind down at its next tick.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Block until the session ends and get its result.
    pub fn wait(&mut self) -> Result<&SessionReport, &SessionError> {
        let thread = self.thread.take();
        self.finished
            .get_or_insert_with(|| join_session(thread))
            .as_ref()
    }

    /// Stop the session and wait for it to wind down.
    pub fn stop_and_wait(&mut self) -> Result<&SessionReport, &SessionError> {
        self.stop();
        self.wait()
    }

    /// The session's result if it has ended, without blocking.
    pub fn poll(&mut self) -> Option<Result<&SessionReport, &SessionError>> {
        if self.is_running() {
            return None;
        }
        Some(self.wait())
    }

    /// How the session ended, once it has ended without error
    /// and its result has been collected.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        match &self.finished {
            Some(Ok(report)) => Some(report.outcome),
            _ => None,
        }
    }

    /// Wait for the session to end and take ownership of its result.
    pub fn join(mut self) -> Result<SessionReport, SessionError> {
        let thread = self.thread.take();
        self.finished
            .take()
            .unwrap_or_else(|| join_session(thread))
    }
}

fn join_session(thread: Option<SessionThread>) -> Result<SessionReport, SessionError> {
    match thread {
        Some(h) => h
            .join()
            .map_err(|_| SessionError::ThreadPanicked("session".to_string()))?,
        None => Err(SessionError::ThreadPanicked("session".to_string())),
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
