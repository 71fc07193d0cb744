//! Monotonic time sources in seconds since the start of a session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic session time [s].
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall-clock monotonic time measured from a fixed epoch.
///
/// Clones share the epoch, so a plant and a controller running on
/// different threads of one process stamp frames on the same time base.
#[derive(Clone, Copy, Debug)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Session time of some instant.
    pub fn at(&self, t: Instant) -> f64 {
        t.saturating_duration_since(self.epoch).as_secs_f64()
    }

    /// Instant at some session time.
    pub fn instant(&self, t: f64) -> Instant {
        self.epoch + Duration::from_secs_f64(t.max(0.0))
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SessionClock {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to, for deterministic tests
/// and for driving a plant from an external time base.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(t: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(t.to_bits())),
        }
    }

    pub fn set(&self, t: f64) {
        self.bits.store(t.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, dt: f64) {
        let _ = self
            .bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
                Some((f64::from_bits(b) + dt).to_bits())
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let a = ManualClock::new(1.0);
        let b = a.clone();
        a.advance(0.5);
        assert_eq!(b.now(), 1.5);
        b.set(0.25);
        assert_eq!(a.now(), 0.25);
    }

    #[test]
    fn session_clock_roundtrips_instants() {
        let clock = SessionClock::new();
        let t = clock.instant(0.125);
        assert!((clock.at(t) - 0.125).abs() < 1e-9);
        assert!(clock.now() >= 0.0);
    }
}
