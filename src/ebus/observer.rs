//! Bus observer: tracks SYN boundaries and inter-SYN timing for every byte
//! received off the wire.

use crate::constants::SYN;
use std::time::{Duration, Instant};

/// Minimal per-byte bus state: whether we are between telegrams (idle) or
/// inside one, and the timing/last-bytes context arbitration needs.
#[derive(Debug)]
pub struct BusObserver {
    last_syn_at: Option<Instant>,
    idle: bool,
    previous_byte: Option<u8>,
    current_byte: Option<u8>,
}

impl Default for BusObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl BusObserver {
    /// Creates an observer with no history (treated as idle).
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_syn_at: None,
            idle: true,
            previous_byte: None,
            current_byte: None,
        }
    }

    /// Feeds one observed bus byte, updating SYN/idle tracking.
    ///
    /// `now` is supplied by the caller (an abstract monotonic-clock
    /// capability) rather than read internally, so the observer itself has
    /// no hidden time dependency and is trivially testable.
    pub fn data(&mut self, byte: u8, now: Instant) {
        self.previous_byte = self.current_byte;
        self.current_byte = Some(byte);
        if byte == SYN {
            self.last_syn_at = Some(now);
            self.idle = true;
        } else {
            self.idle = false;
        }
    }

    /// `true` if the last observed byte was a `SYN` (bus idle marker).
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Elapsed time since the last observed `SYN`, if any has been seen.
    #[must_use]
    pub fn micros_since_last_syn(&self, now: Instant) -> Option<Duration> {
        self.last_syn_at.map(|t| now.saturating_duration_since(t))
    }

    /// The most recently observed byte (`_byte` in the source naming).
    #[must_use]
    pub fn current(&self) -> Option<u8> {
        self.current_byte
    }

    /// The byte observed immediately before the current one (`_master` in
    /// the source naming — the round-1 arbitration winner byte once a SYN
    /// has been followed by an address).
    #[must_use]
    pub fn previous(&self) -> Option<u8> {
        self.previous_byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let obs = BusObserver::new();
        assert!(obs.is_idle());
        assert!(obs.current().is_none());
    }

    #[test]
    fn syn_marks_idle_non_syn_marks_busy() {
        let mut obs = BusObserver::new();
        let t0 = Instant::now();
        obs.data(SYN, t0);
        assert!(obs.is_idle());
        obs.data(0x03, t0);
        assert!(!obs.is_idle());
        assert_eq!(obs.previous(), Some(SYN));
        assert_eq!(obs.current(), Some(0x03));
    }

    #[test]
    fn micros_since_last_syn_tracks_elapsed() {
        let mut obs = BusObserver::new();
        let t0 = Instant::now();
        obs.data(SYN, t0);
        let t1 = t0 + Duration::from_millis(5);
        obs.data(0x03, t1);
        assert_eq!(obs.micros_since_last_syn(t1), Some(Duration::from_millis(5)));
    }
}
