//! Millisecond wall clock and NTP conversion.
//!
//! Every component in the pipeline works on signed millisecond timestamps
//! (`i64`), matching the units packet producers use for ideal transmit
//! times. The clock is injected so sessions can be driven deterministically
//! in tests with [`ManualClock`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900-01-01) and the UNIX epoch.
///
/// (365 days * 70 years + 17 leap days) * 86400 (RFC 868).
pub const SECS_1900: u64 = 2_208_988_800;

/// Source of the current time in milliseconds.
pub trait Clock: Send + Sync {
    /// Milliseconds since the UNIX epoch.
    fn now_ms(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Convert a millisecond duration to 32.32 fixed-point seconds.
///
/// Negative inputs clamp to zero.
pub fn ms_to_fixed64(ms: i64) -> u64 {
    let ms = ms.max(0) as u64;
    let secs = ms / 1000;
    let frac = ((ms % 1000) << 32) / 1000;
    (secs << 32) | frac
}

/// Convert a UNIX millisecond timestamp to a 64-bit NTP timestamp.
pub fn unix_ms_to_ntp(ms: i64) -> u64 {
    let fixed = ms_to_fixed64(ms);
    fixed.wrapping_add(SECS_1900 << 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed64_whole_seconds() {
        assert_eq!(ms_to_fixed64(3000), 3 << 32);
    }

    #[test]
    fn fixed64_half_second() {
        assert_eq!(ms_to_fixed64(500), 1 << 31);
    }

    #[test]
    fn fixed64_negative_clamps() {
        assert_eq!(ms_to_fixed64(-10), 0);
    }

    #[test]
    fn ntp_epoch_offset() {
        assert_eq!(unix_ms_to_ntp(0) >> 32, SECS_1900);
        assert_eq!(unix_ms_to_ntp(1_000) >> 32, SECS_1900 + 1);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_250);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }
}
