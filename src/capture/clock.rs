//! Device clock translation.
//!
//! Capture hardware stamps buffers with a monotonic clock. Consumers want
//! wall-clock microseconds, so each device captures the offset between the two
//! clocks once, when its handle is created, and applies it to every frame.

#![allow(unsafe_code)] // clock_gettime(CLOCK_MONOTONIC) via libc

use std::time::Duration;

/// Fixed offset from a device's monotonic clock to the process wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceClock {
    offset_us: i64,
}

impl DeviceClock {
    /// Capture the current wall-clock/monotonic offset.
    #[must_use]
    pub fn capture() -> Self {
        let wall_us = chrono::Utc::now().timestamp_micros();
        let mono_us = monotonic_now().as_micros() as i64;
        Self {
            offset_us: wall_us - mono_us,
        }
    }

    /// Clock with an explicit offset (simulation and tests).
    #[must_use]
    pub fn with_offset(offset_us: i64) -> Self {
        Self { offset_us }
    }

    /// Wall clock minus device clock, in microseconds.
    #[must_use]
    pub fn offset_us(&self) -> i64 {
        self.offset_us
    }

    /// Translate a device-local timestamp into wall-clock microseconds.
    #[must_use]
    pub fn to_wall_us(&self, local: Duration) -> i64 {
        self.offset_us + local.as_micros() as i64
    }
}

/// Current value of `CLOCK_MONOTONIC`, the clock V4L2 stamps buffers with.
#[must_use]
pub fn monotonic_now() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec; CLOCK_MONOTONIC is always supported.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_applies_offset() {
        let clock = DeviceClock::with_offset(1_000_000);
        assert_eq!(clock.to_wall_us(Duration::from_micros(250)), 1_000_250);
    }

    #[test]
    fn test_captured_offset_tracks_wall_clock() {
        let clock = DeviceClock::capture();
        let now_wall = chrono::Utc::now().timestamp_micros();
        let translated = clock.to_wall_us(monotonic_now());
        // Both sides read the clocks within a few milliseconds of each other.
        assert!((translated - now_wall).abs() < 50_000);
    }

    #[test]
    fn test_monotonic_is_nondecreasing() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }
}
