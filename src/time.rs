//! Time units

use std::time::Duration;

pub use fugit::{
    HertzU32 as Hertz, MicrosDurationU32 as MicroSeconds,
    NanosDurationU32 as NanoSeconds,
};

/// A measurement of a monotonically nondecreasing clock
#[derive(Clone, Copy, Debug)]
pub struct Instant {
    now: std::time::Instant,
}

impl Instant {
    pub fn now() -> Self {
        Self {
            now: std::time::Instant::now(),
        }
    }

    /// Time elapsed since the `Instant` was created
    pub fn elapsed(&self) -> Duration {
        self.now.elapsed()
    }
}

/// Average rate of `events` spread over `elapsed`, saturating at `u32::MAX` Hz.
pub fn rate(events: u64, elapsed: Duration) -> Hertz {
    let nanos = elapsed.as_nanos();
    if nanos == 0 {
        return Hertz::from_raw(0);
    }
    let hz = (events as u128 * 1_000_000_000) / nanos;
    Hertz::from_raw(hz.min(u32::MAX as u128) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate() {
        assert_eq!(rate(1000, Duration::from_millis(1)), Hertz::MHz(1));
        assert_eq!(rate(3, Duration::from_secs(2)), Hertz::from_raw(1));
        assert_eq!(rate(10, Duration::ZERO), Hertz::from_raw(0));
        assert_eq!(
            rate(u64::MAX, Duration::from_nanos(1)),
            Hertz::from_raw(u32::MAX)
        );
    }

    #[test]
    fn kilohertz_conversion() {
        assert_eq!(rate(5_000, Duration::from_millis(1)).to_kHz(), 5_000);
    }
}
