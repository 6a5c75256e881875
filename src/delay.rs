//! Delay providers
//!
//! # Examples
//!
//! ## Delay
//!
//! ```no_run
//! use embedded_hal::delay::DelayNs;
//! use rpi_dma_gpio::delay::Delay;
//!
//! let mut delay = Delay::new();
//!
//! delay.delay_us(100);
//! ```

use std::thread;
use std::time::{Duration, Instant};

use embedded_hal::delay::DelayNs;

use crate::time::NanoSeconds;

/// Below this, handing the wait to the scheduler overshoots by more than the wait itself.
const DEFAULT_SPIN: NanoSeconds = NanoSeconds::from_ticks(60_000);

/// Host monotonic clock as a delay provider
///
/// The bulk of a delay is slept, the tail is spun so short delays stay accurate.
#[derive(Clone, Copy, Debug)]
pub struct Delay {
    spin: NanoSeconds,
}

impl Default for Delay {
    fn default() -> Self {
        Self::new()
    }
}

fn sleep_portion(ns: u32, spin_ns: u32) -> Duration {
    Duration::from_nanos(ns.saturating_sub(spin_ns) as u64)
}

impl Delay {
    pub fn new() -> Self {
        Delay { spin: DEFAULT_SPIN }
    }

    /// Spin instead of sleeping for the last `spin` of every delay
    pub fn with_spin(spin: NanoSeconds) -> Self {
        Delay { spin }
    }
}

impl DelayNs for Delay {
    fn delay_ns(&mut self, ns: u32) {
        let deadline = Instant::now() + Duration::from_nanos(ns as u64);

        let sleep = sleep_portion(ns, self.spin.ticks());
        if !sleep.is_zero() {
            thread::sleep(sleep);
        }

        while Instant::now() < deadline {
            core::hint::spin_loop();
        }
    }
}
