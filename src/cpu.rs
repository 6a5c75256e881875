//! CPU driven baselines
//!
//! The CPU writes the GPIO set/clear registers itself, in a tight loop. These are the reference
//! points the DMA demos are compared against:
//!
//! - [`run_direct`]: set, clear, repeat. No data dependency, the upper bound of the toggle rate.
//! - [`run_masked`]: words read from memory are masked to the output line and written to the set
//!   or the clear register depending on the bit.
//! - [`run_set_clear`]: the words in memory are already split into set and clear values.
//!
//! Each driver checks a [`CancelToken`] once per pass over its data and reports what it did as
//! [`ToggleStats`] when cancelled. Nothing cancels the token in the `gpio-dma-test` binary, so
//! there the loops run until the process is killed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use embedded_hal::digital::OutputPin;

use crate::dma::SetClear;
use crate::gpio::Gpio;
use crate::peripheral::RegisterAccess;
use crate::time::{self, Hertz, Instant};

/// Shared flag asking a running driver to return
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What a driver did before it was cancelled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ToggleStats {
    /// Completed passes over the driver's data
    pub passes: u64,
    /// Register writes issued
    pub writes: u64,
    pub elapsed: Duration,
}

impl ToggleStats {
    /// Average register write rate
    pub fn write_rate(&self) -> Hertz {
        time::rate(self.writes, self.elapsed)
    }
}

/// Which CPU baseline to run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPattern {
    Direct,
    Masked,
    SetClear,
}

/// Destination of set and clear writes, GPSET0 and GPCLR0 on hardware
pub trait WriteSink {
    /// Drive the lines in `bits` high
    fn set(&self, bits: u32);
    /// Drive the lines in `bits` low
    fn clear(&self, bits: u32);
}

impl<W: RegisterAccess> WriteSink for Gpio<W> {
    #[inline(always)]
    fn set(&self, bits: u32) {
        self.set_mask(bits)
    }

    #[inline(always)]
    fn clear(&self, bits: u32) {
        self.clear_mask(bits)
    }
}

/// Alternating `mask` and 0, so the line toggles on every word
pub fn masked_samples(mask: u32, samples: usize) -> Vec<u32> {
    (0..samples)
        .map(|i| if i % 2 == 0 { mask } else { 0 })
        .collect()
}

/// `samples` pairs that each set and then clear `mask`
pub fn set_clear_samples(mask: u32, samples: usize) -> Vec<SetClear> {
    vec![SetClear::new(mask, mask); samples]
}

/// Toggle `pin` as fast as possible until `cancel` is set.
pub fn run_direct<P: OutputPin>(
    pin: &mut P,
    cancel: &CancelToken,
) -> Result<ToggleStats, P::Error> {
    let start = Instant::now();
    let mut passes = 0;

    while !cancel.is_cancelled() {
        pin.set_high()?;
        pin.set_low()?;
        passes += 1;
    }

    Ok(ToggleStats {
        passes,
        writes: passes * 2,
        elapsed: start.elapsed(),
    })
}

/// Replay `samples` masked to `mask` until `cancel` is set. A word with the bit set is written to
/// the set register, one without it to the clear register.
pub fn run_masked<S: WriteSink>(
    sink: &S,
    mask: u32,
    samples: &[u32],
    cancel: &CancelToken,
) -> ToggleStats {
    let start = Instant::now();
    let mut passes = 0;
    let mut writes = 0;

    while !cancel.is_cancelled() {
        for &word in samples {
            let set = word & mask;
            if set != 0 {
                sink.set(set);
                writes += 1;
            }
            let clear = !word & mask;
            if clear != 0 {
                sink.clear(clear);
                writes += 1;
            }
        }
        passes += 1;
    }

    ToggleStats {
        passes,
        writes,
        elapsed: start.elapsed(),
    }
}

/// Replay pre-split set/clear pairs until `cancel` is set.
pub fn run_set_clear<S: WriteSink>(
    sink: &S,
    samples: &[SetClear],
    cancel: &CancelToken,
) -> ToggleStats {
    let start = Instant::now();
    let mut passes = 0;

    while !cancel.is_cancelled() {
        for sample in samples {
            sink.set(sample.set);
            sink.clear(sample.clear);
        }
        passes += 1;
    }

    ToggleStats {
        passes,
        writes: passes * 2 * samples.len() as u64,
        elapsed: start.elapsed(),
    }
}
