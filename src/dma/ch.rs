use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use embedded_hal::delay::DelayNs;
use log::{debug, info};

use super::{DmaConfig, Error};
use crate::memory::BusAddress;
use crate::peripheral::RegisterAccess;
use crate::time::MicroSeconds;

bitflags! {
    /// Control and status (CS) register of a channel, see BCM2835 ARM Peripherals 4.2.1.2
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ChannelStatus: u32 {
        /// Reset the channel. Self clearing on hardware.
        const RESET = 1 << 31;
        /// Abort the current control block. Self clearing on hardware.
        const ABORT = 1 << 30;
        /// Keep running while the debug pause signal is asserted
        const DISDEBUG = 1 << 29;
        /// Defer END until all outstanding writes are acknowledged
        const WAIT_FOR_OUTSTANDING_WRITES = 1 << 28;
        const ERROR = 1 << 8;
        const WAITING_FOR_OUTSTANDING_WRITES = 1 << 6;
        const DREQ_STOPS_DMA = 1 << 5;
        const PAUSED = 1 << 4;
        const DREQ = 1 << 3;
        const INT = 1 << 2;
        /// Set when a control block completes. Write one to clear.
        const END = 1 << 1;
        /// Run the channel
        const ACTIVE = 1 << 0;
    }
}

impl ChannelStatus {
    pub fn priority(&self) -> u8 {
        ((self.bits() >> 16) & 0xF) as u8
    }

    pub fn panic_priority(&self) -> u8 {
        ((self.bits() >> 20) & 0xF) as u8
    }
}

/// Lifecycle of a channel as driven by [`DmaChannel`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Nothing installed
    Idle,
    /// A chain is installed, the channel is not running
    Configured,
    /// The engine owns the chain and runs it autonomously
    Active,
    /// Shutdown in progress
    Stopping,
}

/// Highest channel number of the full DMA engines on the BCM283x
pub const MAX_CHANNEL: u8 = 14;

/// Time given to an in-flight transfer to drain after an abort
pub const ABORT_DRAIN: MicroSeconds = MicroSeconds::from_ticks(100);

// Channels are 0x100 bytes apart
const CHANNEL_STRIDE_WORDS: usize = 0x100 / 4;
const CS: usize = 0;
const CONBLK_AD: usize = 1;

/// One channel of the DMA controller, reached through the controller's register window
pub struct DmaChannel<'w, W> {
    regs: &'w W,
    index: u8,
    state: ChannelState,
}

impl<'w, W: RegisterAccess> DmaChannel<'w, W> {
    /// Channel `index` of the controller mapped at `regs`
    pub fn new(regs: &'w W, index: u8) -> Self {
        assert!(index <= MAX_CHANNEL, "DMA channel {index} does not exist");
        assert!(
            (index as usize + 1) * CHANNEL_STRIDE_WORDS <= regs.len_words(),
            "DMA channel {index} is outside the register window"
        );
        Self {
            regs,
            index,
            state: ChannelState::Idle,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[inline(always)]
    fn word(&self, register: usize) -> usize {
        self.index as usize * CHANNEL_STRIDE_WORDS + register
    }

    #[inline(always)]
    fn modify_status<F: FnOnce(ChannelStatus) -> ChannelStatus>(&self, f: F) {
        self.regs.modify(self.word(CS), |cs| {
            f(ChannelStatus::from_bits_retain(cs)).bits()
        });
    }

    /// Current control/status register
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_bits_retain(self.regs.read(self.word(CS)))
    }

    /// Control block the channel is at (the installed head before it starts)
    pub fn control_block_address(&self) -> BusAddress {
        BusAddress::from_raw(self.regs.read(self.word(CONBLK_AD)))
    }

    /// Is the hardware ACTIVE bit set?
    pub fn is_active(&self) -> bool {
        self.status().contains(ChannelStatus::ACTIVE)
    }

    /// Install the chain starting at `head` and apply `config`. The channel must not be running.
    pub fn configure(
        &mut self,
        head: BusAddress,
        config: &DmaConfig,
    ) -> Result<(), Error> {
        match self.state {
            ChannelState::Active | ChannelState::Stopping => {
                return Err(Error::InvalidState {
                    expected: ChannelState::Idle,
                    found: self.state,
                })
            }
            _ if self.is_active() => {
                return Err(Error::InvalidState {
                    expected: ChannelState::Idle,
                    found: ChannelState::Active,
                })
            }
            _ => {}
        }

        self.modify_status(|cs| cs | ChannelStatus::END);
        self.regs.write(self.word(CONBLK_AD), head.raw());
        self.regs.write(self.word(CS), config.status_bits().bits());

        self.state = ChannelState::Configured;
        debug!("DMA{}: chain at {head} installed", self.index);
        Ok(())
    }

    /// Hand the installed chain to the engine. From here on the engine runs on its own until
    /// [`stop`](DmaChannel::stop).
    pub fn start(&mut self) -> Result<(), Error> {
        if self.state != ChannelState::Configured {
            return Err(Error::InvalidState {
                expected: ChannelState::Configured,
                found: self.state,
            });
        }

        // Preserve the instruction and bus ordering of preceding buffer and register writes
        // to the subsequent access by the DMA engine due to activating it.
        fence(Ordering::SeqCst);

        self.modify_status(|cs| cs | ChannelStatus::ACTIVE);
        self.state = ChannelState::Active;
        debug!("DMA{}: active", self.index);
        Ok(())
    }

    /// Abort, give in-flight transfers [`ABORT_DRAIN`] to finish, deactivate and reset. Every
    /// step is applied whatever state the channel is in. There is no completion handshake: the
    /// drain time is an approximation.
    pub fn stop<D: DelayNs>(&mut self, delay: &mut D) {
        self.state = ChannelState::Stopping;

        self.modify_status(|cs| cs | ChannelStatus::ABORT);
        delay.delay_us(ABORT_DRAIN.ticks());
        self.modify_status(|cs| cs.difference(ChannelStatus::ACTIVE));
        self.modify_status(|cs| cs | ChannelStatus::RESET);

        // Preserve the instruction and bus sequence of the preceding shutdown and
        // the subsequent buffer access.
        fence(Ordering::SeqCst);

        self.state = ChannelState::Idle;
        info!("DMA{}: stopped", self.index);
    }
}
