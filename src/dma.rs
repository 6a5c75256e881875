//! The BCM283x DMA controller, used to write GPIO registers without the CPU.
//!
//! The controller has 16 channels; channels 0-14 are reachable through the register block at
//! [`DMA_REGISTER_BASE`](crate::platform::DMA_REGISTER_BASE), each occupying 0x100 bytes. A
//! channel executes a chain of [control blocks](ControlBlock) that live in memory and refer to
//! everything by bus address. Because the engine does not see the CPU caches, both the control
//! blocks and the data they copy must live in [uncached memory](crate::memory).
//!
//! # Usage
//!
//! A [`LoopingChain`] is built from two uncached blocks, one for the source data and one for the
//! control block. The chain's only block names itself as its successor, so once started the
//! channel replays the transfer until it is stopped:
//!
//! ```no_run
//! use rpi_dma_gpio::delay::Delay;
//! use rpi_dma_gpio::dma::{DmaChannel, DmaConfig, Layout, LoopingChain, LoopingTransfer};
//! use rpi_dma_gpio::memory::{Mailbox, UncachedAllocator};
//! use rpi_dma_gpio::peripheral::{DevMem, RegisterMapper};
//! use rpi_dma_gpio::platform::{DMA_CHANNEL, DMA_REGISTER_BASE};
//!
//! let allocator = UncachedAllocator::new(Mailbox::open()?);
//! let layout = Layout::MultiTransferPerBlock { samples: 256 };
//! let mut source = allocator.allocate(layout.source_size())?;
//! let mut blocks = allocator.allocate(32)?;
//! let chain = LoopingChain::build(layout, 1 << 14, &mut source, &mut blocks)?;
//!
//! let regs = DevMem.map_register_window(DMA_REGISTER_BASE)?;
//! let mut channel = DmaChannel::new(&regs, DMA_CHANNEL);
//! let config = DmaConfig::new().priority(7).panic_priority(7).disable_debug_pause();
//! let transfer = LoopingTransfer::start(&mut channel, chain, &config, Delay::new())?;
//! // ... the engine toggles the line on its own ...
//! transfer.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Stopping
//!
//! There is no completion handshake for an aborted looping chain. Stopping sets ABORT, waits
//! [`ABORT_DRAIN`] for in-flight writes, clears ACTIVE and resets the channel. Dropping a
//! [`LoopingTransfer`] stops the channel too, and the transfer borrows the chain's buffers, so
//! they cannot be released while the engine may still read them.

use embedded_hal::delay::DelayNs;
use thiserror::Error;

use crate::memory;
use crate::peripheral::RegisterAccess;

mod cb;
mod ch;
mod chain;
pub mod config;

pub use cb::{ControlBlock, Stride, TransferInfo, TransferLength, MAX_ROWS};
pub use ch::{
    ChannelState, ChannelStatus, DmaChannel, ABORT_DRAIN, MAX_CHANNEL,
};
pub use chain::{Layout, LoopingChain, RegisterMirror, SetClear};
pub use config::DmaConfig;

/// Errors that can occur setting up or running a transfer
#[derive(Debug, Error)]
pub enum Error {
    /// The uncached memory backing a chain could not be used
    #[error(transparent)]
    Memory(#[from] memory::Error),
    /// The transfer does not fit the 2D length field of a control block
    #[error("{rows} rows of {row_bytes} bytes don't fit a control block")]
    TransferTooLarge { rows: usize, row_bytes: usize },
    /// The channel was asked to do something its current state doesn't allow
    #[error("DMA channel is {found:?}, expected {expected:?}")]
    InvalidState {
        expected: ChannelState,
        found: ChannelState,
    },
}

/// A looping chain running on a channel.
///
/// The transfer holds the channel and the chain (and through it the chain's buffers) until it is
/// stopped. Dropping it without calling [`stop`](LoopingTransfer::stop) stops the channel as well.
pub struct LoopingTransfer<'c, 'w, 'b, W: RegisterAccess, D: DelayNs> {
    channel: &'c mut DmaChannel<'w, W>,
    chain: LoopingChain<'b>,
    delay: D,
    stopped: bool,
}

impl<'c, 'w, 'b, W: RegisterAccess, D: DelayNs> LoopingTransfer<'c, 'w, 'b, W, D> {
    /// Install `chain` on `channel` with `config` and activate the channel.
    pub fn start(
        channel: &'c mut DmaChannel<'w, W>,
        chain: LoopingChain<'b>,
        config: &DmaConfig,
        delay: D,
    ) -> Result<Self, Error> {
        channel.configure(chain.head(), config)?;
        channel.start()?;
        Ok(Self {
            channel,
            chain,
            delay,
            stopped: false,
        })
    }

    pub fn chain(&self) -> &LoopingChain<'b> {
        &self.chain
    }

    /// Live status of the channel
    pub fn status(&self) -> ChannelStatus {
        self.channel.status()
    }

    /// Stop the channel and end the borrow of the chain's buffers, which the caller can then
    /// free. Returns the channel status after the shutdown sequence.
    pub fn stop(mut self) -> ChannelStatus {
        self.shutdown();
        self.channel.status()
    }

    fn shutdown(&mut self) {
        if !self.stopped {
            self.channel.stop(&mut self.delay);
            self.stopped = true;
        }
    }
}

impl<W: RegisterAccess, D: DelayNs> Drop for LoopingTransfer<'_, '_, '_, W, D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::UncachedAllocator;
    use crate::peripheral::RegisterMapper;
    use crate::platform::{DMA_CHANNEL, DMA_REGISTER_BASE};
    use crate::sim::{SimMemory, SimPeripherals};

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _: u32) {}
    }

    #[test]
    fn transfer_runs_until_stopped() {
        let memory = SimMemory::new();
        let allocator = UncachedAllocator::new(memory.clone());
        let mut source = allocator.allocate(8).unwrap();
        let mut blocks = allocator.allocate(32).unwrap();
        let chain = LoopingChain::build(
            Layout::SingleTransferPerBlock,
            1 << 14,
            &mut source,
            &mut blocks,
        )
        .unwrap();
        let head = chain.head();

        let regs = SimPeripherals::new()
            .map_register_window(DMA_REGISTER_BASE)
            .unwrap();
        let mut channel = DmaChannel::new(&regs, DMA_CHANNEL);
        let config = DmaConfig::new()
            .priority(7)
            .panic_priority(7)
            .disable_debug_pause();

        let transfer =
            LoopingTransfer::start(&mut channel, chain, &config, NoDelay).unwrap();
        assert_eq!(transfer.chain().head(), head);
        let running = transfer.status();
        assert!(running.contains(ChannelStatus::ACTIVE | ChannelStatus::DISDEBUG));
        assert_eq!(running.priority(), 7);

        let stopped = transfer.stop();
        assert!(!stopped.contains(ChannelStatus::ACTIVE));
        assert!(stopped.contains(ChannelStatus::RESET));
        assert_eq!(channel.state(), ChannelState::Idle);
        assert_eq!(channel.control_block_address(), head);

        // Buffers are ours again
        source.free().unwrap();
        blocks.free().unwrap();
        assert_eq!(memory.live_allocations(), 0);
    }

    #[test]
    fn dropping_transfer_stops_channel() {
        let allocator = UncachedAllocator::new(SimMemory::new());
        let mut source = allocator.allocate(4096).unwrap();
        let mut blocks = allocator.allocate(32).unwrap();
        let chain = LoopingChain::build(
            Layout::MultiTransferPerBlock { samples: 256 },
            1 << 14,
            &mut source,
            &mut blocks,
        )
        .unwrap();

        let regs = SimPeripherals::new()
            .map_register_window(DMA_REGISTER_BASE)
            .unwrap();
        let mut channel = DmaChannel::new(&regs, DMA_CHANNEL);
        {
            let transfer = LoopingTransfer::start(
                &mut channel,
                chain,
                &DmaConfig::new(),
                NoDelay,
            )
            .unwrap();
            assert!(transfer.status().contains(ChannelStatus::ACTIVE));
        }
        assert!(!channel.is_active());
        assert!(channel.status().contains(ChannelStatus::RESET));
    }

    #[test]
    fn start_on_busy_channel_fails_without_touching_it() {
        let allocator = UncachedAllocator::new(SimMemory::new());
        let mut source = allocator.allocate(8).unwrap();
        let mut blocks = allocator.allocate(32).unwrap();
        let chain = LoopingChain::build(
            Layout::SingleTransferPerBlock,
            1 << 14,
            &mut source,
            &mut blocks,
        )
        .unwrap();

        let regs = SimPeripherals::new()
            .map_register_window(DMA_REGISTER_BASE)
            .unwrap();
        regs.write(0x500 / 4, ChannelStatus::ACTIVE.bits());
        regs.write(0x500 / 4 + 1, 0xDEAD_BEE0);
        let mut channel = DmaChannel::new(&regs, DMA_CHANNEL);

        assert!(matches!(
            LoopingTransfer::start(&mut channel, chain, &DmaConfig::new(), NoDelay),
            Err(Error::InvalidState { .. })
        ));
        assert_eq!(channel.control_block_address().raw(), 0xDEAD_BEE0);
    }
}
