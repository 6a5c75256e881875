//! The five toggle demonstrations behind `gpio-dma-test`
//!
//! Every mode runs the same pipeline: map the GPIO registers, make the output line an output, then
//! hand the line to one of the delivery mechanisms:
//!
//! | Mode | Delivery |
//! |------|----------|
//! | 1 | [`CpuPattern::Direct`] |
//! | 2 | [`CpuPattern::Masked`] over [`SAMPLES`] words |
//! | 3 | [`CpuPattern::SetClear`] over [`SAMPLES`] set/clear pairs |
//! | 4 | DMA, [`Layout::SingleTransferPerBlock`] |
//! | 5 | DMA, [`Layout::MultiTransferPerBlock`] with [`SAMPLES`] samples |
//!
//! The CPU modes run until their [`CancelToken`] is cancelled. The DMA modes start the engine,
//! wait for a line on the input and then stop the channel and release the memory.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::mem;

use embedded_hal::delay::DelayNs;
use log::info;
use thiserror::Error;

use crate::cpu::{self, CancelToken, CpuPattern, ToggleStats};
use crate::delay::Delay;
use crate::dma::{
    self, ChannelStatus, ControlBlock, DmaChannel, DmaConfig, Layout,
    LoopingChain, LoopingTransfer,
};
use crate::gpio::Gpio;
use crate::memory::{self, Mailbox, MemoryService, UncachedAllocator};
use crate::peripheral::{self, DevMem, RegisterMapper};
use crate::platform::{
    DMA_CHANNEL, DMA_REGISTER_BASE, GPIO_REGISTER_BASE, SAMPLES, TOGGLE_GPIO,
};

/// Errors a demonstration can fail with
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Peripheral(#[from] peripheral::Error),
    #[error(transparent)]
    Memory(#[from] memory::Error),
    #[error(transparent)]
    Dma(#[from] dma::Error),
    /// Writing the banner or reading the stop request failed
    #[error("console I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Demonstration selected on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    CpuDirect = 1,
    CpuMasked = 2,
    CpuSetClear = 3,
    DmaSingleTransferPerBlock = 4,
    DmaMultiTransferPerBlock = 5,
}

/// How a mode gets the values to the GPIO registers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Cpu(CpuPattern),
    Dma(Layout),
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::CpuDirect,
        Mode::CpuMasked,
        Mode::CpuSetClear,
        Mode::DmaSingleTransferPerBlock,
        Mode::DmaMultiTransferPerBlock,
    ];

    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.number() == number)
    }

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn delivery(self) -> Delivery {
        match self {
            Mode::CpuDirect => Delivery::Cpu(CpuPattern::Direct),
            Mode::CpuMasked => Delivery::Cpu(CpuPattern::Masked),
            Mode::CpuSetClear => Delivery::Cpu(CpuPattern::SetClear),
            Mode::DmaSingleTransferPerBlock => {
                Delivery::Dma(Layout::SingleTransferPerBlock)
            }
            Mode::DmaMultiTransferPerBlock => {
                Delivery::Dma(Layout::MultiTransferPerBlock { samples: SAMPLES })
            }
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Mode::CpuDirect => "CPU: Writing to GPIO directly in tight loop",
            Mode::CpuMasked => {
                "CPU: reading word from memory, write masked to GPIO set/clr."
            }
            Mode::CpuSetClear => {
                "CPU: reading prepared set/clr from memory, write to GPIO."
            }
            Mode::DmaSingleTransferPerBlock => {
                "DMA: Single control block per set/reset GPIO"
            }
            Mode::DmaMultiTransferPerBlock => {
                "DMA: Sending a sequence of set/clear with one DMA control block and negative destination stride."
            }
        }
    }

    /// What is printed when the mode starts, telling how to end it
    pub fn banner(self) -> String {
        let how_to_exit = match self.delivery() {
            Delivery::Cpu(_) => "== Press Ctrl-C to exit.\n",
            Delivery::Dma(_) => {
                "== Press <RETURN> to exit (with CTRL-C DMA keeps going)."
            }
        };
        format!("{}) {}\n{how_to_exit}", self.number(), self.description())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}) {}", self.number(), self.description())
    }
}

/// Usage text for the binary invoked as `prog`
pub fn usage(prog: &str) -> String {
    let mut text = format!(
        "Usage {prog} [1...5]\n\
         Give number of test operation as argument to {prog}\n\
         Test operation\n\
         == Baseline tests, using CPU directly ==\n"
    );
    for mode in Mode::ALL {
        if mode == Mode::DmaSingleTransferPerBlock {
            text.push_str("\n== DMA tests, using DMA to pump data to ==\n");
        }
        text.push_str(&format!("{} - {}\n", mode.number(), mode.description()));
    }
    text
}

/// Where the demos get their registers, memory and delays from
pub trait Platform {
    type Mapper: RegisterMapper;
    type Memory: MemoryService;
    type Delay: DelayNs;

    fn mapper(&self) -> &Self::Mapper;

    /// Open the uncached memory service. Only the DMA modes call this.
    fn open_memory(&self) -> Result<Self::Memory, memory::Error>;

    fn delay(&self) -> Self::Delay;
}

/// A Raspberry Pi running Linux: `/dev/mem` and the `/dev/vcio` mailbox
#[derive(Clone, Copy, Debug, Default)]
pub struct Linux;

impl Platform for Linux {
    type Mapper = DevMem;
    type Memory = Mailbox;
    type Delay = Delay;

    fn mapper(&self) -> &DevMem {
        &DevMem
    }

    fn open_memory(&self) -> Result<Mailbox, memory::Error> {
        Mailbox::open()
    }

    fn delay(&self) -> Delay {
        Delay::new()
    }
}

/// How a demonstration ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A CPU mode was cancelled
    Cancelled(ToggleStats),
    /// A DMA mode was stopped; the channel status after shutdown
    Stopped(ChannelStatus),
}

/// Run `mode` on `platform`. The banner goes to `out`; the DMA modes wait for a line on `input`.
pub fn run<P, O, I>(
    platform: &P,
    mode: Mode,
    out: &mut O,
    input: &mut I,
    cancel: &CancelToken,
) -> Result<Outcome, Error>
where
    P: Platform,
    O: Write,
    I: BufRead,
{
    let gpio =
        Gpio::new(platform.mapper().map_register_window(GPIO_REGISTER_BASE)?);
    let mut pin = gpio.into_output::<TOGGLE_GPIO>();
    let mask = pin.mask();

    let layout = match mode.delivery() {
        Delivery::Cpu(pattern) => {
            write!(out, "{}", mode.banner())?;
            out.flush()?;

            let stats = match pattern {
                CpuPattern::Direct => cpu::run_direct(&mut pin, cancel)
                    .unwrap_or_else(|never| match never {}),
                CpuPattern::Masked => {
                    let samples = cpu::masked_samples(mask, SAMPLES);
                    cpu::run_masked(&gpio, mask, &samples, cancel)
                }
                CpuPattern::SetClear => {
                    let samples = cpu::set_clear_samples(mask, SAMPLES);
                    cpu::run_set_clear(&gpio, &samples, cancel)
                }
            };
            info!(
                "{mode}: {} writes in {:?} ({} kHz)",
                stats.writes,
                stats.elapsed,
                stats.write_rate().to_kHz()
            );
            return Ok(Outcome::Cancelled(stats));
        }
        Delivery::Dma(layout) => layout,
    };

    let allocator = UncachedAllocator::new(platform.open_memory()?);
    let mut source = allocator.allocate(layout.source_size())?;
    let mut blocks = allocator.allocate(mem::size_of::<ControlBlock>())?;
    let chain = LoopingChain::build(layout, mask, &mut source, &mut blocks)?;

    let regs = platform.mapper().map_register_window(DMA_REGISTER_BASE)?;
    let mut channel = DmaChannel::new(&regs, DMA_CHANNEL);
    let config = DmaConfig::new()
        .priority(7)
        .panic_priority(7)
        .disable_debug_pause();

    let transfer =
        LoopingTransfer::start(&mut channel, chain, &config, platform.delay())?;

    // From here the engine toggles the line; the CPU only waits
    write!(out, "{}", mode.banner())?;
    out.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;

    let status = transfer.stop();
    source.free()?;
    blocks.free()?;

    Ok(Outcome::Stopped(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::Function;
    use crate::peripheral::RegisterAccess;
    use crate::sim::SimPlatform;

    const CS: usize = 0x500 / 4;

    fn run_sim(
        platform: &SimPlatform,
        mode: Mode,
        input: &str,
    ) -> (Result<Outcome, Error>, String) {
        let mut out = Vec::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result =
            run(platform, mode, &mut out, &mut input.as_bytes(), &cancel);
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn mode_numbers() {
        for (i, mode) in Mode::ALL.into_iter().enumerate() {
            assert_eq!(Mode::from_number(i as u8 + 1), Some(mode));
        }
        assert_eq!(Mode::from_number(0), None);
        assert_eq!(Mode::from_number(6), None);
    }

    #[test]
    fn banners() {
        assert_eq!(
            Mode::CpuDirect.banner(),
            "1) CPU: Writing to GPIO directly in tight loop\n== Press Ctrl-C to exit.\n"
        );
        assert_eq!(
            Mode::DmaSingleTransferPerBlock.banner(),
            "4) DMA: Single control block per set/reset GPIO\n\
             == Press <RETURN> to exit (with CTRL-C DMA keeps going)."
        );
    }

    #[test]
    fn usage_lists_every_mode() {
        let text = usage("gpio-dma-test");
        assert!(text.starts_with("Usage gpio-dma-test [1...5]\n"));
        for mode in Mode::ALL {
            assert!(text.contains(&format!("{} - {}", mode.number(), mode.description())));
        }
        let dma = text.find("== DMA tests").unwrap();
        assert!(text.find("3 - ").unwrap() < dma);
        assert!(dma < text.find("4 - ").unwrap());
    }

    #[test]
    fn dma_modes_leave_channel_stopped_and_memory_released() {
        for mode in [
            Mode::DmaSingleTransferPerBlock,
            Mode::DmaMultiTransferPerBlock,
        ] {
            let platform = SimPlatform::new();
            let (result, out) = run_sim(&platform, mode, "\n");

            let status = match result {
                Ok(Outcome::Stopped(status)) => status,
                other => panic!("{mode}: {other:?}"),
            };
            assert!(!status.contains(ChannelStatus::ACTIVE));
            assert!(status.contains(ChannelStatus::RESET));
            assert_eq!(out, mode.banner());

            let dma = platform.peripherals.window(DMA_REGISTER_BASE);
            assert_eq!(dma.read(CS), status.bits());
            assert_eq!(status.priority(), 7);
            assert_eq!(status.panic_priority(), 7);
            assert!(status.contains(ChannelStatus::DISDEBUG));
            assert_ne!(dma.read(CS + 1), 0);

            assert_eq!(platform.memory.live_allocations(), 0);
            assert_eq!(platform.memory.released().len(), 2);
            assert_eq!(platform.delay.waited_ns(), 100_000);

            let gpio = Gpio::new(platform.peripherals.window(GPIO_REGISTER_BASE));
            assert_eq!(gpio.function(TOGGLE_GPIO), Function::Output);
        }
    }

    #[test]
    fn dma_mode_stops_at_end_of_input() {
        let platform = SimPlatform::new();
        let (result, _) =
            run_sim(&platform, Mode::DmaMultiTransferPerBlock, "");
        assert!(matches!(result, Ok(Outcome::Stopped(_))));
        assert_eq!(platform.memory.live_allocations(), 0);
    }

    #[test]
    fn dma_mode_stops_channel_when_input_fails() {
        struct Broken;

        impl io::Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }

        let platform = SimPlatform::new();
        let cancel = CancelToken::new();
        let result = run(
            &platform,
            Mode::DmaSingleTransferPerBlock,
            &mut io::sink(),
            &mut io::BufReader::new(Broken),
            &cancel,
        );

        assert!(matches!(result, Err(Error::Io(_))));
        let cs = ChannelStatus::from_bits_retain(
            platform.peripherals.window(DMA_REGISTER_BASE).read(CS),
        );
        assert!(!cs.contains(ChannelStatus::ACTIVE));
        assert!(cs.contains(ChannelStatus::RESET));
        assert_eq!(platform.memory.live_allocations(), 0);
    }

    #[test]
    fn dma_mode_reports_exhausted_memory() {
        let platform = SimPlatform::new();
        platform.memory.exhaust();
        let (result, out) =
            run_sim(&platform, Mode::DmaSingleTransferPerBlock, "\n");
        assert!(matches!(
            result,
            Err(Error::Memory(memory::Error::NoContiguousMemory { .. }))
        ));
        assert!(out.is_empty());
        assert_eq!(platform.memory.live_allocations(), 0);
    }

    #[test]
    fn cpu_modes_configure_output_and_return_when_cancelled() {
        for mode in [Mode::CpuDirect, Mode::CpuMasked, Mode::CpuSetClear] {
            let platform = SimPlatform::new();
            let (result, out) = run_sim(&platform, mode, "");

            assert!(matches!(result, Ok(Outcome::Cancelled(stats)) if stats.passes == 0));
            assert_eq!(out, mode.banner());
            let gpio = Gpio::new(platform.peripherals.window(GPIO_REGISTER_BASE));
            assert_eq!(gpio.function(TOGGLE_GPIO), Function::Output);
            // The CPU modes never touch the allocator
            assert!(platform.memory.released().is_empty());
        }
    }
}
