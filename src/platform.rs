//! Board constants
//!
//! See BCM2835 ARM Peripherals, section 1.2.3 for the address maps. The ARM sees the peripherals
//! at [`PERI_BASE`], while the VideoCore bus (and with it the DMA engine) sees them at
//! [`PERI_BUS_BASE`]. RAM handed out by the VideoCore allocator is reported as a bus address in
//! one of the four 1GB aliases selected by the top two address bits.

#[cfg(feature = "pi1")]
/// ARM physical address of the peripheral space on the BCM2835
pub const PERI_BASE: u32 = 0x2000_0000;
#[cfg(feature = "pi1")]
/// Allocation flags for uncached memory: `MEM_FLAG_DIRECT` (0xC000_0000 alias)
pub const MEM_FLAG: u32 = 0x4;

#[cfg(all(feature = "pi2", not(feature = "pi1")))]
/// ARM physical address of the peripheral space on the BCM2836/7
pub const PERI_BASE: u32 = 0x3F00_0000;
#[cfg(all(feature = "pi2", not(feature = "pi1")))]
/// Allocation flags for uncached memory: `MEM_FLAG_DIRECT | MEM_FLAG_COHERENT`
pub const MEM_FLAG: u32 = 0xC;

/// Bus address of the peripheral space, as seen by the DMA engine
pub const PERI_BUS_BASE: u32 = 0x7E00_0000;

/// Size of one page, the granularity of both the allocator and register windows
pub const PAGE_SIZE: usize = 4096;

/// Offset of the GPIO register block inside the peripheral space
pub const GPIO_REGISTER_BASE: u32 = 0x20_0000;
/// Byte offset of GPSET0 inside the GPIO block
pub const GPIO_SET_OFFSET: usize = 0x1C;
/// Byte offset of GPCLR0 inside the GPIO block
pub const GPIO_CLR_OFFSET: usize = 0x28;
/// Byte offset of GPLEV0 inside the GPIO block
pub const GPIO_LEV_OFFSET: usize = 0x34;

/// Offset of the DMA controller (channels 0-14) inside the peripheral space
pub const DMA_REGISTER_BASE: u32 = 0x7000;

/// DMA channel used by the demos. That usually is free.
pub const DMA_CHANNEL: u8 = 5;

/// GPIO line toggled by the demos
pub const TOGGLE_GPIO: u8 = 14;

/// Number of samples prepared by the memory-backed demos
pub const SAMPLES: usize = 256;

const BUS_ALIAS_MASK: u32 = 0xC000_0000;

/// Strip the cache alias from a VideoCore bus address, giving the ARM physical address.
pub const fn bus_to_phys(bus: u32) -> u32 {
    bus & !BUS_ALIAS_MASK
}

/// Bus address of a register inside one of the peripheral blocks.
pub const fn peripheral_bus_address(block: u32, offset: usize) -> u32 {
    PERI_BUS_BASE + block + offset as u32
}

/// Bus address of GPSET0, the destination of every control block built by this crate.
pub const GPIO_SET_BUS: u32 =
    peripheral_bus_address(GPIO_REGISTER_BASE, GPIO_SET_OFFSET);
