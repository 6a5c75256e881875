//! Self-looping control block chains that replay GPIO set/clear values
//!
//! Both layouts build a single control block whose next pointer names the block itself, so the
//! engine repeats the transfer until the channel is stopped. They differ in how the source data is
//! laid out:
//!
//! - [`Layout::SingleTransferPerBlock`]: one [`SetClear`] pair. The block copies 2 rows of 4 bytes
//!   and skips the 8 byte gap between GPSET0 and GPCLR0 with a destination stride of 8.
//! - [`Layout::MultiTransferPerBlock`]: `samples` [`RegisterMirror`]s, which copy the register
//!   layout from GPSET0 up to GPCLR0. Each row writes 16 bytes and a destination stride of -16
//!   rewinds to GPSET0 for the next row. The two words in the middle land on the upper set
//!   register and the reserved word between the banks; writing zero there is harmless on the
//!   hardware we know of, but it is not documented behaviour.

use core::marker::PhantomData;
use core::mem;

use log::debug;

use super::cb::{ControlBlock, Stride, TransferInfo, TransferLength};
use super::Error;
use crate::memory::{BusAddress, DmaData, MemoryService, UncachedBlock};
use crate::platform::GPIO_SET_BUS;

/// A pre-split set/clear pair, as written to GPSET0 and GPCLR0
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetClear {
    pub set: u32,
    pub clear: u32,
}

// SAFETY: repr(C), two u32s
unsafe impl DmaData for SetClear {}

impl SetClear {
    pub const fn new(set: u32, clear: u32) -> Self {
        Self { set, clear }
    }
}

/// A copy of the GPIO registers from GPSET0 to GPCLR0 inclusive
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterMirror {
    pub set: u32,
    /// GPSET1, lines 32-53. Left at zero.
    pub ignored_upper_set_bits: u32,
    /// Reserved word between the set and clear banks
    pub reserved: u32,
    pub clear: u32,
}

// SAFETY: repr(C), four u32s
unsafe impl DmaData for RegisterMirror {}

/// How the source data of a looping chain is arranged
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    /// One set/clear pair, one control block per pair
    SingleTransferPerBlock,
    /// `samples` register mirrors handled by one control block
    MultiTransferPerBlock { samples: usize },
}

impl Layout {
    /// Bytes of source data the layout needs
    pub fn source_size(&self) -> usize {
        match *self {
            Layout::SingleTransferPerBlock => mem::size_of::<SetClear>(),
            Layout::MultiTransferPerBlock { samples } => {
                samples * mem::size_of::<RegisterMirror>()
            }
        }
    }

    /// Rows and row length of the 2D transfer
    pub fn transfer_length(&self) -> Result<TransferLength, Error> {
        match *self {
            Layout::SingleTransferPerBlock => {
                TransferLength::two_d(2, mem::size_of::<u32>())
            }
            Layout::MultiTransferPerBlock { samples } => {
                TransferLength::two_d(samples, mem::size_of::<RegisterMirror>())
            }
        }
    }

    /// Strides applied after each row
    pub fn stride(&self) -> Stride {
        match self {
            // Skip GPSET1 and the reserved word to reach GPCLR0
            Layout::SingleTransferPerBlock => Stride::new(8, 0),
            // Back to GPSET0, keep reading forward
            Layout::MultiTransferPerBlock { .. } => {
                Stride::new(-(mem::size_of::<RegisterMirror>() as i16), 0)
            }
        }
    }
}

/// A control block that loops on itself, installed in uncached memory.
///
/// The chain keeps the source and control block memory mutably borrowed for `'b`, so neither can
/// be written or released while a transfer may be running it.
#[derive(Debug)]
pub struct LoopingChain<'b> {
    head: BusAddress,
    layout: Layout,
    _buffers: PhantomData<&'b mut ()>,
}

impl<'b> LoopingChain<'b> {
    /// Fill `source` with set/clear values for the lines in `mask` according to `layout` and
    /// write the looping control block to the start of `blocks`.
    pub fn build<'a: 'b, S: MemoryService>(
        layout: Layout,
        mask: u32,
        source: &'b mut UncachedBlock<'a, S>,
        blocks: &'b mut UncachedBlock<'a, S>,
    ) -> Result<Self, Error> {
        let length = layout.transfer_length()?;

        let source_address = match layout {
            Layout::SingleTransferPerBlock => {
                let data = source.prefix_mut::<SetClear>(1)?;
                data[0] = SetClear::new(mask, mask);
                let first = data.as_ptr();
                source.to_bus(first)?
            }
            Layout::MultiTransferPerBlock { samples } => {
                let data = source.prefix_mut::<RegisterMirror>(samples)?;
                data.fill(RegisterMirror {
                    set: mask,
                    clear: mask,
                    ..Default::default()
                });
                let first = data.as_ptr();
                source.to_bus(first)?
            }
        };

        let first = blocks.prefix_mut::<ControlBlock>(1)?.as_ptr();
        let head = blocks.to_bus(first)?;

        let cb = ControlBlock::new()
            .with_transfer_info(
                TransferInfo::SRC_INC
                    | TransferInfo::DEST_INC
                    | TransferInfo::NO_WIDE_BURSTS
                    | TransferInfo::TDMODE,
            )
            .with_source(source_address)
            .with_destination(BusAddress::from_raw(GPIO_SET_BUS))
            .with_length(length)
            .with_stride(layout.stride())
            .with_next(head);
        blocks.prefix_mut::<ControlBlock>(1)?[0] = cb;

        debug!("{layout:?}: control block at {head}, source at {source_address}");

        Ok(Self {
            head,
            layout,
            _buffers: PhantomData,
        })
    }

    /// Bus address of the first control block
    pub fn head(&self) -> BusAddress {
        self.head
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::UncachedAllocator;
    use crate::platform::{GPIO_REGISTER_BASE, GPIO_CLR_OFFSET, GPIO_SET_OFFSET};
    use crate::sim::{RegisterWrite, SimMemory};

    const MASK: u32 = 1 << 14;
    const SET: u32 = GPIO_REGISTER_BASE + GPIO_SET_OFFSET as u32;
    const CLR: u32 = GPIO_REGISTER_BASE + GPIO_CLR_OFFSET as u32;

    fn control_block<S: MemoryService>(blocks: &UncachedBlock<'_, S>) -> ControlBlock {
        blocks.as_slice::<ControlBlock>().unwrap()[0]
    }

    #[test]
    fn single_transfer_block_loops_on_itself() {
        let memory = SimMemory::new();
        let allocator = UncachedAllocator::new(memory.clone());
        let layout = Layout::SingleTransferPerBlock;
        let mut source = allocator.allocate(layout.source_size()).unwrap();
        let mut blocks = allocator
            .allocate(mem::size_of::<ControlBlock>())
            .unwrap();

        let head = LoopingChain::build(layout, MASK, &mut source, &mut blocks)
            .unwrap()
            .head();

        let cb = control_block(&blocks);
        assert_eq!(head, blocks.bus_address());
        assert_eq!(cb.next(), Some(head));
        assert_eq!(cb.source(), source.bus_address());
        assert_eq!(cb.destination().raw(), 0x7E20_001C);
        assert_eq!(cb.length().rows(), 2);
        assert_eq!(cb.length().row_bytes(), 4);
        assert_eq!(cb.stride(), Stride::new(8, 0));
        assert!(cb.transfer_info().contains(TransferInfo::TDMODE));
        assert_eq!(
            source.as_slice::<SetClear>().unwrap()[0],
            SetClear::new(MASK, MASK)
        );
    }

    #[test]
    fn multi_transfer_block_loops_on_itself_for_any_count() {
        let memory = SimMemory::new();
        let allocator = UncachedAllocator::new(memory.clone());

        for samples in [1, 2, 255, 256, 1000] {
            let layout = Layout::MultiTransferPerBlock { samples };
            let mut source = allocator.allocate(layout.source_size()).unwrap();
            let mut blocks = allocator
                .allocate(mem::size_of::<ControlBlock>())
                .unwrap();

            let chain =
                LoopingChain::build(layout, MASK, &mut source, &mut blocks)
                    .unwrap();
            let head = chain.head();

            let cb = control_block(&blocks);
            assert_eq!(cb.next(), Some(head), "{samples} samples");
            assert_eq!(cb.length().rows(), samples);
            assert_eq!(cb.length().row_bytes(), 16);
            assert_eq!(cb.stride(), Stride::new(-16, 0));

            let data = source.as_slice::<RegisterMirror>().unwrap();
            assert!(data[..samples].iter().all(|m| m.set == MASK
                && m.clear == MASK
                && m.ignored_upper_set_bits == 0
                && m.reserved == 0));
        }
    }

    #[test]
    fn multi_transfer_with_256_samples_packs_length() {
        let layout = Layout::MultiTransferPerBlock { samples: 256 };
        let length = layout.transfer_length().unwrap();
        assert_eq!(length.bits(), 0x00FF_0010);
        let decoded = TransferLength::from_bits(length.bits());
        assert_eq!((decoded.rows(), decoded.row_bytes()), (256, 16));
    }

    #[test]
    fn zero_samples_is_refused() {
        let allocator = UncachedAllocator::new(SimMemory::new());
        let mut source = allocator.allocate(16).unwrap();
        let mut blocks = allocator.allocate(32).unwrap();
        let result = LoopingChain::build(
            Layout::MultiTransferPerBlock { samples: 0 },
            MASK,
            &mut source,
            &mut blocks,
        );
        assert!(matches!(
            result,
            Err(Error::TransferTooLarge { rows: 0, .. })
        ));
    }

    #[test]
    fn too_small_source_is_refused() {
        let allocator = UncachedAllocator::new(SimMemory::new());
        let mut source = allocator.allocate(16).unwrap();
        let mut blocks = allocator.allocate(32).unwrap();
        // One page holds 256 mirrors, not 257
        let result = LoopingChain::build(
            Layout::MultiTransferPerBlock { samples: 257 },
            MASK,
            &mut source,
            &mut blocks,
        );
        assert!(matches!(result, Err(Error::Memory(_))));
    }

    #[test]
    fn single_transfer_pass_writes_set_then_clear() {
        let memory = SimMemory::new();
        let allocator = UncachedAllocator::new(memory.clone());
        let layout = Layout::SingleTransferPerBlock;
        let mut source = allocator.allocate(layout.source_size()).unwrap();
        let mut blocks = allocator.allocate(32).unwrap();
        let head = LoopingChain::build(layout, MASK, &mut source, &mut blocks)
            .unwrap()
            .head();

        let (writes, next) = memory.run_control_block(head);
        assert_eq!(
            writes,
            vec![
                RegisterWrite { offset: SET, value: MASK },
                RegisterWrite { offset: CLR, value: MASK },
            ]
        );
        assert_eq!(next, Some(head));
    }

    #[test]
    fn multi_transfer_pass_rewinds_to_set_register() {
        let memory = SimMemory::new();
        let allocator = UncachedAllocator::new(memory.clone());
        let layout = Layout::MultiTransferPerBlock { samples: 3 };
        let mut source = allocator.allocate(layout.source_size()).unwrap();
        let mut blocks = allocator.allocate(32).unwrap();
        let head = LoopingChain::build(layout, MASK, &mut source, &mut blocks)
            .unwrap()
            .head();

        let (writes, _) = memory.run_control_block(head);
        assert_eq!(writes.len(), 3 * 4);
        for row in writes.chunks(4) {
            assert_eq!(
                row,
                [
                    RegisterWrite { offset: SET, value: MASK },
                    RegisterWrite { offset: SET + 4, value: 0 },
                    RegisterWrite { offset: SET + 8, value: 0 },
                    RegisterWrite { offset: CLR, value: MASK },
                ]
            );
        }
    }
}
