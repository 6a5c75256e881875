//! Control blocks, the in-memory descriptors the DMA engine executes.
//!
//! See BCM2835 ARM Peripherals 4.2.1.1. A control block is 32 bytes, must be 32 byte aligned,
//! and refers to everything (source, destination, next block) by bus address.

use bitflags::bitflags;

use super::Error;
use crate::memory::{BusAddress, DmaData};

bitflags! {
    /// Transfer information (TI) word of a control block
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TransferInfo: u32 {
        /// Interrupt when this block completes
        const INTEN = 1 << 0;
        /// 2D mode: the length is rows x row bytes and the strides apply between rows
        const TDMODE = 1 << 1;
        /// Wait for the AXI write response of each write
        const WAIT_RESP = 1 << 3;
        /// Increment the destination address
        const DEST_INC = 1 << 4;
        /// 128 bit destination writes
        const DEST_WIDTH = 1 << 5;
        /// Pace writes with the peripheral's DREQ
        const DEST_DREQ = 1 << 6;
        /// Do not perform destination writes
        const DEST_IGNORE = 1 << 7;
        /// Increment the source address
        const SRC_INC = 1 << 8;
        /// 128 bit source reads
        const SRC_WIDTH = 1 << 9;
        /// Pace reads with the peripheral's DREQ
        const SRC_DREQ = 1 << 10;
        /// Do not perform source reads
        const SRC_IGNORE = 1 << 11;
        /// Do not issue wide bursts
        const NO_WIDE_BURSTS = 1 << 26;
    }
}

/// Largest row count the 14 bit YLENGTH field can express
pub const MAX_ROWS: usize = 1 << 14;

const YLENGTH_MASK: u32 = 0x3FFF;
const XLENGTH_MASK: u32 = 0xFFFF;

/// TXFR_LEN of a 2D transfer: `rows` rows of `row_bytes` bytes each
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferLength {
    rows: u32,
    row_bytes: u32,
}

impl TransferLength {
    /// Fails unless `1 <= rows <= MAX_ROWS` and `1 <= row_bytes <= 0xFFFF`.
    pub fn two_d(rows: usize, row_bytes: usize) -> Result<Self, Error> {
        let rows_ok = (1..=MAX_ROWS).contains(&rows);
        let row_bytes_ok = (1..=XLENGTH_MASK as usize).contains(&row_bytes);
        if !rows_ok || !row_bytes_ok {
            return Err(Error::TransferTooLarge { rows, row_bytes });
        }
        Ok(Self {
            rows: rows as u32,
            row_bytes: row_bytes as u32,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows as usize
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes as usize
    }

    /// Packed register value. YLENGTH holds the row count minus one.
    pub const fn bits(&self) -> u32 {
        (((self.rows - 1) & YLENGTH_MASK) << 16) | (self.row_bytes & XLENGTH_MASK)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self {
            rows: ((bits >> 16) & YLENGTH_MASK) + 1,
            row_bytes: bits & XLENGTH_MASK,
        }
    }
}

/// STRIDE of a 2D transfer: signed byte increments applied after each row
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stride {
    pub destination: i16,
    pub source: i16,
}

impl Stride {
    pub const fn new(destination: i16, source: i16) -> Self {
        Self {
            destination,
            source,
        }
    }

    pub const fn bits(&self) -> u32 {
        ((self.destination as u16 as u32) << 16) | self.source as u16 as u32
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self {
            destination: (bits >> 16) as u16 as i16,
            source: bits as u16 as i16,
        }
    }
}

/// One DMA control block
#[repr(C, align(32))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlBlock {
    ti: u32,
    source_ad: u32,
    dest_ad: u32,
    txfr_len: u32,
    stride: u32,
    nextconbk: u32,
    _reserved: [u32; 2],
}

// SAFETY: repr(C), only u32 fields, all zeroes is the "empty" block
unsafe impl DmaData for ControlBlock {}

impl ControlBlock {
    pub const fn new() -> Self {
        Self {
            ti: 0,
            source_ad: 0,
            dest_ad: 0,
            txfr_len: 0,
            stride: 0,
            nextconbk: 0,
            _reserved: [0; 2],
        }
    }

    pub fn with_transfer_info(mut self, info: TransferInfo) -> Self {
        self.ti = info.bits();
        self
    }

    pub fn with_source(mut self, source: BusAddress) -> Self {
        self.source_ad = source.raw();
        self
    }

    pub fn with_destination(mut self, destination: BusAddress) -> Self {
        self.dest_ad = destination.raw();
        self
    }

    pub fn with_length(mut self, length: TransferLength) -> Self {
        self.txfr_len = length.bits();
        self
    }

    pub fn with_stride(mut self, stride: Stride) -> Self {
        self.stride = stride.bits();
        self
    }

    /// Chain to the block at `next`. A block may name itself to loop forever.
    pub fn with_next(mut self, next: BusAddress) -> Self {
        self.nextconbk = next.raw();
        self
    }

    pub fn transfer_info(&self) -> TransferInfo {
        TransferInfo::from_bits_retain(self.ti)
    }

    pub fn source(&self) -> BusAddress {
        BusAddress::from_raw(self.source_ad)
    }

    pub fn destination(&self) -> BusAddress {
        BusAddress::from_raw(self.dest_ad)
    }

    pub fn length(&self) -> TransferLength {
        TransferLength::from_bits(self.txfr_len)
    }

    pub fn stride(&self) -> Stride {
        Stride::from_bits(self.stride)
    }

    /// The next block, or `None` at the end of the chain
    pub fn next(&self) -> Option<BusAddress> {
        (self.nextconbk != 0).then_some(BusAddress::from_raw(self.nextconbk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_block_is_32_bytes_aligned() {
        assert_eq!(core::mem::size_of::<ControlBlock>(), 32);
        assert_eq!(core::mem::align_of::<ControlBlock>(), 32);
    }

    #[test]
    fn length_for_256_samples_decodes_back() {
        let length = TransferLength::two_d(256, 16).unwrap();
        assert_eq!(length.bits(), (255 << 16) | 16);

        let decoded = TransferLength::from_bits(length.bits());
        assert_eq!(decoded.rows(), 256);
        assert_eq!(decoded.row_bytes(), 16);
    }

    #[test]
    fn length_extremes() {
        let single = TransferLength::two_d(2, 4).unwrap();
        assert_eq!(single.bits(), (1 << 16) | 4);

        let longest = TransferLength::two_d(MAX_ROWS, 0xFFFF).unwrap();
        assert_eq!(TransferLength::from_bits(longest.bits()), longest);

        assert!(TransferLength::two_d(0, 16).is_err());
        assert!(TransferLength::two_d(MAX_ROWS + 1, 16).is_err());
        assert!(TransferLength::two_d(1, 0).is_err());
        assert!(TransferLength::two_d(1, 0x1_0000).is_err());
    }

    #[test]
    fn stride_encodes_negative_destination() {
        let stride = Stride::new(-16, 0);
        assert_eq!(stride.bits(), 0xFFF0_0000);
        assert_eq!(Stride::from_bits(stride.bits()), stride);

        assert_eq!(Stride::new(8, 0).bits(), 0x0008_0000);
        assert_eq!(Stride::new(0, -4).bits(), 0x0000_FFFC);
    }

    #[test]
    fn builder_fills_fields() {
        let info = TransferInfo::SRC_INC
            | TransferInfo::DEST_INC
            | TransferInfo::NO_WIDE_BURSTS
            | TransferInfo::TDMODE;
        let cb = ControlBlock::new()
            .with_transfer_info(info)
            .with_source(BusAddress::from_raw(0xC000_1000))
            .with_destination(BusAddress::from_raw(0x7E20_001C))
            .with_length(TransferLength::two_d(2, 4).unwrap())
            .with_stride(Stride::new(8, 0))
            .with_next(BusAddress::from_raw(0xC000_2000));

        assert_eq!(info.bits(), 0x0400_0112);
        assert_eq!(cb.transfer_info(), info);
        assert_eq!(cb.source().raw(), 0xC000_1000);
        assert_eq!(cb.destination().raw(), 0x7E20_001C);
        assert_eq!(cb.length().rows(), 2);
        assert_eq!(cb.stride(), Stride::new(8, 0));
        assert_eq!(cb.next(), Some(BusAddress::from_raw(0xC000_2000)));
        assert_eq!(ControlBlock::new().next(), None);
    }
}
