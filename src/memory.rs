//! Uncached, physically contiguous memory for the DMA engine
//!
//! The DMA engine knows nothing about the CPU caches or about our virtual address space. Data
//! and control blocks it reads therefore have to live in memory that
//! - is physically contiguous and locked (never swapped or moved),
//! - is reached by the CPU through the uncached alias, so writes land in RAM immediately, and
//! - is referred to by its *bus address* whenever the engine is told about it.
//!
//! The VideoCore firmware hands out exactly such memory. [`UncachedAllocator`] wraps the service
//! that talks to it ([`Mailbox`] on real hardware) and produces [`UncachedBlock`]s, each of which
//! knows its bus address and can translate pointers into it with [`UncachedBlock::to_bus`].
//!
//! ```no_run
//! use rpi_dma_gpio::memory::{Mailbox, UncachedAllocator};
//!
//! let allocator = UncachedAllocator::new(Mailbox::open()?);
//! let mut block = allocator.allocate(100)?; // rounded up to a page, zeroed
//! let words = block.as_mut_slice::<u32>()?;
//! words[0] = 1 << 14;
//! let first = words.as_ptr();
//! let bus = block.to_bus(first)?;
//! # Ok::<(), rpi_dma_gpio::memory::Error>(())
//! ```

use core::fmt;
use core::mem;
use core::ptr::{self, NonNull};
use std::io;

use log::{debug, warn};
use thiserror::Error;

use crate::platform::{bus_to_phys, MEM_FLAG, PAGE_SIZE};

mod mailbox;

pub use mailbox::Mailbox;

/// Errors from the allocation service or from using uncached blocks
#[derive(Debug, Error)]
pub enum Error {
    /// The device backing the service could not be opened
    #[error("can't open {device}: {source}")]
    ServiceUnavailable {
        device: &'static str,
        source: io::Error,
    },
    /// The mailbox ioctl itself failed
    #[error("mailbox property call failed: {0}")]
    Ioctl(#[source] io::Error),
    /// The firmware rejected a property request
    #[error("mailbox request {tag:#07x} failed with response {code:#010x}")]
    Mailbox { tag: u32, code: u32 },
    /// No contiguous block of the requested size could be reserved
    #[error("couldn't allocate a contiguous block of {size} bytes")]
    NoContiguousMemory { size: usize },
    /// Mapping the block into our address space failed
    #[error("mmap of {size} bytes at physical {address:#010x} failed: {source}")]
    Mapping {
        address: u32,
        size: usize,
        source: io::Error,
    },
    /// Unmapping a block from our address space failed
    #[error("munmap of {size} bytes at {address:#x} failed: {source}")]
    Unmapping {
        address: usize,
        size: usize,
        source: io::Error,
    },
    /// A pointer handed to [`UncachedBlock::to_bus`] is not inside the block
    #[error("pointer offset {offset:#x} not within block of {size} bytes")]
    PointerOutOfBlock { offset: isize, size: usize },
    /// The block is too small or misaligned for the requested view
    #[error("block of {size} bytes can't hold {count} x {type_name}")]
    Layout {
        type_name: &'static str,
        count: usize,
        size: usize,
    },
    /// The block has already been released
    #[error("block has already been released")]
    Released,
}

/// Opaque handle of an allocation made by the service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemHandle(u32);

impl MemHandle {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// An address as seen from the VideoCore bus, which is what the DMA engine uses
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusAddress(u32);

impl BusAddress {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The ARM physical address of the same memory
    pub const fn to_physical(self) -> u32 {
        bus_to_phys(self.0)
    }

    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// The privileged allocator handing out locked, physically contiguous memory.
///
/// `allocate` reserves, `lock` pins and reports the bus address, `map` makes it reachable from
/// this process. Release goes the other way: `unmap`, `unlock`, `release`.
pub trait MemoryService {
    fn allocate(&self, size: u32, align: u32, flags: u32)
        -> Result<MemHandle, Error>;

    fn lock(&self, handle: MemHandle) -> Result<BusAddress, Error>;

    fn unlock(&self, handle: MemHandle) -> Result<(), Error>;

    fn release(&self, handle: MemHandle) -> Result<(), Error>;

    /// Map `size` bytes starting at the bus address `bus` into this process.
    fn map(&self, bus: BusAddress, size: usize) -> Result<NonNull<u8>, Error>;

    /// Undo a [`map`](MemoryService::map).
    ///
    /// # Safety
    ///
    /// `mem` and `size` must come from a previous successful call to `map`, and nothing may
    /// access the mapping afterwards.
    unsafe fn unmap(&self, mem: NonNull<u8>, size: usize) -> Result<(), Error>;
}

/// Plain data that can be placed in uncached memory and read by the DMA engine.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or a primitive), contain no pointers or padding with
/// meaning, and be valid for the all-zeroes bit pattern a fresh block contains.
pub unsafe trait DmaData: Copy + 'static {}

// SAFETY: primitive, every bit pattern valid
unsafe impl DmaData for u32 {}

/// Round `size` up to the next full page.
pub const fn round_to_page(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Hands out [`UncachedBlock`]s from a [`MemoryService`].
///
/// The allocator owns its service handle: it is opened once by whoever constructs the
/// allocator, shared by every block allocated from it, and closed when the allocator is dropped.
/// Blocks borrow the allocator, so they cannot outlive the handle.
pub struct UncachedAllocator<S: MemoryService> {
    service: S,
    flags: u32,
}

impl<S: MemoryService> UncachedAllocator<S> {
    /// Allocate with the board's uncached flags ([`MEM_FLAG`])
    pub fn new(service: S) -> Self {
        Self::with_flags(service, MEM_FLAG)
    }

    pub fn with_flags(service: S, flags: u32) -> Self {
        Self { service, flags }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Allocate a block of at least `size` bytes. The size is rounded up to the next full page,
    /// the memory is page aligned and zeroed.
    ///
    /// `allocate(0)` returns one page rather than an empty block, since the firmware and `mmap`
    /// both reject zero-length requests.
    pub fn allocate(&self, size: usize) -> Result<UncachedBlock<'_, S>, Error> {
        let size = round_to_page(size.max(1));
        let request =
            u32::try_from(size).map_err(|_| Error::NoContiguousMemory { size })?;

        let handle =
            self.service.allocate(request, PAGE_SIZE as u32, self.flags)?;

        let bus_address = match self.service.lock(handle) {
            Ok(bus) if bus.raw() != 0 => bus,
            Ok(_) => {
                self.discard(handle, false);
                return Err(Error::NoContiguousMemory { size });
            }
            Err(error) => {
                self.discard(handle, false);
                return Err(error);
            }
        };

        let mem = match self.service.map(bus_address, size) {
            Ok(mem) => mem,
            Err(error) => {
                self.discard(handle, true);
                return Err(error);
            }
        };

        // SAFETY: `mem` was just mapped with `size` bytes and nothing else refers to it
        unsafe { ptr::write_bytes(mem.as_ptr(), 0x00, size) };

        debug!(
            "Alloc: {size:6} bytes; {:p} (bus={bus_address}, phys={:#010x})",
            mem,
            bus_address.to_physical()
        );

        Ok(UncachedBlock {
            allocator: self,
            mem: Some(mem),
            bus_address,
            handle,
            size,
        })
    }

    // Undo a half finished allocation. The caller sees the first error.
    fn discard(&self, handle: MemHandle, locked: bool) {
        if locked {
            if let Err(error) = self.service.unlock(handle) {
                warn!("unlock of {handle:?} failed: {error}");
            }
        }
        if let Err(error) = self.service.release(handle) {
            warn!("release of {handle:?} failed: {error}");
        }
    }
}

/// A page-aligned block of locked memory that bypasses the CPU caches.
///
/// The block is released when dropped; [`free`](UncachedBlock::free) releases it early and
/// reports errors. While the DMA engine may still be reading the block it must stay borrowed by
/// the transfer (see [`crate::dma::LoopingTransfer`]).
pub struct UncachedBlock<'a, S: MemoryService> {
    allocator: &'a UncachedAllocator<S>,
    mem: Option<NonNull<u8>>,
    bus_address: BusAddress,
    handle: MemHandle,
    size: usize,
}

impl<'a, S: MemoryService> UncachedBlock<'a, S> {
    /// Capacity in bytes, a multiple of the page size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bus address of the first byte
    pub fn bus_address(&self) -> BusAddress {
        self.bus_address
    }

    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    pub fn is_allocated(&self) -> bool {
        self.mem.is_some()
    }

    /// Process-visible address of the first byte, or null once released
    pub fn as_ptr(&self) -> *const u8 {
        self.mem.map_or(ptr::null(), |mem| mem.as_ptr().cast_const())
    }

    fn view<T: DmaData>(&self) -> Result<(NonNull<u8>, usize), Error> {
        let mem = self.mem.ok_or(Error::Released)?;
        let count = self.size / mem::size_of::<T>();
        if count == 0 || mem.as_ptr().align_offset(mem::align_of::<T>()) != 0 {
            return Err(Error::Layout {
                type_name: crate::stripped_type_name::<T>(),
                count: 1,
                size: self.size,
            });
        }
        Ok((mem, count))
    }

    /// The whole block viewed as `T`s
    pub fn as_slice<T: DmaData>(&self) -> Result<&[T], Error> {
        let (mem, count) = self.view::<T>()?;
        // SAFETY: in bounds and aligned (checked by `view`), `T` is valid for any bit pattern
        Ok(unsafe { core::slice::from_raw_parts(mem.as_ptr().cast::<T>(), count) })
    }

    /// The whole block viewed as mutable `T`s
    pub fn as_mut_slice<T: DmaData>(&mut self) -> Result<&mut [T], Error> {
        let (mem, count) = self.view::<T>()?;
        // SAFETY: as above, and `&mut self` makes this the only view
        Ok(unsafe {
            core::slice::from_raw_parts_mut(mem.as_ptr().cast::<T>(), count)
        })
    }

    /// The first `count` `T`s of the block, failing if the block is too small.
    pub fn prefix_mut<T: DmaData>(
        &mut self,
        count: usize,
    ) -> Result<&mut [T], Error> {
        let size = self.size;
        let all = self.as_mut_slice::<T>()?;
        if count > all.len() {
            return Err(Error::Layout {
                type_name: crate::stripped_type_name::<T>(),
                count,
                size,
            });
        }
        Ok(&mut all[..count])
    }

    /// Translate a pointer into this block to the bus address the DMA engine needs.
    pub fn to_bus<T>(&self, p: *const T) -> Result<BusAddress, Error> {
        let mem = self.mem.ok_or(Error::Released)?;
        let offset = (p as isize).wrapping_sub(mem.as_ptr() as isize);
        if offset < 0 || offset as usize >= self.size {
            return Err(Error::PointerOutOfBlock {
                offset,
                size: self.size,
            });
        }
        Ok(self.bus_address.offset(offset as u32))
    }

    /// Release the block: unmap, unlock and hand it back to the service. Does nothing if the
    /// block was already released.
    pub fn free(&mut self) -> Result<(), Error> {
        let Some(mem) = self.mem.take() else {
            return Ok(());
        };
        let service = &self.allocator.service;

        // SAFETY: `mem` came from `map` with `self.size`, and `take` above means no view of the
        // block can be created any more
        let unmapped = unsafe { service.unmap(mem, self.size) };
        let unlocked = service.unlock(self.handle);
        let released = service.release(self.handle);
        debug!("Free: {} bytes (bus={})", self.size, self.bus_address);

        unmapped.and(unlocked).and(released)
    }
}

impl<S: MemoryService> fmt::Debug for UncachedBlock<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UncachedBlock")
            .field("mem", &self.as_ptr())
            .field("bus_address", &self.bus_address)
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish()
    }
}

impl<S: MemoryService> Drop for UncachedBlock<'_, S> {
    fn drop(&mut self) {
        if let Err(error) = self.free() {
            warn!("releasing uncached block failed: {error}");
        }
    }
}
