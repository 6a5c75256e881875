//! In-memory stand-ins for the peripheral space and the VideoCore allocator
//!
//! Used by the unit tests and, with the `sim` feature, by anyone who wants to run the demo
//! pipeline off the board. Register windows are plain words that persist across mappings, the
//! allocator hands out page-aligned heap memory under fake bus addresses and keeps a ledger of
//! what was requested and released, and [`SimMemory::run_control_block`] executes one pass of a
//! control block the way the DMA engine would.

use core::cell::{Cell, RefCell};
use core::ptr::{self, NonNull};
use std::alloc;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;

use crate::demo::Platform;
use crate::dma::{ControlBlock, TransferInfo};
use crate::memory::{self, BusAddress, MemHandle, MemoryService};
use crate::peripheral::{self, RegisterAccess, RegisterMapper, WINDOW_WORDS};
use crate::platform::{PAGE_SIZE, PERI_BUS_BASE};

/// A simulated peripheral space. Clones share the same registers.
#[derive(Clone, Debug, Default)]
pub struct SimPeripherals {
    windows: Rc<RefCell<HashMap<u32, SimWindow>>>,
}

impl SimPeripherals {
    pub fn new() -> Self {
        Self::default()
    }

    /// The page of registers at `offset`, created zeroed on first use
    pub fn window(&self, offset: u32) -> SimWindow {
        self.windows
            .borrow_mut()
            .entry(offset)
            .or_insert_with(SimWindow::new)
            .clone()
    }
}

impl RegisterMapper for SimPeripherals {
    type Window = SimWindow;

    fn map_register_window(
        &self,
        offset: u32,
    ) -> Result<SimWindow, peripheral::Error> {
        Ok(self.window(offset))
    }
}

/// One page of simulated registers
#[derive(Clone, Debug)]
pub struct SimWindow {
    regs: Rc<[Cell<u32>]>,
}

impl SimWindow {
    fn new() -> Self {
        Self {
            regs: (0..WINDOW_WORDS).map(|_| Cell::new(0)).collect(),
        }
    }
}

impl RegisterAccess for SimWindow {
    fn len_words(&self) -> usize {
        self.regs.len()
    }

    fn read(&self, word: usize) -> u32 {
        assert!(word < self.regs.len(), "register {word} outside window");
        self.regs[word].get()
    }

    fn write(&self, word: usize, value: u32) {
        assert!(word < self.regs.len(), "register {word} outside window");
        self.regs[word].set(value)
    }
}

/// A write performed by a simulated DMA transfer. `offset` is relative to the peripheral base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterWrite {
    pub offset: u32,
    pub value: u32,
}

// First bus address handed out, in the uncached alias like the firmware's
const FIRST_BUS_ADDRESS: u32 = 0xC010_0000;

struct Storage {
    mem: NonNull<u8>,
    layout: alloc::Layout,
}

impl Storage {
    fn new(size: usize) -> Option<Self> {
        let layout =
            alloc::Layout::from_size_align(size.max(1), PAGE_SIZE).ok()?;
        // SAFETY: the layout has a non-zero size
        let mem = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { mem, layout })
    }

    fn contains(&self, p: *const u8) -> bool {
        let start = self.mem.as_ptr() as usize;
        (start..start + self.layout.size()).contains(&(p as usize))
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout
        unsafe { alloc::dealloc(self.mem.as_ptr(), self.layout) }
    }
}

struct Allocation {
    bus: BusAddress,
    size: usize,
    storage: Storage,
}

impl Allocation {
    fn translate(&self, bus: u32, len: usize) -> Option<NonNull<u8>> {
        let offset = bus.checked_sub(self.bus.raw())? as usize;
        (offset + len <= self.size)
            // SAFETY: inside the storage, which is never null
            .then(|| unsafe {
                NonNull::new_unchecked(self.storage.mem.as_ptr().add(offset))
            })
    }
}

#[derive(Default)]
struct Ledger {
    next_handle: u32,
    next_bus: u32,
    allocations: HashMap<MemHandle, Allocation>,
    requests: HashMap<MemHandle, (u32, u32, u32)>,
    released: Vec<MemHandle>,
    fill_on_map: Option<u8>,
    exhausted: bool,
}

impl Ledger {
    fn find(&self, bus: u32, len: usize) -> Option<NonNull<u8>> {
        self.allocations
            .values()
            .find_map(|allocation| allocation.translate(bus, len))
    }
}

/// A simulated VideoCore allocator. Clones share the same ledger.
#[derive(Clone, Default)]
pub struct SimMemory {
    ledger: Rc<RefCell<Ledger>>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill every block with `byte` when it is mapped, to check it gets zeroed afterwards
    pub fn fill_on_map(&self, byte: u8) {
        self.ledger.borrow_mut().fill_on_map = Some(byte);
    }

    /// Make every following lock report bus address 0, like the firmware does when it has no
    /// contiguous memory left
    pub fn exhaust(&self) {
        self.ledger.borrow_mut().exhausted = true;
    }

    /// `(size, align, flags)` requested for `handle`
    pub fn request(&self, handle: MemHandle) -> Option<(u32, u32, u32)> {
        self.ledger.borrow().requests.get(&handle).copied()
    }

    /// Handles released so far, in order
    pub fn released(&self) -> Vec<MemHandle> {
        self.ledger.borrow().released.clone()
    }

    /// Allocations not yet released
    pub fn live_allocations(&self) -> usize {
        self.ledger.borrow().allocations.len()
    }

    /// Read the word at bus address `bus`, if it lies in a live allocation
    pub fn read_word(&self, bus: BusAddress) -> Option<u32> {
        let p = self.ledger.borrow().find(bus.raw(), 4)?;
        // SAFETY: inside a live allocation
        Some(unsafe { ptr::read_unaligned(p.as_ptr().cast::<u32>()) })
    }

    /// Execute the 2D control block at `head` once, as the DMA engine would. Returns the writes it
    /// made, with destinations relative to the peripheral bus base, and the next block.
    ///
    /// Panics if the block, or any source word, is not in simulated memory.
    pub fn run_control_block(
        &self,
        head: BusAddress,
    ) -> (Vec<RegisterWrite>, Option<BusAddress>) {
        let p = self
            .ledger
            .borrow()
            .find(head.raw(), core::mem::size_of::<ControlBlock>())
            .unwrap_or_else(|| panic!("no control block at {head}"));
        // SAFETY: inside a live allocation
        let cb = unsafe { ptr::read_unaligned(p.as_ptr().cast::<ControlBlock>()) };

        let info = cb.transfer_info();
        assert!(
            info.contains(TransferInfo::TDMODE),
            "only 2D control blocks are simulated"
        );
        let length = cb.length();
        let stride = cb.stride();

        let mut src = cb.source().raw();
        let mut dst = cb.destination().raw();
        let mut writes = Vec::new();
        for _ in 0..length.rows() {
            for _ in 0..length.row_bytes() / 4 {
                let value = self
                    .read_word(BusAddress::from_raw(src))
                    .unwrap_or_else(|| panic!("source {src:#010x} not in simulated memory"));
                writes.push(RegisterWrite {
                    offset: dst.wrapping_sub(PERI_BUS_BASE),
                    value,
                });
                if info.contains(TransferInfo::SRC_INC) {
                    src += 4;
                }
                if info.contains(TransferInfo::DEST_INC) {
                    dst += 4;
                }
            }
            src = src.wrapping_add_signed(stride.source as i32);
            dst = dst.wrapping_add_signed(stride.destination as i32);
        }

        (writes, cb.next())
    }

    fn unknown(tag: u32) -> memory::Error {
        memory::Error::Mailbox {
            tag,
            code: 0x8000_0001,
        }
    }
}

impl MemoryService for SimMemory {
    fn allocate(
        &self,
        size: u32,
        align: u32,
        flags: u32,
    ) -> Result<MemHandle, memory::Error> {
        let mut ledger = self.ledger.borrow_mut();
        ledger.next_handle += 1;
        let handle = MemHandle::from_raw(ledger.next_handle);

        if ledger.next_bus == 0 {
            ledger.next_bus = FIRST_BUS_ADDRESS;
        }
        let bus = BusAddress::from_raw(ledger.next_bus);
        // Leave a page between allocations
        ledger.next_bus += memory::round_to_page(size as usize) as u32 + PAGE_SIZE as u32;

        let storage = Storage::new(size as usize).ok_or(
            memory::Error::NoContiguousMemory {
                size: size as usize,
            },
        )?;
        ledger.requests.insert(handle, (size, align, flags));
        ledger.allocations.insert(
            handle,
            Allocation {
                bus,
                size: size as usize,
                storage,
            },
        );
        Ok(handle)
    }

    fn lock(&self, handle: MemHandle) -> Result<BusAddress, memory::Error> {
        let ledger = self.ledger.borrow();
        let allocation = ledger.allocations.get(&handle).ok_or_else(|| Self::unknown(0x3000D))?;
        if ledger.exhausted {
            return Ok(BusAddress::from_raw(0));
        }
        Ok(allocation.bus)
    }

    fn unlock(&self, handle: MemHandle) -> Result<(), memory::Error> {
        if self.ledger.borrow().allocations.contains_key(&handle) {
            Ok(())
        } else {
            Err(Self::unknown(0x3000E))
        }
    }

    fn release(&self, handle: MemHandle) -> Result<(), memory::Error> {
        let mut ledger = self.ledger.borrow_mut();
        ledger
            .allocations
            .remove(&handle)
            .ok_or_else(|| Self::unknown(0x3000F))?;
        ledger.released.push(handle);
        Ok(())
    }

    fn map(
        &self,
        bus: BusAddress,
        size: usize,
    ) -> Result<NonNull<u8>, memory::Error> {
        let ledger = self.ledger.borrow();
        let p = ledger.find(bus.raw(), size).ok_or_else(|| memory::Error::Mapping {
            address: bus.to_physical(),
            size,
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;
        if let Some(byte) = ledger.fill_on_map {
            // SAFETY: `find` checked `size` bytes from `p` are inside the allocation
            unsafe { ptr::write_bytes(p.as_ptr(), byte, size) };
        }
        Ok(p)
    }

    unsafe fn unmap(
        &self,
        mem: NonNull<u8>,
        size: usize,
    ) -> Result<(), memory::Error> {
        let mapped = self
            .ledger
            .borrow()
            .allocations
            .values()
            .any(|allocation| allocation.storage.contains(mem.as_ptr()));
        if !mapped {
            return Err(memory::Error::Unmapping {
                address: mem.as_ptr() as usize,
                size,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            });
        }
        Ok(())
    }
}

/// A delay that returns at once and adds up what it was asked to wait
#[derive(Clone, Debug, Default)]
pub struct SimDelay {
    waited_ns: Rc<Cell<u64>>,
}

impl SimDelay {
    pub fn waited_ns(&self) -> u64 {
        self.waited_ns.get()
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.waited_ns.set(self.waited_ns.get() + ns as u64);
    }
}

/// Simulated peripherals, allocator and clock for [`crate::demo::run`]
#[derive(Clone, Default)]
pub struct SimPlatform {
    pub peripherals: SimPeripherals,
    pub memory: SimMemory,
    pub delay: SimDelay,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Platform for SimPlatform {
    type Mapper = SimPeripherals;
    type Memory = SimMemory;
    type Delay = SimDelay;

    fn mapper(&self) -> &SimPeripherals {
        &self.peripherals
    }

    fn open_memory(&self) -> Result<SimMemory, memory::Error> {
        Ok(self.memory.clone())
    }

    fn delay(&self) -> SimDelay {
        self.delay.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_persist_across_mappings() {
        let peripherals = SimPeripherals::new();
        peripherals.map_register_window(0x7000).unwrap().write(5, 42);
        assert_eq!(peripherals.clone().window(0x7000).read(5), 42);
        assert_eq!(peripherals.window(0x20_0000).read(5), 0);
    }

    #[test]
    fn unmapping_unknown_memory_reports_full_address() {
        let sim = SimMemory::new();
        let mut word = 0u64;
        let p = NonNull::from(&mut word).cast::<u8>();

        // SAFETY: the pointer is not in any allocation, so nothing is unmapped
        let result = unsafe { sim.unmap(p, 8) };
        match result {
            Err(memory::Error::Unmapping { address, size, .. }) => {
                assert_eq!(address, p.as_ptr() as usize);
                assert_eq!(size, 8);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ledger_tracks_handles() {
        let memory = SimMemory::new();
        let a = memory.allocate(4096, 4096, 0xC).unwrap();
        let b = memory.allocate(8192, 4096, 0xC).unwrap();
        assert_ne!(a, b);
        let bus_a = memory.lock(a).unwrap();
        let bus_b = memory.lock(b).unwrap();
        assert!(bus_b.raw() >= bus_a.raw() + 4096);
        assert_eq!(memory.live_allocations(), 2);

        memory.release(a).unwrap();
        assert!(memory.release(a).is_err());
        assert!(memory.lock(a).is_err());
        assert_eq!(memory.released(), vec![a]);
        assert_eq!(memory.live_allocations(), 1);
    }

    #[test]
    fn mapped_memory_is_readable_by_bus_address() {
        let memory = SimMemory::new();
        let handle = memory.allocate(4096, 4096, 0xC).unwrap();
        let bus = memory.lock(handle).unwrap();
        let mem = memory.map(bus, 4096).unwrap();
        // SAFETY: mapped above
        unsafe { mem.as_ptr().cast::<u32>().add(3).write(0x1234) };
        assert_eq!(memory.read_word(bus.offset(12)), Some(0x1234));
        assert_eq!(memory.read_word(bus.offset(4096)), None);
    }

    #[test]
    fn delay_accumulates() {
        let delay = SimDelay::default();
        let mut clone = delay.clone();
        clone.delay_us(100);
        clone.delay_ns(5);
        assert_eq!(delay.waited_ns(), 100_005);
    }
}
