//! Register windows onto the peripheral space
//!
//! A window is one page of device registers, addressed as an array of 32-bit words. Accesses are
//! volatile and bounds checked against the window, so no register outside the mapping can be
//! reached through it.
//!
//! ```no_run
//! use rpi_dma_gpio::peripheral::{DevMem, RegisterAccess, RegisterMapper};
//! use rpi_dma_gpio::platform::GPIO_REGISTER_BASE;
//!
//! let gpio = DevMem.map_register_window(GPIO_REGISTER_BASE)?;
//! let fsel1 = gpio.read(1);
//! # Ok::<(), rpi_dma_gpio::peripheral::Error>(())
//! ```

use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::ptr::{self, NonNull};

use log::debug;
use thiserror::Error;

use crate::platform::{PAGE_SIZE, PERI_BASE};

/// Number of 32-bit registers in a window
pub const WINDOW_WORDS: usize = PAGE_SIZE / core::mem::size_of::<u32>();

/// Errors mapping a register window
#[derive(Debug, Error)]
pub enum Error {
    /// `/dev/mem` could not be opened, usually because we are not root
    #[error("can't open /dev/mem: {0}. You need to run this as root!")]
    Privilege(#[source] io::Error),
    /// The mmap call itself failed
    #[error("mmap error for register window at offset {offset:#x}: {source}")]
    Mapping { offset: u32, source: io::Error },
}

/// Word-indexed access to a window of 32-bit device registers.
///
/// Every write is immediately visible to the device and may have side effects, even when the
/// intent is only to update one bit.
pub trait RegisterAccess {
    /// Number of 32-bit registers reachable through this window
    fn len_words(&self) -> usize;

    /// Read the register at `word`. Panics if `word` lies outside the window.
    fn read(&self, word: usize) -> u32;

    /// Write the register at `word`. Panics if `word` lies outside the window.
    fn write(&self, word: usize, value: u32);

    /// Read-modify-write of the register at `word`
    #[inline(always)]
    fn modify<F: FnOnce(u32) -> u32>(&self, word: usize, f: F) {
        let value = self.read(word);
        self.write(word, f(value));
    }
}

/// Something that can hand out register windows at an offset into the peripheral space.
pub trait RegisterMapper {
    type Window: RegisterAccess;

    /// Map the page of registers at `offset` from the peripheral base.
    fn map_register_window(&self, offset: u32) -> Result<Self::Window, Error>;
}

/// Register windows mapped from `/dev/mem`
#[derive(Clone, Copy, Debug, Default)]
pub struct DevMem;

impl RegisterMapper for DevMem {
    type Window = MappedWindow;

    fn map_register_window(&self, offset: u32) -> Result<MappedWindow, Error> {
        MappedWindow::map(offset)
    }
}

/// A page of device registers mapped into our address space. Unmapped on drop.
#[derive(Debug)]
pub struct MappedWindow {
    base: NonNull<u32>,
    offset: u32,
}

impl MappedWindow {
    fn map(offset: u32) -> Result<Self, Error> {
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open("/dev/mem")
            .map_err(Error::Privilege)?;

        // SAFETY: fresh shared mapping of a device range; nothing else in this process refers to
        // the returned address yet
        let result = unsafe {
            libc::mmap(
                ptr::null_mut(),
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                mem.as_raw_fd(),
                (PERI_BASE + offset) as libc::off_t,
            )
        };
        // The mapping outlives the file descriptor
        drop(mem);

        if result == libc::MAP_FAILED {
            return Err(Error::Mapping {
                offset,
                source: io::Error::last_os_error(),
            });
        }
        let base = NonNull::new(result.cast::<u32>()).ok_or_else(|| {
            Error::Mapping {
                offset,
                source: io::Error::from(io::ErrorKind::AddrNotAvailable),
            }
        })?;

        debug!(
            "Mapped registers at {:#010x} to {:p}",
            PERI_BASE + offset,
            base
        );
        Ok(Self { base, offset })
    }

    /// Offset of this window from the peripheral base
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

impl RegisterAccess for MappedWindow {
    fn len_words(&self) -> usize {
        WINDOW_WORDS
    }

    #[inline(always)]
    fn read(&self, word: usize) -> u32 {
        assert!(word < WINDOW_WORDS, "register {word} outside window");
        // SAFETY: in bounds of the page mapped in `map`
        unsafe { ptr::read_volatile(self.base.as_ptr().add(word)) }
    }

    #[inline(always)]
    fn write(&self, word: usize, value: u32) {
        assert!(word < WINDOW_WORDS, "register {word} outside window");
        // SAFETY: in bounds of the page mapped in `map`
        unsafe { ptr::write_volatile(self.base.as_ptr().add(word), value) }
    }
}

impl Drop for MappedWindow {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the page mapped in `map`; no references into it outlive self
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), PAGE_SIZE);
        }
    }
}
