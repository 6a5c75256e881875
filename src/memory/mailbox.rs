//! VideoCore property mailbox, reached through `/dev/vcio`
//!
//! See <https://github.com/raspberrypi/firmware/wiki/Mailbox-property-interface> for the message
//! layout and tags.

use core::mem;
use core::ptr::{self, NonNull};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use super::{BusAddress, Error, MemHandle, MemoryService};
use crate::platform::PAGE_SIZE;

const DEVICE: &str = "/dev/vcio";
const DEV_MEM: &str = "/dev/mem";

const TAG_ALLOCATE_MEMORY: u32 = 0x3000C;
const TAG_LOCK_MEMORY: u32 = 0x3000D;
const TAG_UNLOCK_MEMORY: u32 = 0x3000E;
const TAG_RELEASE_MEMORY: u32 = 0x3000F;

const PROCESS_REQUEST: u32 = 0x0000_0000;
const RESPONSE_SUCCESS: u32 = 0x8000_0000;
const END_TAG: u32 = 0;

// Header (size, code, tag, value size, request size) + up to 3 arguments + end tag
const MESSAGE_WORDS: usize = 9;
// Index of the first value word, which holds the result in the response
const VALUE: usize = 5;

/// Linux `_IOWR(type, nr, size)`
const fn iowr(ty: u32, nr: u32, size: usize) -> u32 {
    const IOC_READ_WRITE: u32 = 3;
    (IOC_READ_WRITE << 30) | ((size as u32) << 16) | (ty << 8) | nr
}

/// `IOCTL_MBOX_PROPERTY` of the vcio driver: `_IOWR(100, 0, char *)`
const IOCTL_MBOX_PROPERTY: u32 =
    iowr(100, 0, mem::size_of::<*mut libc::c_char>());

#[repr(C, align(16))]
struct Message([u32; MESSAGE_WORDS]);

impl Message {
    fn request(tag: u32, args: &[u32]) -> Self {
        assert!(args.len() <= MESSAGE_WORDS - VALUE - 1);
        let mut words = [0u32; MESSAGE_WORDS];
        let value_size = (args.len() * mem::size_of::<u32>()) as u32;

        words[1] = PROCESS_REQUEST;
        words[2] = tag;
        words[3] = value_size;
        words[4] = value_size;
        words[VALUE..VALUE + args.len()].copy_from_slice(args);
        let end = VALUE + args.len();
        words[end] = END_TAG;
        words[0] = ((end + 1) * mem::size_of::<u32>()) as u32;

        Message(words)
    }
}

/// The VideoCore firmware's memory allocator
#[derive(Debug)]
pub struct Mailbox {
    vcio: File,
}

impl Mailbox {
    /// Open the mailbox device
    pub fn open() -> Result<Self, Error> {
        let vcio = File::open(DEVICE).map_err(|source| {
            Error::ServiceUnavailable {
                device: DEVICE,
                source,
            }
        })?;
        Ok(Self { vcio })
    }

    fn property(&self, tag: u32, args: &[u32]) -> Result<u32, Error> {
        let mut message = Message::request(tag, args);

        // SAFETY: the driver reads and rewrites at most `message.0[0]` bytes of `message`
        let ret = unsafe {
            libc::ioctl(
                self.vcio.as_raw_fd(),
                IOCTL_MBOX_PROPERTY as _,
                message.0.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(Error::Ioctl(io::Error::last_os_error()));
        }

        let code = message.0[1];
        if code != RESPONSE_SUCCESS {
            return Err(Error::Mailbox { tag, code });
        }
        Ok(message.0[VALUE])
    }

    fn expect_status_ok(&self, tag: u32, handle: MemHandle) -> Result<(), Error> {
        match self.property(tag, &[handle.raw()])? {
            0 => Ok(()),
            code => Err(Error::Mailbox { tag, code }),
        }
    }
}

impl MemoryService for Mailbox {
    fn allocate(
        &self,
        size: u32,
        align: u32,
        flags: u32,
    ) -> Result<MemHandle, Error> {
        match self.property(TAG_ALLOCATE_MEMORY, &[size, align, flags])? {
            0 => Err(Error::NoContiguousMemory {
                size: size as usize,
            }),
            handle => Ok(MemHandle::from_raw(handle)),
        }
    }

    fn lock(&self, handle: MemHandle) -> Result<BusAddress, Error> {
        self.property(TAG_LOCK_MEMORY, &[handle.raw()])
            .map(BusAddress::from_raw)
    }

    fn unlock(&self, handle: MemHandle) -> Result<(), Error> {
        self.expect_status_ok(TAG_UNLOCK_MEMORY, handle)
    }

    fn release(&self, handle: MemHandle) -> Result<(), Error> {
        self.expect_status_ok(TAG_RELEASE_MEMORY, handle)
    }

    fn map(&self, bus: BusAddress, size: usize) -> Result<NonNull<u8>, Error> {
        let address = bus.to_physical();
        let offset = address as usize % PAGE_SIZE;
        let base = address as usize - offset;

        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(DEV_MEM)
            .map_err(|source| Error::ServiceUnavailable {
                device: DEV_MEM,
                source,
            })?;

        // SAFETY: fresh shared mapping of memory the firmware just locked for us
        let result = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size + offset,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                mem.as_raw_fd(),
                base as libc::off_t,
            )
        };
        if result == libc::MAP_FAILED {
            return Err(Error::Mapping {
                address,
                size,
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: `offset` is below a page, inside the mapping
        let mem = unsafe { result.cast::<u8>().add(offset) };
        NonNull::new(mem).ok_or_else(|| Error::Mapping {
            address,
            size,
            source: io::Error::from(io::ErrorKind::AddrNotAvailable),
        })
    }

    unsafe fn unmap(&self, mem: NonNull<u8>, size: usize) -> Result<(), Error> {
        let offset = mem.as_ptr() as usize % PAGE_SIZE;
        let start = mem.as_ptr().sub(offset);
        if libc::munmap(start.cast(), size + offset) != 0 {
            return Err(Error::Unmapping {
                address: start as usize,
                size,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_number_matches_vcio_driver() {
        #[cfg(target_pointer_width = "32")]
        assert_eq!(IOCTL_MBOX_PROPERTY, 0xC004_6400);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(IOCTL_MBOX_PROPERTY, 0xC008_6400);
    }

    #[test]
    fn allocate_message_layout() {
        let message = Message::request(TAG_ALLOCATE_MEMORY, &[4096, 4096, 0xC]);
        assert_eq!(
            message.0,
            [36, 0, 0x3000C, 12, 12, 4096, 4096, 0xC, END_TAG]
        );
    }

    #[test]
    fn lock_message_layout() {
        let message = Message::request(TAG_LOCK_MEMORY, &[7]);
        assert_eq!(&message.0[..7], &[28, 0, 0x3000D, 4, 4, 7, END_TAG]);
    }
}
