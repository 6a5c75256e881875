//! Toggling a single GPIO line on the BCM283x (Raspberry Pi) from user space.
//!
//! Two delivery mechanisms are provided side by side so they can be compared:
//! - the CPU writing the GPIO set/clear registers directly ([`cpu`]), and
//! - the DMA engine replaying a self-looping control block from uncached memory ([`dma`]).
//!
//! Everything here runs under Linux with access to `/dev/mem` and `/dev/vcio`, which means
//! root. The board is selected at compile time with the `pi1` or `pi2` feature.
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(not(any(feature = "pi1", feature = "pi2")))]
compile_error!(
    "This crate requires one of the following board features enabled:
        pi1
        pi2
"
);

#[cfg(all(feature = "pi1", feature = "pi2"))]
compile_error!("Cannot select both pi1 and pi2");

pub mod prelude;

pub mod platform;

pub mod time;

pub mod delay;

pub mod peripheral;

pub mod memory;

pub mod gpio;

pub mod dma;

pub mod cpu;

pub mod demo;

#[cfg(any(test, feature = "sim"))]
#[cfg_attr(docsrs, doc(cfg(feature = "sim")))]
pub mod sim;

/// Get the name of the type without the module prefix(es)
fn stripped_type_name<T>() -> &'static str {
    let s = core::any::type_name::<T>();
    s.rsplit("::").next().unwrap_or(s)
}
