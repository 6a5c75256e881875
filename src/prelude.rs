//! Prelude

pub use crate::demo::Platform as _rpi_dma_gpio_demo_Platform;
pub use crate::memory::MemoryService as _rpi_dma_gpio_memory_MemoryService;
pub use crate::peripheral::RegisterAccess as _rpi_dma_gpio_peripheral_RegisterAccess;
pub use crate::peripheral::RegisterMapper as _rpi_dma_gpio_peripheral_RegisterMapper;

pub use embedded_hal::delay::DelayNs as _embedded_hal_delay_DelayNs;
pub use embedded_hal::digital::OutputPin as _embedded_hal_digital_OutputPin;
pub use embedded_hal::digital::StatefulOutputPin as _embedded_hal_digital_StatefulOutputPin;

pub use fugit::{ExtU32 as _, RateExtU32 as _};
