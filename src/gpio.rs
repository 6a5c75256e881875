//! General Purpose Input / Output
//!
//! The BCM283x has 54 GPIO lines. Each line's function is selected by a 3-bit field in one of
//! the function select registers GPFSEL0..GPFSEL5 (ten lines per register). Lines 0-31 are
//! driven through the write-only GPSET0 and GPCLR0 registers: writing a one bit to GPSET0 drives
//! the line high, writing a one bit to GPCLR0 drives it low, and zero bits have no effect. The
//! current level can be read back from GPLEV0.
//!
//! ```no_run
//! use rpi_dma_gpio::gpio::Gpio;
//! use rpi_dma_gpio::peripheral::{DevMem, RegisterMapper};
//! use rpi_dma_gpio::platform::GPIO_REGISTER_BASE;
//!
//! let gpio = Gpio::new(DevMem.map_register_window(GPIO_REGISTER_BASE)?);
//! let mut pin = gpio.into_output::<14>();
//! pin.set_high();
//! pin.set_low();
//! # Ok::<(), rpi_dma_gpio::peripheral::Error>(())
//! ```
//!
//! ## Modes
//!
//! Pins obtained through [`Gpio::into_output`] carry their mode in the type, so only outputs can
//! be driven. Output pins implement the [`embedded_hal::digital`] output traits.

use core::{convert::Infallible, fmt, marker::PhantomData};

use embedded_hal::digital::{ErrorType, OutputPin, StatefulOutputPin};

use crate::peripheral::RegisterAccess;
use crate::platform::{GPIO_CLR_OFFSET, GPIO_LEV_OFFSET, GPIO_SET_OFFSET};

/// Number of GPIO lines on the BCM283x
pub const LINES: u8 = 54;

const FSEL_BITS: u32 = 3;
const FSEL_MASK: u32 = 0b111;
const LINES_PER_FSEL: u8 = 10;

const SET_WORD: usize = GPIO_SET_OFFSET / 4;
const CLR_WORD: usize = GPIO_CLR_OFFSET / 4;
const LEV_WORD: usize = GPIO_LEV_OFFSET / 4;

/// Function select values, see BCM2835 ARM Peripherals 6.1
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Function {
    Input = 0b000,
    Output = 0b001,
    Alt0 = 0b100,
    Alt1 = 0b101,
    Alt2 = 0b110,
    Alt3 = 0b111,
    Alt4 = 0b011,
    Alt5 = 0b010,
}

impl Function {
    fn from_bits(bits: u32) -> Self {
        match bits & FSEL_MASK {
            0b000 => Function::Input,
            0b001 => Function::Output,
            0b100 => Function::Alt0,
            0b101 => Function::Alt1,
            0b110 => Function::Alt2,
            0b111 => Function::Alt3,
            0b011 => Function::Alt4,
            _ => Function::Alt5,
        }
    }
}

/// Output mode (type state)
pub struct Output;

/// The GPIO register block
pub struct Gpio<W> {
    regs: W,
}

impl<W: RegisterAccess> Gpio<W> {
    pub fn new(regs: W) -> Self {
        Gpio { regs }
    }

    pub fn registers(&self) -> &W {
        &self.regs
    }

    fn fsel_position(line: u8) -> (usize, u32) {
        assert!(line < LINES, "GPIO{line} does not exist");
        (
            (line / LINES_PER_FSEL) as usize,
            (line % LINES_PER_FSEL) as u32 * FSEL_BITS,
        )
    }

    /// Select the function of `line`. The field is cleared (input) before the new function is
    /// set, so the line passes through input and never through another alternate function.
    pub fn set_function(&self, line: u8, function: Function) {
        let (word, shift) = Self::fsel_position(line);
        self.regs.modify(word, |r| r & !(FSEL_MASK << shift));
        self.regs.modify(word, |r| r | ((function as u32) << shift));
    }

    /// The currently selected function of `line`
    pub fn function(&self, line: u8) -> Function {
        let (word, shift) = Self::fsel_position(line);
        Function::from_bits(self.regs.read(word) >> shift)
    }

    /// Configure line `N` as an output
    pub fn into_output<const N: u8>(&self) -> Pin<'_, W, N, Output> {
        assert!(N < 32, "only GPIO0-31 are driven through GPSET0/GPCLR0");
        self.set_function(N, Function::Output);
        Pin::new(self)
    }

    /// Drive every line whose bit is set in `mask` high
    #[inline(always)]
    pub fn set_mask(&self, mask: u32) {
        self.regs.write(SET_WORD, mask);
    }

    /// Drive every line whose bit is set in `mask` low
    #[inline(always)]
    pub fn clear_mask(&self, mask: u32) {
        self.regs.write(CLR_WORD, mask);
    }

    /// Levels of GPIO0-31
    #[inline(always)]
    pub fn levels(&self) -> u32 {
        self.regs.read(LEV_WORD)
    }
}

/// GPIO line `N` in `MODE`
pub struct Pin<'a, W, const N: u8, MODE> {
    gpio: &'a Gpio<W>,
    _mode: PhantomData<MODE>,
}

impl<'a, W, const N: u8, MODE> Pin<'a, W, N, MODE> {
    const fn new(gpio: &'a Gpio<W>) -> Self {
        Self {
            gpio,
            _mode: PhantomData,
        }
    }

    /// Bit of this line in GPSET0, GPCLR0 and GPLEV0
    #[inline(always)]
    pub const fn mask(&self) -> u32 {
        1 << N
    }
}

impl<W, const N: u8, MODE> fmt::Debug for Pin<'_, W, N, MODE> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_fmt(format_args!(
            "GPIO{}<{}>",
            N,
            crate::stripped_type_name::<MODE>()
        ))
    }
}

impl<W: RegisterAccess, const N: u8, MODE> Pin<'_, W, N, MODE> {
    #[inline(always)]
    fn _is_low(&self) -> bool {
        self.gpio.levels() & self.mask() == 0
    }
}

impl<W: RegisterAccess, const N: u8> Pin<'_, W, N, Output> {
    /// Drives the pin high
    #[inline(always)]
    pub fn set_high(&mut self) {
        self.gpio.set_mask(self.mask())
    }

    /// Drives the pin low
    #[inline(always)]
    pub fn set_low(&mut self) {
        self.gpio.clear_mask(self.mask())
    }

    /// Is the pin in drive high mode?
    #[inline(always)]
    pub fn is_set_high(&self) -> bool {
        !self._is_low()
    }

    /// Is the pin in drive low mode?
    #[inline(always)]
    pub fn is_set_low(&self) -> bool {
        self._is_low()
    }
}

impl<W, const N: u8> ErrorType for Pin<'_, W, N, Output> {
    type Error = Infallible;
}

impl<W: RegisterAccess, const N: u8> OutputPin for Pin<'_, W, N, Output> {
    #[inline(always)]
    fn set_high(&mut self) -> Result<(), Self::Error> {
        Pin::set_high(self);
        Ok(())
    }

    #[inline(always)]
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Pin::set_low(self);
        Ok(())
    }
}

impl<W: RegisterAccess, const N: u8> StatefulOutputPin
    for Pin<'_, W, N, Output>
{
    #[inline(always)]
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        Ok(Pin::is_set_high(self))
    }

    #[inline(always)]
    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        Ok(Pin::is_set_low(self))
    }
}
