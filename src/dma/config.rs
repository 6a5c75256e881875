use super::ch::ChannelStatus;

const MAX_PRIORITY: u8 = 15;
const PRIORITY_SHIFT: u32 = 16;
const PANIC_PRIORITY_SHIFT: u32 = 20;

/// Channel settings written to the control/status register when a chain is installed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DmaConfig {
    pub(super) priority: u8,
    pub(super) panic_priority: u8,
    pub(super) disable_debug_pause: bool,
}

impl DmaConfig {
    /// Create a config with the reset values of the channel (everything zero)
    pub fn new() -> Self {
        Self::default()
    }

    /// AXI priority of normal transactions (0 - 15 incl., 0 is lowest). Default 0.
    pub fn priority(mut self, priority: u8) -> Self {
        assert!(
            priority <= MAX_PRIORITY,
            "Must specify a priority between 0 and 15"
        );
        self.priority = priority;
        self
    }

    /// AXI priority used while the peripheral signals panic (0 - 15 incl.). Default 0.
    pub fn panic_priority(mut self, priority: u8) -> Self {
        assert!(
            priority <= MAX_PRIORITY,
            "Must specify a panic priority between 0 and 15"
        );
        self.panic_priority = priority;
        self
    }

    /// Keep running when the debug pause signal is asserted
    pub fn disable_debug_pause(mut self) -> Self {
        self.disable_debug_pause = true;
        self
    }

    /// The control/status value these settings translate to. ACTIVE is never part of it.
    pub fn status_bits(&self) -> ChannelStatus {
        let mut cs = ChannelStatus::from_bits_retain(
            ((self.priority as u32) << PRIORITY_SHIFT)
                | ((self.panic_priority as u32) << PANIC_PRIORITY_SHIFT),
        );
        cs.set(ChannelStatus::DISDEBUG, self.disable_debug_pause);
        cs
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_bits() {
        assert_eq!(DmaConfig::new().status_bits().bits(), 0);

        let config = DmaConfig::new()
            .priority(7)
            .panic_priority(7)
            .disable_debug_pause();
        let cs = config.status_bits();
        assert_eq!(cs.bits(), 0x2077_0000);
        assert!(!cs.contains(ChannelStatus::ACTIVE));
        assert_eq!(cs.priority(), 7);
        assert_eq!(cs.panic_priority(), 7);

        let config = DmaConfig::new().priority(15).panic_priority(1);
        assert_eq!(config.status_bits().bits(), 0x001F_0000);
    }

    #[test]
    #[should_panic(expected = "between 0 and 15")]
    fn priority_out_of_range() {
        let _ = DmaConfig::new().priority(16);
    }
}
