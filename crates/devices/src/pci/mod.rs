//! PCI core: addressing, type 0 configuration space and the configuration-mechanism #1 bus.

pub mod config;

mod bus;

pub use bus::{PciBus, PciBusError};
pub use config::{
    all_ones, PciBarDefinition, PciBarKind, PciBarRange, PciClassCode, PciConfigSpace, PciDevice,
    PciVendorDeviceId,
};

use std::fmt;

/// Configuration address latch (mechanism #1).
pub const PCI_CONFIG_ADDRESS_PORT: u16 = 0xcf8;
/// First of the four configuration data ports.
pub const PCI_CONFIG_DATA_PORT: u16 = 0xcfc;

/// PCI bus/device/function identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    /// # Panics
    ///
    /// Panics if `device >= 32` or `function >= 8`.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        assert!(device < 32, "PCI device number out of range");
        assert!(function < 8, "PCI function number out of range");
        Self {
            bus,
            device,
            function,
        }
    }

    /// Packs into the device-table key: bus in bits 8..=15, device in 3..=7, function in 0..=2.
    ///
    /// This is the BDF part of a mechanism #1 address shifted right by 8.
    pub const fn pack_u16(self) -> u16 {
        ((self.bus as u16) << 8) | ((self.device as u16) << 3) | (self.function as u16)
    }

    pub const fn unpack_u16(v: u16) -> Self {
        Self {
            bus: (v >> 8) as u8,
            device: ((v >> 3) & 0x1f) as u8,
            function: (v & 0x7) as u8,
        }
    }

    /// Decodes the target of a mechanism #1 configuration address.
    pub const fn from_config_address(addr: u32) -> Self {
        Self::unpack_u16((addr >> 8) as u16)
    }

    /// Builds a mechanism #1 configuration address (enable bit set) for `register`.
    pub const fn config_address(self, register: u8) -> u32 {
        0x8000_0000 | ((self.pack_u16() as u32) << 8) | (register as u32 & 0xfc)
    }
}

impl From<PciBdf> for u16 {
    fn from(value: PciBdf) -> Self {
        value.pack_u16()
    }
}

impl From<u16> for PciBdf {
    fn from(value: u16) -> Self {
        Self::unpack_u16(value)
    }
}

impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}
