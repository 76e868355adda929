#![forbid(unsafe_code)]

//! PCI plumbing and PCI-attached USB host controllers of the MCPX south bridge.

pub mod irq;
pub mod pci;
pub mod usb;

pub use irq::{IrqLine, NoIrq, SharedIrqLine};
pub use pci::{PciBdf, PciBus, PciBusError, PciDevice};
pub use usb::{OhciPciConfig, OhciPciDevice};
