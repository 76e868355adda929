//! USB host controller PCI functions.

pub mod ohci;

pub use ohci::{OhciPciConfig, OhciPciDevice};
