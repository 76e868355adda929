//! Guest physical memory and MMIO access traits shared by the device models.

mod mmio;
mod phys;

pub use mmio::MmioHandler;
pub use phys::{DenseMemory, GuestMemory, GuestMemoryError, GuestMemoryResult};
