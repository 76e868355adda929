#![forbid(unsafe_code)]

//! USB topology of the MCPX south bridge: one PCI bus carrying two OHCI functions, each on its own
//! interrupt line, with the console's four player slots mapped onto their root-hub ports.
//!
//! The platform does not own guest memory; callers lend it to [`UsbPlatform::poll`] and to async
//! completions.

use std::fmt;
use std::sync::Arc;

use mcpx_devices::irq::SharedIrqLine;
use mcpx_devices::pci::{PciBdf, PciBus, PciBusError};
use mcpx_devices::usb::{OhciPciConfig, OhciPciDevice};
use mcpx_time::HostClock;
use mcpx_usb::{UsbDeviceHandle, UsbError, UsbStatus};
use memory::GuestMemory;
use thiserror::Error;
use tracing::{debug, info};

pub use mcpx_devices;
pub use mcpx_time;
pub use mcpx_usb;
pub use memory;

/// Number of controller-side player slots on the console front panel.
pub const PLAYER_SLOTS: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error(transparent)]
    Pci(#[from] PciBusError),
    #[error(transparent)]
    Usb(#[from] UsbError),
    #[error("no USB controller {0}")]
    NoSuchController(usize),
    #[error("player slot {0} does not exist (expected 1..={PLAYER_SLOTS})")]
    InvalidPlayer(u8),
}

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// One entry per OHCI function, in PCI registration order.
    pub controllers: Vec<OhciPciConfig>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let second = OhciPciConfig {
            bdf: PciBdf::new(0, 3, 0),
            mmio_base: 0xfed0_8000,
            irq_line: 9,
            ..OhciPciConfig::default()
        };
        Self {
            controllers: vec![OhciPciConfig::default(), second],
        }
    }
}

/// A root-hub port on one of the platform's controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbLocation {
    pub controller: usize,
    pub port: usize,
}

impl fmt::Display for UsbLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ohci{}.{}", self.controller, self.port + 1)
    }
}

/// Root-hub port wired to front-panel player slot `player` (1-based).
pub fn player_port(player: u8) -> Result<UsbLocation, PlatformError> {
    if !(1..=PLAYER_SLOTS).contains(&player) {
        return Err(PlatformError::InvalidPlayer(player));
    }
    let slot = usize::from(player - 1);
    Ok(UsbLocation {
        controller: slot / 2,
        port: slot % 2,
    })
}

struct ControllerSlot {
    bdf: PciBdf,
    irq_line: u8,
    irq: SharedIrqLine,
}

pub struct UsbPlatform {
    bus: PciBus,
    controllers: Vec<ControllerSlot>,
}

impl UsbPlatform {
    pub fn new(config: PlatformConfig, clock: Arc<dyn HostClock>) -> Result<Self, PlatformError> {
        let mut bus = PciBus::new();
        let mut controllers = Vec::with_capacity(config.controllers.len());
        for cfg in &config.controllers {
            let irq = SharedIrqLine::new();
            let dev = OhciPciDevice::with_irq(cfg, Arc::clone(&clock), Box::new(irq.clone()));
            bus.connect_device(cfg.bdf, Box::new(dev))?;
            controllers.push(ControllerSlot {
                bdf: cfg.bdf,
                irq_line: cfg.irq_line,
                irq,
            });
        }
        info!(controllers = controllers.len(), "USB platform assembled");
        Ok(Self { bus, controllers })
    }

    pub fn bus(&self) -> &PciBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut PciBus {
        &mut self.bus
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    pub fn controller(&self, index: usize) -> Result<&OhciPciDevice, PlatformError> {
        let bdf = self.bdf(index)?;
        self.bus
            .device_as::<OhciPciDevice>(bdf)
            .ok_or(PlatformError::NoSuchController(index))
    }

    pub fn controller_mut(&mut self, index: usize) -> Result<&mut OhciPciDevice, PlatformError> {
        let bdf = self.bdf(index)?;
        self.bus
            .device_as_mut::<OhciPciDevice>(bdf)
            .ok_or(PlatformError::NoSuchController(index))
    }

    pub fn io_read(&mut self, port: u16, size: usize) -> u32 {
        self.bus.io_read(port, size)
    }

    pub fn io_write(&mut self, port: u16, size: usize, value: u32) {
        self.bus.io_write(port, size, value);
    }

    pub fn mmio_read(&mut self, addr: u64, size: usize) -> u32 {
        self.bus.mmio_read(addr, size)
    }

    pub fn mmio_write(&mut self, addr: u64, size: usize, value: u32) {
        self.bus.mmio_write(addr, size, value);
    }

    /// Runs every elapsed USB frame on every controller.
    pub fn poll(&mut self, mem: &mut dyn GuestMemory) {
        self.bus.poll(mem);
    }

    pub fn reset(&mut self) {
        debug!("USB platform reset");
        self.bus.reset();
    }

    /// Level of platform interrupt line `line`; high if any controller wired to it asserts.
    pub fn irq_level(&self, line: u8) -> bool {
        self.controllers
            .iter()
            .any(|c| c.irq_line == line && c.irq.level())
    }

    pub fn attach(
        &mut self,
        location: UsbLocation,
        device: &UsbDeviceHandle,
    ) -> Result<(), PlatformError> {
        self.controller_mut(location.controller)?
            .attach(location.port, device)?;
        debug!(%location, "device plugged");
        Ok(())
    }

    pub fn detach(&mut self, location: UsbLocation) -> Result<(), PlatformError> {
        self.controller_mut(location.controller)?
            .detach(location.port)?;
        debug!(%location, "device unplugged");
        Ok(())
    }

    /// Hands a late transfer result to controller `index`. Returns whether it matched the pending
    /// transfer.
    pub fn complete_async(
        &mut self,
        index: usize,
        mem: &mut dyn GuestMemory,
        id: u64,
        status: UsbStatus,
        data: &[u8],
    ) -> Result<bool, PlatformError> {
        Ok(self
            .controller_mut(index)?
            .complete_async_packet(mem, id, status, data))
    }

    fn bdf(&self, index: usize) -> Result<PciBdf, PlatformError> {
        self.controllers
            .get(index)
            .map(|c| c.bdf)
            .ok_or(PlatformError::NoSuchController(index))
    }
}
