//! OHCI (USB 1.1) controller PCI function as found in the MCPX south bridge.

use std::any::Any;
use std::sync::Arc;

use mcpx_time::HostClock;
use mcpx_usb::ohci::regs::MMIO_SIZE;
use mcpx_usb::{OhciConfig, OhciController, UsbDeviceHandle, UsbError, UsbStatus};
use memory::{GuestMemory, MmioHandler};
use tracing::{debug, warn};

use crate::irq::{IrqLine, NoIrq};
use crate::pci::config::PCI_COMMAND_MEMORY;
use crate::pci::{all_ones, PciBarDefinition, PciBdf, PciConfigSpace, PciDevice};

pub const OHCI_VENDOR_ID: u16 = 0x10de;
pub const OHCI_DEVICE_ID: u16 = 0x01c2;
pub const OHCI_REVISION_ID: u8 = 0xd4;

/// Serial bus controller / USB / OHCI.
pub const OHCI_CLASS: (u8, u8, u8) = (0x0c, 0x03, 0x10);

#[derive(Debug, Clone)]
pub struct OhciPciConfig {
    /// Slot the function is connected at.
    pub bdf: PciBdf,
    /// Base of the BAR0 register window.
    pub mmio_base: u32,
    /// Value reported in the interrupt line register.
    pub irq_line: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    pub controller: OhciConfig,
}

impl Default for OhciPciConfig {
    fn default() -> Self {
        Self {
            bdf: PciBdf::new(0, 2, 0),
            mmio_base: 0xfed0_0000,
            irq_line: 1,
            vendor_id: OHCI_VENDOR_ID,
            device_id: OHCI_DEVICE_ID,
            revision_id: OHCI_REVISION_ID,
            controller: OhciConfig::default(),
        }
    }
}

/// PCI wrapper around [`OhciController`].
///
/// The controller's interrupt output is pushed to the configured [`IrqLine`] after every access
/// that can change it, and an unrecoverable controller error sets "detected parity error" in the
/// PCI status register.
pub struct OhciPciDevice {
    config: PciConfigSpace,
    controller: OhciController,
    irq: Box<dyn IrqLine>,
    last_irq_level: bool,
}

impl OhciPciDevice {
    pub const MMIO_BAR_INDEX: u8 = 0;
    pub const MMIO_BAR_SIZE: u32 = MMIO_SIZE as u32;

    pub fn new(cfg: &OhciPciConfig, clock: Arc<dyn HostClock>) -> Self {
        Self::with_irq(cfg, clock, Box::new(NoIrq))
    }

    pub fn with_irq(cfg: &OhciPciConfig, clock: Arc<dyn HostClock>, irq: Box<dyn IrqLine>) -> Self {
        let mut config = PciConfigSpace::new(cfg.vendor_id, cfg.device_id);
        let (class, subclass, prog_if) = OHCI_CLASS;
        config.set_class_code(class, subclass, prog_if, cfg.revision_id);
        config.set_interrupt_pin(1);
        config.set_interrupt_line(cfg.irq_line);
        config.set_bar_definition(
            Self::MMIO_BAR_INDEX,
            PciBarDefinition::Mmio {
                size: Self::MMIO_BAR_SIZE,
                prefetchable: false,
            },
        );
        config.set_bar_base(Self::MMIO_BAR_INDEX, cfg.mmio_base);
        config.set_command(PCI_COMMAND_MEMORY);

        debug!(
            bdf = %cfg.bdf,
            mmio_base = format_args!("{:#x}", cfg.mmio_base),
            irq_line = cfg.irq_line,
            "OHCI function created"
        );
        Self {
            config,
            controller: OhciController::new(cfg.controller.clone(), clock),
            irq,
            last_irq_level: false,
        }
    }

    pub fn controller(&self) -> &OhciController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut OhciController {
        &mut self.controller
    }

    pub fn irq_level(&self) -> bool {
        self.last_irq_level
    }

    pub fn attach(&mut self, port: usize, dev: &UsbDeviceHandle) -> Result<(), UsbError> {
        self.controller.attach(port, dev)?;
        self.sync();
        Ok(())
    }

    pub fn detach(&mut self, port: usize) -> Result<(), UsbError> {
        self.controller.detach(port)?;
        self.sync();
        Ok(())
    }

    /// Delivers a late transfer result to the controller; see
    /// [`OhciController::complete_async_packet`].
    pub fn complete_async_packet(
        &mut self,
        mem: &mut dyn GuestMemory,
        id: u64,
        status: UsbStatus,
        data: &[u8],
    ) -> bool {
        let done = self
            .controller
            .complete_async_packet(mem, id, status, data);
        self.sync();
        done
    }

    /// Pushes controller-side interrupt and error state out to the IRQ line and PCI status.
    fn sync(&mut self) {
        let status = self.controller.take_pci_status_bits();
        if status != 0 {
            warn!(status = format_args!("{status:#06x}"), "OHCI reported a PCI error");
            self.config.set_status_bits(status);
        }
        let level = self.controller.irq_level();
        if level != self.last_irq_level {
            self.last_irq_level = level;
            self.irq.set_level(level);
        }
    }
}

impl PciDevice for OhciPciDevice {
    fn config(&self) -> &PciConfigSpace {
        &self.config
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.config
    }

    fn mmio_read(&mut self, bar: u8, offset: u64, size: usize) -> u32 {
        if bar != Self::MMIO_BAR_INDEX {
            warn!(bar, offset = format_args!("{offset:#x}"), "OHCI read from unknown BAR");
            return all_ones(size);
        }
        let value = MmioHandler::read(&mut self.controller, offset, size) as u32;
        self.sync();
        value
    }

    fn mmio_write(&mut self, bar: u8, offset: u64, size: usize, value: u32) {
        if bar != Self::MMIO_BAR_INDEX {
            warn!(bar, offset = format_args!("{offset:#x}"), "OHCI write to unknown BAR");
            return;
        }
        MmioHandler::write(&mut self.controller, offset, size, u64::from(value));
        self.sync();
    }

    fn reset(&mut self) {
        self.config.set_command(PCI_COMMAND_MEMORY);
        self.controller.hard_reset();
        self.sync();
    }

    fn poll(&mut self, mem: &mut dyn GuestMemory) {
        self.controller.poll(mem);
        self.sync();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
