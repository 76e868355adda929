use memory::GuestMemory;
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::config::{all_ones, PciBarKind, PciDevice};
use super::{PciBdf, PCI_CONFIG_ADDRESS_PORT, PCI_CONFIG_DATA_PORT};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PciBusError {
    #[error("a PCI device is already connected at {0}")]
    DuplicateDevice(PciBdf),
    #[error("BAR{bar} of {bdf} overlaps a BAR of {existing}")]
    OverlappingBar {
        bdf: PciBdf,
        bar: u8,
        existing: PciBdf,
    },
}

/// Configuration-space bus with mechanism #1 config ports and BAR-decoded I/O and MMIO routing.
///
/// Devices are kept in registration order; BAR lookups scan them linearly and the first match
/// wins. Devices are never removed once connected.
#[derive(Default)]
pub struct PciBus {
    devices: Vec<(PciBdf, Box<dyn PciDevice>)>,
    config_address: u32,
}

impl PciBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `device` at `bdf`.
    ///
    /// Fails if the slot is taken or if one of the device's programmed BARs overlaps a BAR of an
    /// already connected device in the same address space.
    pub fn connect_device(
        &mut self,
        bdf: PciBdf,
        device: Box<dyn PciDevice>,
    ) -> Result<(), PciBusError> {
        if self.index_of(bdf).is_some() {
            warn!(%bdf, "attempt to connect two devices at the same PCI address");
            return Err(PciBusError::DuplicateDevice(bdf));
        }

        for (bar, range) in device.config().mapped_bars() {
            for (existing, other) in &self.devices {
                if other
                    .config()
                    .mapped_bars()
                    .any(|(_, other_range)| other_range.overlaps(&range))
                {
                    warn!(%bdf, bar, %existing, "rejecting device with overlapping BAR");
                    return Err(PciBusError::OverlappingBar {
                        bdf,
                        bar,
                        existing: *existing,
                    });
                }
            }
        }

        debug!(%bdf, "PCI device connected");
        self.devices.push((bdf, device));
        Ok(())
    }

    pub fn bdfs(&self) -> impl Iterator<Item = PciBdf> + '_ {
        self.devices.iter().map(|(bdf, _)| *bdf)
    }

    pub fn device(&self, bdf: PciBdf) -> Option<&dyn PciDevice> {
        let i = self.index_of(bdf)?;
        Some(&*self.devices[i].1)
    }

    pub fn device_mut(&mut self, bdf: PciBdf) -> Option<&mut (dyn PciDevice + 'static)> {
        let i = self.index_of(bdf)?;
        Some(&mut *self.devices[i].1)
    }

    /// Typed access to the device at `bdf`, for machine assembly and hotplug.
    pub fn device_as<T: PciDevice>(&self, bdf: PciBdf) -> Option<&T> {
        self.device(bdf)?.as_any().downcast_ref()
    }

    pub fn device_as_mut<T: PciDevice>(&mut self, bdf: PciBdf) -> Option<&mut T> {
        self.device_mut(bdf)?.as_any_mut().downcast_mut()
    }

    pub fn config_address(&self) -> u32 {
        self.config_address
    }

    /// Latches the configuration address register verbatim.
    pub fn write_config_address(&mut self, value: u32) {
        self.config_address = value;
    }

    /// Configuration data read through the latched address; `byte_offset` selects the byte
    /// within the 4-byte data window.
    pub fn read_config_data(&mut self, size: usize, byte_offset: u8) -> u32 {
        let bdf = PciBdf::from_config_address(self.config_address);
        let offset = self.config_register() + u16::from(byte_offset);
        let Some(i) = self.index_of(bdf) else {
            debug!(%bdf, offset = format_args!("{offset:#x}"), size, "config read from empty slot");
            return all_ones(size);
        };
        let value = self.devices[i].1.config_read(offset, size);
        trace!(
            %bdf,
            offset = format_args!("{offset:#x}"),
            size,
            value = format_args!("{value:#x}"),
            "config read"
        );
        value
    }

    pub fn write_config_data(&mut self, size: usize, byte_offset: u8, value: u32) {
        let bdf = PciBdf::from_config_address(self.config_address);
        let offset = self.config_register() + u16::from(byte_offset);
        let Some(i) = self.index_of(bdf) else {
            debug!(
                %bdf,
                offset = format_args!("{offset:#x}"),
                size,
                value = format_args!("{value:#x}"),
                "config write to empty slot"
            );
            return;
        };
        trace!(
            %bdf,
            offset = format_args!("{offset:#x}"),
            size,
            value = format_args!("{value:#x}"),
            "config write"
        );
        self.devices[i].1.config_write(offset, size, value);
    }

    pub fn io_read(&mut self, port: u16, size: usize) -> u32 {
        match port {
            PCI_CONFIG_ADDRESS_PORT => self.config_address & all_ones(size),
            PCI_CONFIG_DATA_PORT..=0xcff => {
                self.read_config_data(size, (port - PCI_CONFIG_DATA_PORT) as u8)
            }
            _ => match self.find_bar(PciBarKind::Io, u64::from(port)) {
                Some((i, bar, offset)) => self.devices[i].1.io_read(bar, offset, size),
                None => {
                    warn!(port = format_args!("{port:#x}"), size, "unclaimed I/O read");
                    all_ones(size)
                }
            },
        }
    }

    pub fn io_write(&mut self, port: u16, size: usize, value: u32) {
        match port {
            PCI_CONFIG_ADDRESS_PORT => {
                if size != 4 {
                    warn!(
                        size,
                        value = format_args!("{value:#x}"),
                        "non-dword write to the PCI config address port"
                    );
                }
                self.write_config_address(value);
            }
            PCI_CONFIG_DATA_PORT..=0xcff => {
                self.write_config_data(size, (port - PCI_CONFIG_DATA_PORT) as u8, value)
            }
            _ => match self.find_bar(PciBarKind::Io, u64::from(port)) {
                Some((i, bar, offset)) => self.devices[i].1.io_write(bar, offset, size, value),
                None => warn!(
                    port = format_args!("{port:#x}"),
                    size,
                    value = format_args!("{value:#x}"),
                    "unclaimed I/O write"
                ),
            },
        }
    }

    pub fn mmio_read(&mut self, addr: u64, size: usize) -> u32 {
        match self.find_bar(PciBarKind::Mmio, addr) {
            Some((i, bar, offset)) => self.devices[i].1.mmio_read(bar, offset, size),
            None => {
                warn!(addr = format_args!("{addr:#x}"), size, "unclaimed MMIO read");
                all_ones(size)
            }
        }
    }

    pub fn mmio_write(&mut self, addr: u64, size: usize, value: u32) {
        match self.find_bar(PciBarKind::Mmio, addr) {
            Some((i, bar, offset)) => self.devices[i].1.mmio_write(bar, offset, size, value),
            None => warn!(
                addr = format_args!("{addr:#x}"),
                size,
                value = format_args!("{value:#x}"),
                "unclaimed MMIO write"
            ),
        }
    }

    /// Resets every device in registration order.
    pub fn reset(&mut self) {
        for (bdf, dev) in &mut self.devices {
            trace!(%bdf, "PCI device reset");
            dev.reset();
        }
    }

    /// Gives every device its timer slot.
    pub fn poll(&mut self, mem: &mut dyn GuestMemory) {
        for (_, dev) in &mut self.devices {
            dev.poll(mem);
        }
    }

    fn index_of(&self, bdf: PciBdf) -> Option<usize> {
        self.devices.iter().position(|(b, _)| *b == bdf)
    }

    fn config_register(&self) -> u16 {
        (self.config_address & 0xfc) as u16
    }

    /// First device BAR of `kind` containing `addr`, as (device index, BAR index, offset).
    fn find_bar(&self, kind: PciBarKind, addr: u64) -> Option<(usize, u8, u64)> {
        self.devices.iter().enumerate().find_map(|(i, (_, dev))| {
            dev.config()
                .mapped_bars()
                .find(|(_, range)| range.kind == kind && range.contains(addr))
                .map(|(bar, range)| (i, bar, addr - range.base))
        })
    }
}
