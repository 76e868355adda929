use std::any::Any;

use memory::GuestMemory;
use tracing::warn;

pub const PCI_CONFIG_SPACE_SIZE: usize = 256;

pub const PCI_VENDOR_ID_OFFSET: u16 = 0x00;
pub const PCI_DEVICE_ID_OFFSET: u16 = 0x02;
pub const PCI_COMMAND_OFFSET: u16 = 0x04;
pub const PCI_STATUS_OFFSET: u16 = 0x06;
pub const PCI_REVISION_ID_OFFSET: u16 = 0x08;
pub const PCI_HEADER_TYPE_OFFSET: u16 = 0x0e;
pub const PCI_BAR0_OFFSET: u16 = 0x10;
pub const PCI_INTERRUPT_LINE_OFFSET: u16 = 0x3c;
pub const PCI_INTERRUPT_PIN_OFFSET: u16 = 0x3d;

pub const PCI_BAR_COUNT: usize = 6;

pub const PCI_COMMAND_IO: u16 = 1 << 0;
pub const PCI_COMMAND_MEMORY: u16 = 1 << 1;
pub const PCI_COMMAND_MASTER: u16 = 1 << 2;

/// Status bits that latch error conditions; guests clear them by writing ones.
pub const PCI_STATUS_ERROR_BITS: u16 = 0xf900;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciVendorDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciClassCode {
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision_id: u8,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PciBarKind {
    Io,
    Mmio,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PciBarDefinition {
    Io { size: u32 },
    Mmio { size: u32, prefetchable: bool },
}

impl PciBarDefinition {
    pub fn kind(&self) -> PciBarKind {
        match self {
            Self::Io { .. } => PciBarKind::Io,
            Self::Mmio { .. } => PciBarKind::Mmio,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Io { size } | Self::Mmio { size, .. } => u64::from(*size),
        }
    }

    fn base_mask(&self) -> u32 {
        match self {
            Self::Io { size } => !(size - 1) & 0xffff_fffc,
            Self::Mmio { size, .. } => !(size - 1) & 0xffff_fff0,
        }
    }

    /// Low bits a BAR register reports alongside its base address.
    fn type_bits(&self) -> u32 {
        match self {
            Self::Io { .. } => 0x1,
            Self::Mmio { prefetchable, .. } => {
                if *prefetchable {
                    1 << 3
                } else {
                    0
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciBarRange {
    pub kind: PciBarKind,
    pub base: u64,
    pub size: u64,
}

impl PciBarRange {
    pub fn end_exclusive(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end_exclusive()
    }

    pub fn overlaps(&self, other: &PciBarRange) -> bool {
        self.kind == other.kind
            && self.base < other.end_exclusive()
            && other.base < self.end_exclusive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PciBarState {
    def: Option<PciBarDefinition>,
    base: u32,
    probe: bool,
}

impl PciBarState {
    fn range(&self) -> Option<PciBarRange> {
        let def = self.def?;
        Some(PciBarRange {
            kind: def.kind(),
            base: u64::from(self.base),
            size: def.size(),
        })
    }

    fn register(&self) -> u32 {
        match self.def {
            Some(def) if self.probe => def.base_mask() | def.type_bits(),
            _ => self.raw(),
        }
    }

    /// Programmed base plus type bits, ignoring any pending size probe.
    fn raw(&self) -> u32 {
        self.def
            .map_or(0, |def| (self.base & def.base_mask()) | def.type_bits())
    }

    fn write_register(&mut self, value: u32) {
        let Some(def) = self.def else {
            return;
        };
        if value == 0xffff_ffff {
            // Size probe: the next read returns the size mask.
            self.probe = true;
            return;
        }
        self.probe = false;
        self.base = value & def.base_mask();
    }
}

/// Type 0 PCI configuration header.
///
/// Identity bytes, the header type, the interrupt pin and the status register are read-only to
/// the guest; device code sets them through the typed setters. The status error bits are
/// write-one-to-clear. BAR registers implement the usual "write all ones, read back the size mask"
/// probe.
pub struct PciConfigSpace {
    bytes: [u8; PCI_CONFIG_SPACE_SIZE],
    bars: [PciBarState; PCI_BAR_COUNT],
}

impl PciConfigSpace {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut bytes = [0u8; PCI_CONFIG_SPACE_SIZE];
        bytes[0x00..0x02].copy_from_slice(&vendor_id.to_le_bytes());
        bytes[0x02..0x04].copy_from_slice(&device_id.to_le_bytes());
        Self {
            bytes,
            bars: [PciBarState::default(); PCI_BAR_COUNT],
        }
    }

    pub fn vendor_device_id(&self) -> PciVendorDeviceId {
        PciVendorDeviceId {
            vendor_id: self.read_u16(PCI_VENDOR_ID_OFFSET),
            device_id: self.read_u16(PCI_DEVICE_ID_OFFSET),
        }
    }

    pub fn class_code(&self) -> PciClassCode {
        PciClassCode {
            revision_id: self.bytes[0x08],
            prog_if: self.bytes[0x09],
            subclass: self.bytes[0x0a],
            class: self.bytes[0x0b],
        }
    }

    pub fn set_class_code(&mut self, class: u8, subclass: u8, prog_if: u8, revision_id: u8) {
        self.bytes[0x08] = revision_id;
        self.bytes[0x09] = prog_if;
        self.bytes[0x0a] = subclass;
        self.bytes[0x0b] = class;
    }

    pub fn header_type(&self) -> u8 {
        self.bytes[usize::from(PCI_HEADER_TYPE_OFFSET)]
    }

    pub fn set_header_type(&mut self, header_type: u8) {
        self.bytes[usize::from(PCI_HEADER_TYPE_OFFSET)] = header_type;
    }

    pub fn command(&self) -> u16 {
        self.read_u16(PCI_COMMAND_OFFSET)
    }

    pub fn set_command(&mut self, command: u16) {
        self.write_u16(PCI_COMMAND_OFFSET, command);
    }

    pub fn status(&self) -> u16 {
        self.read_u16(PCI_STATUS_OFFSET)
    }

    /// Latches device-reported status bits (errors, capabilities).
    pub fn set_status_bits(&mut self, bits: u16) {
        let status = self.status() | bits;
        self.write_u16(PCI_STATUS_OFFSET, status);
    }

    pub fn interrupt_line(&self) -> u8 {
        self.bytes[usize::from(PCI_INTERRUPT_LINE_OFFSET)]
    }

    pub fn set_interrupt_line(&mut self, line: u8) {
        self.bytes[usize::from(PCI_INTERRUPT_LINE_OFFSET)] = line;
    }

    pub fn interrupt_pin(&self) -> u8 {
        self.bytes[usize::from(PCI_INTERRUPT_PIN_OFFSET)]
    }

    pub fn set_interrupt_pin(&mut self, pin: u8) {
        self.bytes[usize::from(PCI_INTERRUPT_PIN_OFFSET)] = pin;
    }

    /// # Panics
    ///
    /// Panics on an out-of-range index or a size that is not a power of two at least as large as
    /// the BAR type's minimum (4 bytes for I/O, 16 for memory).
    pub fn set_bar_definition(&mut self, index: u8, def: PciBarDefinition) {
        let index = usize::from(index);
        assert!(index < PCI_BAR_COUNT, "BAR index {index} out of range");
        match def {
            PciBarDefinition::Io { size } => {
                assert!(size.is_power_of_two(), "PCI I/O BAR size must be a power of two");
                assert!(size >= 4, "PCI I/O BAR size must be at least 4 bytes");
            }
            PciBarDefinition::Mmio { size, .. } => {
                assert!(size.is_power_of_two(), "PCI MMIO BAR size must be a power of two");
                assert!(size >= 0x10, "PCI MMIO BAR size must be at least 16 bytes");
            }
        }
        self.bars[index] = PciBarState {
            def: Some(def),
            base: 0,
            probe: false,
        };
    }

    pub fn bar_definition(&self, index: u8) -> Option<PciBarDefinition> {
        self.bars.get(usize::from(index)).and_then(|bar| bar.def)
    }

    pub fn bar_range(&self, index: u8) -> Option<PciBarRange> {
        self.bars.get(usize::from(index)).and_then(PciBarState::range)
    }

    /// Programmed BARs (non-zero base), as `(index, range)` pairs.
    pub fn mapped_bars(&self) -> impl Iterator<Item = (u8, PciBarRange)> + '_ {
        self.bars
            .iter()
            .enumerate()
            .filter_map(|(i, bar)| Some((i as u8, bar.range()?)))
            .filter(|(_, range)| range.base != 0)
    }

    pub fn set_bar_base(&mut self, index: u8, base: u32) {
        let Some(bar) = self.bars.get_mut(usize::from(index)) else {
            return;
        };
        if let Some(def) = bar.def {
            bar.base = base & def.base_mask();
            bar.probe = false;
        }
    }

    /// Guest config read of `size` bytes at `offset`. Bytes past the end of the header read as
    /// `0xFF`, and so does an access that is not 1, 2 or 4 bytes wide.
    pub fn read(&self, offset: u16, size: usize) -> u32 {
        if !matches!(size, 1 | 2 | 4) {
            warn!(offset = format_args!("{offset:#x}"), size, "invalid config read size");
            return all_ones(size);
        }
        (0..size).fold(0u32, |value, i| {
            value | (u32::from(self.read_byte(usize::from(offset) + i)) << (8 * i))
        })
    }

    /// Guest config write of `size` bytes at `offset`. Read-only bytes and bytes past the end of
    /// the header are dropped, as is a write that is not 1, 2 or 4 bytes wide.
    pub fn write(&mut self, offset: u16, size: usize, value: u32) {
        if !matches!(size, 1 | 2 | 4) {
            warn!(
                offset = format_args!("{offset:#x}"),
                size,
                value = format_args!("{value:#x}"),
                "invalid config write size ignored"
            );
            return;
        }
        let offset = usize::from(offset);
        let bar0 = usize::from(PCI_BAR0_OFFSET);
        let status = usize::from(PCI_STATUS_OFFSET);
        // Per-BAR (byte mask, bytes) so partial writes merge with the current register.
        let mut bar_writes = [(0u32, 0u32); PCI_BAR_COUNT];

        for i in 0..size {
            let addr = offset + i;
            let byte = (value >> (8 * i)) as u8;
            if addr >= PCI_CONFIG_SPACE_SIZE {
                warn!(offset = format_args!("{addr:#x}"), "config write past end of header");
            } else if (bar0..bar0 + 4 * PCI_BAR_COUNT).contains(&addr) {
                let shift = 8 * (addr % 4);
                let (mask, bits) = &mut bar_writes[(addr - bar0) / 4];
                *mask |= 0xff << shift;
                *bits |= u32::from(byte) << shift;
            } else if addr == status || addr == status + 1 {
                let clear = (u16::from(byte) << (8 * (addr - status))) & PCI_STATUS_ERROR_BITS;
                let value = self.status() & !clear;
                self.write_u16(PCI_STATUS_OFFSET, value);
            } else if !Self::is_read_only_byte(addr) {
                self.bytes[addr] = byte;
            }
        }

        for (bar, (mask, bits)) in self.bars.iter_mut().zip(bar_writes) {
            if mask != 0 {
                let merged = (bar.raw() & !mask) | bits;
                bar.write_register(merged);
            }
        }
    }

    fn read_byte(&self, addr: usize) -> u8 {
        if addr >= PCI_CONFIG_SPACE_SIZE {
            return 0xff;
        }
        let bar0 = usize::from(PCI_BAR0_OFFSET);
        if (bar0..bar0 + 4 * PCI_BAR_COUNT).contains(&addr) {
            let reg = self.bars[(addr - bar0) / 4].register();
            return (reg >> (8 * (addr % 4))) as u8;
        }
        self.bytes[addr]
    }

    fn is_read_only_byte(addr: usize) -> bool {
        // Vendor/device ID, revision and class code, header type, BIST, subsystem IDs, interrupt
        // pin.
        addr < 0x04
            || (0x08..=0x0b).contains(&addr)
            || addr == usize::from(PCI_HEADER_TYPE_OFFSET)
            || addr == 0x0f
            || (0x2c..0x30).contains(&addr)
            || addr == usize::from(PCI_INTERRUPT_PIN_OFFSET)
    }

    fn read_u16(&self, offset: u16) -> u16 {
        let offset = usize::from(offset);
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    fn write_u16(&mut self, offset: u16, value: u16) {
        let offset = usize::from(offset);
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }
}

/// A function on the PCI bus.
///
/// The bus routes config cycles to [`PciDevice::config_read`]/[`PciDevice::config_write`] and
/// BAR-decoded accesses to the `io_*`/`mmio_*` hooks with the BAR index and the offset into that
/// BAR.
pub trait PciDevice: Any {
    fn config(&self) -> &PciConfigSpace;
    fn config_mut(&mut self) -> &mut PciConfigSpace;

    fn config_read(&mut self, offset: u16, size: usize) -> u32 {
        self.config().read(offset, size)
    }

    fn config_write(&mut self, offset: u16, size: usize, value: u32) {
        self.config_mut().write(offset, size, value);
    }

    fn io_read(&mut self, bar: u8, offset: u64, size: usize) -> u32 {
        warn!(bar, offset = format_args!("{offset:#x}"), size, "unhandled PCI I/O read");
        all_ones(size)
    }

    fn io_write(&mut self, bar: u8, offset: u64, size: usize, value: u32) {
        warn!(
            bar,
            offset = format_args!("{offset:#x}"),
            size,
            value = format_args!("{value:#x}"),
            "unhandled PCI I/O write"
        );
    }

    fn mmio_read(&mut self, bar: u8, offset: u64, size: usize) -> u32 {
        warn!(bar, offset = format_args!("{offset:#x}"), size, "unhandled PCI MMIO read");
        all_ones(size)
    }

    fn mmio_write(&mut self, bar: u8, offset: u64, size: usize, value: u32) {
        warn!(
            bar,
            offset = format_args!("{offset:#x}"),
            size,
            value = format_args!("{value:#x}"),
            "unhandled PCI MMIO write"
        );
    }

    /// Platform reset. BAR programming survives; decoding and bus mastering are turned off.
    fn reset(&mut self) {
        self.config_mut().set_command(0);
    }

    /// Cooperative time slice for devices with timers.
    fn poll(&mut self, _mem: &mut dyn GuestMemory) {}

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// All-ones value for an access of `size` bytes, the floating-bus answer.
pub fn all_ones(size: usize) -> u32 {
    match size {
        0 => 0,
        1..=3 => (1 << (8 * size)) - 1,
        _ => 0xffff_ffff,
    }
}
