//! OHCI (USB 1.1) operational register offsets and bitfields.

/// Size of the OHCI MMIO register window exposed through PCI BAR0.
pub const MMIO_SIZE: u64 = 0x1000;

/// HcRevision: OHCI 1.0, no legacy emulation.
pub const OHCI_REVISION: u32 = 0x10;

pub const REG_REVISION: u64 = 0x00;
pub const REG_CONTROL: u64 = 0x04;
pub const REG_COMMAND_STATUS: u64 = 0x08;
pub const REG_INTERRUPT_STATUS: u64 = 0x0c;
pub const REG_INTERRUPT_ENABLE: u64 = 0x10;
pub const REG_INTERRUPT_DISABLE: u64 = 0x14;
pub const REG_HCCA: u64 = 0x18;
pub const REG_PERIOD_CURRENT_ED: u64 = 0x1c;
pub const REG_CONTROL_HEAD_ED: u64 = 0x20;
pub const REG_CONTROL_CURRENT_ED: u64 = 0x24;
pub const REG_BULK_HEAD_ED: u64 = 0x28;
pub const REG_BULK_CURRENT_ED: u64 = 0x2c;
pub const REG_DONE_HEAD: u64 = 0x30;
pub const REG_FM_INTERVAL: u64 = 0x34;
pub const REG_FM_REMAINING: u64 = 0x38;
pub const REG_FM_NUMBER: u64 = 0x3c;
pub const REG_PERIODIC_START: u64 = 0x40;
pub const REG_LS_THRESHOLD: u64 = 0x44;
pub const REG_RH_DESCRIPTOR_A: u64 = 0x48;
pub const REG_RH_DESCRIPTOR_B: u64 = 0x4c;
pub const REG_RH_STATUS: u64 = 0x50;
pub const REG_RH_PORT_STATUS_BASE: u64 = 0x54;

pub const fn reg_rh_port_status(port: usize) -> u64 {
    REG_RH_PORT_STATUS_BASE + (port as u64) * 4
}

// HcControl.
pub const CTL_CBSR: u32 = 3 << 0;
pub const CTL_PLE: u32 = 1 << 2;
pub const CTL_IE: u32 = 1 << 3;
pub const CTL_CLE: u32 = 1 << 4;
pub const CTL_BLE: u32 = 1 << 5;
pub const CTL_HCFS: u32 = 3 << 6;
pub const CTL_IR: u32 = 1 << 8;
pub const CTL_RWC: u32 = 1 << 9;
pub const CTL_RWE: u32 = 1 << 10;

// HostControllerFunctionalState values (within CTL_HCFS).
pub const USB_RESET: u32 = 0x00;
pub const USB_RESUME: u32 = 0x40;
pub const USB_OPERATIONAL: u32 = 0x80;
pub const USB_SUSPEND: u32 = 0xc0;

// HcCommandStatus.
pub const STATUS_HCR: u32 = 1 << 0;
pub const STATUS_CLF: u32 = 1 << 1;
pub const STATUS_BLF: u32 = 1 << 2;
pub const STATUS_OCR: u32 = 1 << 3;
pub const STATUS_SOC: u32 = 3 << 16;

// HcInterruptStatus / HcInterruptEnable / HcInterruptDisable.
pub const INTR_SO: u32 = 1 << 0;
pub const INTR_WD: u32 = 1 << 1;
pub const INTR_SF: u32 = 1 << 2;
pub const INTR_RD: u32 = 1 << 3;
pub const INTR_UE: u32 = 1 << 4;
pub const INTR_FNO: u32 = 1 << 5;
pub const INTR_RHSC: u32 = 1 << 6;
pub const INTR_OC: u32 = 1 << 30;
pub const INTR_MIE: u32 = 1 << 31;

pub const HCCA_WRITE_MASK: u32 = 0xffff_ff00;
pub const DPTR_MASK: u32 = 0xffff_fff0;

// HcFmInterval.
pub const FMI_FI: u32 = 0x0000_3fff;
pub const FMI_FSMPS: u32 = 0xffff_0000;
pub const FMI_FIT: u32 = 1 << 31;

/// Power-on FrameInterval (11999 bit times per frame).
pub const FI_DEFAULT: u16 = 0x2edf;
/// Power-on FSLargestDataPacket.
pub const FSMPS_DEFAULT: u16 = 0x2778;
pub const LS_THRESHOLD_DEFAULT: u16 = 0x0628;

// HcRhDescriptorA.
pub const RHA_NDP: u32 = 0xff;
pub const RHA_PSM: u32 = 1 << 8;
pub const RHA_NPS: u32 = 1 << 9;
pub const RHA_DT: u32 = 1 << 10;
pub const RHA_OCPM: u32 = 1 << 11;
pub const RHA_NOCP: u32 = 1 << 12;
pub const RHA_POTPGT: u32 = 0xff << 24;
/// Guest-writable bits of HcRhDescriptorA. Power switching is fixed, so nothing is writable.
pub const RHA_RW_MASK: u32 = 0;

// HcRhStatus.
pub const RHS_LPS: u32 = 1 << 0;
pub const RHS_OCI: u32 = 1 << 1;
pub const RHS_DRWE: u32 = 1 << 15;
pub const RHS_LPSC: u32 = 1 << 16;
pub const RHS_OCIC: u32 = 1 << 17;
pub const RHS_CRWE: u32 = 1 << 31;

// HcRhPortStatus.
pub const PORT_CCS: u32 = 1 << 0;
pub const PORT_PES: u32 = 1 << 1;
pub const PORT_PSS: u32 = 1 << 2;
pub const PORT_POCI: u32 = 1 << 3;
pub const PORT_PRS: u32 = 1 << 4;
pub const PORT_PPS: u32 = 1 << 8;
pub const PORT_LSDA: u32 = 1 << 9;
pub const PORT_CSC: u32 = 1 << 16;
pub const PORT_PESC: u32 = 1 << 17;
pub const PORT_PSSC: u32 = 1 << 18;
pub const PORT_OCIC: u32 = 1 << 19;
pub const PORT_PRSC: u32 = 1 << 20;
pub const PORT_WTC: u32 = PORT_CSC | PORT_PESC | PORT_PSSC | PORT_OCIC | PORT_PRSC;

/// `done_count` value meaning "no writeback pending".
pub const DONE_COUNT_IDLE: u8 = 7;

/// Fatal-error flag reflected into the PCI status register (detected parity error).
pub const PCI_STATUS_DETECTED_PARITY_ERROR: u16 = 1 << 15;
