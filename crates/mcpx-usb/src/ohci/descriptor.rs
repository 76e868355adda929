//! Guest-memory layouts of the HCCA, endpoint descriptors and transfer descriptors.
//!
//! All structures are little-endian dwords. Each type reads and writes itself through
//! [`GuestMemory`] and surfaces access failures to the caller, which treats them as fatal
//! controller errors.

use memory::{GuestMemory, GuestMemoryResult};

use super::regs::DPTR_MASK;

/// Offset of the frame number / done head block inside the HCCA.
pub const HCCA_WRITEBACK_OFFSET: u64 = 0x80;
pub const HCCA_SIZE: usize = 0x88;
pub const HCCA_INTERRUPT_ENTRIES: usize = 32;

/// Host Controller Communication Area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hcca {
    pub intr: [u32; HCCA_INTERRUPT_ENTRIES],
    pub frame: u16,
    pub pad: u16,
    pub done: u32,
}

impl Hcca {
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> GuestMemoryResult<Self> {
        let mut raw = [0u8; HCCA_SIZE];
        mem.read_into(u64::from(addr), &mut raw)?;
        let mut intr = [0u32; HCCA_INTERRUPT_ENTRIES];
        for (i, entry) in intr.iter_mut().enumerate() {
            *entry = dword(&raw, i * 4);
        }
        Ok(Self {
            intr,
            frame: u16::from_le_bytes([raw[0x80], raw[0x81]]),
            pad: u16::from_le_bytes([raw[0x82], raw[0x83]]),
            done: dword(&raw, 0x84),
        })
    }

    /// Writes back the frame number, pad and done head. The interrupt table is never written.
    pub fn write_back(&self, mem: &mut dyn GuestMemory, addr: u32) -> GuestMemoryResult<()> {
        let mut raw = [0u8; 8];
        raw[0..2].copy_from_slice(&self.frame.to_le_bytes());
        raw[2..4].copy_from_slice(&self.pad.to_le_bytes());
        raw[4..8].copy_from_slice(&self.done.to_le_bytes());
        mem.write_from(u64::from(addr) + HCCA_WRITEBACK_OFFSET, &raw)
    }
}

fn dword(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
}

fn read_dwords<const N: usize>(mem: &dyn GuestMemory, addr: u32) -> GuestMemoryResult<[u32; N]> {
    let mut out = [0u32; N];
    for (i, word) in out.iter_mut().enumerate() {
        *word = mem.read_u32_le(u64::from(addr) + (i as u64) * 4)?;
    }
    Ok(out)
}

fn write_dwords(mem: &mut dyn GuestMemory, addr: u32, words: &[u32]) -> GuestMemoryResult<()> {
    for (i, word) in words.iter().enumerate() {
        mem.write_u32_le(u64::from(addr) + (i as u64) * 4, *word)?;
    }
    Ok(())
}

// Endpoint descriptor dword 0.
pub const ED_FA_MASK: u32 = 0x7f;
pub const ED_EN_SHIFT: u32 = 7;
pub const ED_EN_MASK: u32 = 0xf;
pub const ED_D_SHIFT: u32 = 11;
pub const ED_D_MASK: u32 = 3;
pub const ED_S: u32 = 1 << 13;
pub const ED_K: u32 = 1 << 14;
pub const ED_F: u32 = 1 << 15;
pub const ED_MPS_SHIFT: u32 = 16;
pub const ED_MPS_MASK: u32 = 0x7ff;

// Endpoint descriptor head pointer flags.
pub const ED_H: u32 = 1 << 0;
pub const ED_C: u32 = 1 << 1;

/// Endpoint descriptor (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ed {
    pub flags: u32,
    pub tail: u32,
    pub head: u32,
    pub next: u32,
}

impl Ed {
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> GuestMemoryResult<Self> {
        let [flags, tail, head, next] = read_dwords::<4>(mem, addr)?;
        Ok(Self {
            flags,
            tail,
            head,
            next,
        })
    }

    pub fn write(&self, mem: &mut dyn GuestMemory, addr: u32) -> GuestMemoryResult<()> {
        write_dwords(mem, addr, &[self.flags, self.tail, self.head, self.next])
    }

    /// Writes only the head pointer dword; the other fields belong to the guest.
    pub fn write_head(&self, mem: &mut dyn GuestMemory, addr: u32) -> GuestMemoryResult<()> {
        mem.write_u32_le(u64::from(addr) + 8, self.head)
    }

    pub fn function_address(&self) -> u8 {
        (self.flags & ED_FA_MASK) as u8
    }

    pub fn endpoint_number(&self) -> u8 {
        ((self.flags >> ED_EN_SHIFT) & ED_EN_MASK) as u8
    }

    pub fn direction(&self) -> u32 {
        (self.flags >> ED_D_SHIFT) & ED_D_MASK
    }

    pub fn max_packet_size(&self) -> usize {
        ((self.flags >> ED_MPS_SHIFT) & ED_MPS_MASK) as usize
    }

    pub fn is_skipped(&self) -> bool {
        self.flags & ED_K != 0
    }

    pub fn is_iso(&self) -> bool {
        self.flags & ED_F != 0
    }

    pub fn is_halted(&self) -> bool {
        self.head & ED_H != 0
    }

    pub fn toggle_carry(&self) -> bool {
        self.head & ED_C != 0
    }

    pub fn set_toggle_carry(&mut self, carry: bool) {
        self.head = (self.head & !ED_C) | if carry { ED_C } else { 0 };
    }

    pub fn head_ptr(&self) -> u32 {
        self.head & DPTR_MASK
    }

    pub fn tail_ptr(&self) -> u32 {
        self.tail & DPTR_MASK
    }

    /// Replaces the head pointer while keeping the halt and toggle-carry flags.
    pub fn set_head_ptr(&mut self, ptr: u32) {
        self.head = (self.head & !DPTR_MASK) | (ptr & DPTR_MASK);
    }
}

// Direction/PID encodings shared by ED.D and TD.DP.
pub const DIR_SETUP: u32 = 0;
pub const DIR_OUT: u32 = 1;
pub const DIR_IN: u32 = 2;

// General transfer descriptor dword 0.
pub const TD_R: u32 = 1 << 18;
pub const TD_DP_SHIFT: u32 = 19;
pub const TD_DP_MASK: u32 = 3;
pub const TD_DI_SHIFT: u32 = 21;
pub const TD_DI_MASK: u32 = 7;
pub const TD_T0: u32 = 1 << 24;
pub const TD_T1: u32 = 1 << 25;
pub const TD_EC_SHIFT: u32 = 26;
pub const TD_EC_MASK: u32 = 3;
pub const TD_CC_SHIFT: u32 = 28;
pub const TD_CC_MASK: u32 = 0xf;

/// General transfer descriptor (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Td {
    pub flags: u32,
    pub cbp: u32,
    pub next: u32,
    pub be: u32,
}

impl Td {
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> GuestMemoryResult<Self> {
        let [flags, cbp, next, be] = read_dwords::<4>(mem, addr)?;
        Ok(Self {
            flags,
            cbp,
            next,
            be,
        })
    }

    pub fn write(&self, mem: &mut dyn GuestMemory, addr: u32) -> GuestMemoryResult<()> {
        write_dwords(mem, addr, &[self.flags, self.cbp, self.next, self.be])
    }

    pub fn buffer_rounding(&self) -> bool {
        self.flags & TD_R != 0
    }

    pub fn direction(&self) -> u32 {
        (self.flags >> TD_DP_SHIFT) & TD_DP_MASK
    }

    pub fn delay_interrupt(&self) -> u8 {
        ((self.flags >> TD_DI_SHIFT) & TD_DI_MASK) as u8
    }

    pub fn condition_code(&self) -> u32 {
        (self.flags >> TD_CC_SHIFT) & TD_CC_MASK
    }

    pub fn set_condition_code(&mut self, cc: u32) {
        set_field(&mut self.flags, TD_CC_SHIFT, TD_CC_MASK, cc);
    }

    pub fn set_error_count(&mut self, ec: u32) {
        set_field(&mut self.flags, TD_EC_SHIFT, TD_EC_MASK, ec);
    }

    pub fn error_count(&self) -> u32 {
        (self.flags >> TD_EC_SHIFT) & TD_EC_MASK
    }
}

// Condition codes (TD.CC and PSW.CC).
pub const CC_NOERROR: u32 = 0x0;
pub const CC_CRC: u32 = 0x1;
pub const CC_BITSTUFFING: u32 = 0x2;
pub const CC_DATATOGGLEMISMATCH: u32 = 0x3;
pub const CC_STALL: u32 = 0x4;
pub const CC_DEVICENOTRESPONDING: u32 = 0x5;
pub const CC_PIDCHECKFAILURE: u32 = 0x6;
pub const CC_UNEXPECTEDPID: u32 = 0x7;
pub const CC_DATAOVERRUN: u32 = 0x8;
pub const CC_DATAUNDERRUN: u32 = 0x9;
pub const CC_BUFFEROVERRUN: u32 = 0xc;
pub const CC_BUFFERUNDERRUN: u32 = 0xd;
/// Set by software on TDs that have not been processed yet.
pub const CC_NOTACCESSED: u32 = 0xf;

// Isochronous transfer descriptor dword 0.
pub const ISO_TD_SF_MASK: u32 = 0xffff;
pub const ISO_TD_FC_SHIFT: u32 = 24;
pub const ISO_TD_FC_MASK: u32 = 7;

// Packet status word (offset word after completion).
pub const PSW_CC_SHIFT: u32 = 12;
pub const PSW_CC_MASK: u32 = 0xf;
pub const PSW_SIZE_MASK: u32 = 0x7ff;

pub const PAGE_MASK: u32 = 0xffff_f000;
pub const OFFSET_MASK: u32 = 0x0fff;

/// Isochronous transfer descriptor (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoTd {
    pub flags: u32,
    pub bp: u32,
    pub next: u32,
    pub be: u32,
    pub offset: [u16; 8],
}

impl IsoTd {
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> GuestMemoryResult<Self> {
        let words = read_dwords::<8>(mem, addr)?;
        let mut offset = [0u16; 8];
        for (i, pair) in words[4..].iter().enumerate() {
            offset[i * 2] = *pair as u16;
            offset[i * 2 + 1] = (*pair >> 16) as u16;
        }
        Ok(Self {
            flags: words[0],
            bp: words[1],
            next: words[2],
            be: words[3],
            offset,
        })
    }

    pub fn write(&self, mem: &mut dyn GuestMemory, addr: u32) -> GuestMemoryResult<()> {
        let mut words = [self.flags, self.bp, self.next, self.be, 0, 0, 0, 0];
        for (i, pair) in self.offset.chunks_exact(2).enumerate() {
            words[4 + i] = u32::from(pair[0]) | u32::from(pair[1]) << 16;
        }
        write_dwords(mem, addr, &words)
    }

    pub fn starting_frame(&self) -> u16 {
        (self.flags & ISO_TD_SF_MASK) as u16
    }

    /// Index of the last packet (FrameCount - 1).
    pub fn frame_count(&self) -> u16 {
        ((self.flags >> ISO_TD_FC_SHIFT) & ISO_TD_FC_MASK) as u16
    }

    pub fn delay_interrupt(&self) -> u8 {
        ((self.flags >> TD_DI_SHIFT) & TD_DI_MASK) as u8
    }

    pub fn condition_code(&self) -> u32 {
        (self.flags >> TD_CC_SHIFT) & TD_CC_MASK
    }

    pub fn set_condition_code(&mut self, cc: u32) {
        set_field(&mut self.flags, TD_CC_SHIFT, TD_CC_MASK, cc);
    }

    pub fn psw_condition_code(&self, idx: usize) -> u32 {
        (u32::from(self.offset[idx]) >> PSW_CC_SHIFT) & PSW_CC_MASK
    }

    /// Overwrites packet `idx`'s offset with a completed packet status word.
    pub fn set_psw(&mut self, idx: usize, cc: u32, size: u32) {
        self.offset[idx] =
            (((cc & PSW_CC_MASK) << PSW_CC_SHIFT) | (size & PSW_SIZE_MASK)) as u16;
    }
}

fn set_field(word: &mut u32, shift: u32, mask: u32, value: u32) {
    *word = (*word & !(mask << shift)) | ((value & mask) << shift);
}
