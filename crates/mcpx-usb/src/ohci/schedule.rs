//! Endpoint descriptor list walking and transfer descriptor service.
//!
//! Everything here reads guest-controlled structures. Malformed lists (link cycles, buffers that
//! run backwards, descriptors outside guest memory) are unrecoverable errors that stop the
//! controller rather than being silently skipped.

use std::rc::Rc;

use memory::{GuestMemory, GuestMemoryResult};
use tracing::{trace, warn};

use super::descriptor::*;
use super::regs::*;
use super::OhciController;
use crate::endpoint::EndpointKey;
use crate::packet::{cancel_packet, handle_packet, UsbPacket, UsbPid, UsbStatus};
use crate::port::{self, UsbDeviceHandle};

/// Largest transfer a single TD can describe (two 4KiB pages).
const MAX_TRANSFER_LEN: usize = 8192;

/// Outcome of handing a packet to a device: bytes transferred, or the failure status.
type TransferResult = Result<usize, UsbStatus>;

fn transfer_result(p: &UsbPacket) -> TransferResult {
    match p.status {
        UsbStatus::Success => Ok(p.actual_length),
        status => Err(status),
    }
}

/// Length of a buffer that starts at `start` and ends (inclusive) at `end`, possibly crossing into
/// the page that holds `end`.
fn buffer_len(start: u32, end: u32) -> usize {
    let len = if start & PAGE_MASK != end & PAGE_MASK {
        (end & OFFSET_MASK) + 0x1001 - (start & OFFSET_MASK)
    } else {
        end.wrapping_sub(start).wrapping_add(1)
    };
    (len as usize).min(MAX_TRANSFER_LEN)
}

/// Reads `buf.len()` bytes starting at `start`; bytes past the end of the first page come from the
/// page holding `end`.
fn read_two_pages(
    mem: &dyn GuestMemory,
    start: u32,
    end: u32,
    buf: &mut [u8],
) -> GuestMemoryResult<()> {
    let first = (0x1000 - (start & OFFSET_MASK) as usize).min(buf.len());
    mem.read_into(u64::from(start), &mut buf[..first])?;
    if first == buf.len() {
        return Ok(());
    }
    mem.read_into(u64::from(end & PAGE_MASK), &mut buf[first..])
}

fn write_two_pages(
    mem: &mut dyn GuestMemory,
    start: u32,
    end: u32,
    buf: &[u8],
) -> GuestMemoryResult<()> {
    let first = (0x1000 - (start & OFFSET_MASK) as usize).min(buf.len());
    mem.write_from(u64::from(start), &buf[..first])?;
    if first == buf.len() {
        return Ok(());
    }
    mem.write_from(u64::from(end & PAGE_MASK), &buf[first..])
}

fn token_for_direction(dir: u32) -> Option<UsbPid> {
    match dir {
        DIR_SETUP => Some(UsbPid::Setup),
        DIR_OUT => Some(UsbPid::Out),
        DIR_IN => Some(UsbPid::In),
        _ => None,
    }
}

impl OhciController {
    pub(super) fn process_lists(&mut self, mem: &mut dyn GuestMemory) {
        if self.ctl & CTL_CLE != 0 && self.status & STATUS_CLF != 0 {
            if self.ctrl_cur != 0 && self.ctrl_cur != self.ctrl_head {
                trace!(
                    cur = format_args!("{:#x}", self.ctrl_cur),
                    "control list resumes mid-list"
                );
            }
            if !self.service_ed_list(mem, self.ctrl_head) {
                self.ctrl_cur = 0;
                self.status &= !STATUS_CLF;
            }
        }

        if self.ctl & CTL_BLE != 0 && self.status & STATUS_BLF != 0 {
            if !self.service_ed_list(mem, self.bulk_head) {
                self.bulk_cur = 0;
                self.status &= !STATUS_BLF;
            }
        }
    }

    /// Walks one ED list. Returns whether any ED had TDs queued.
    pub(super) fn service_ed_list(&mut self, mem: &mut dyn GuestMemory, head: u32) -> bool {
        let mut active = false;
        let mut links = 0usize;
        let mut cur = head & DPTR_MASK;

        while cur != 0 {
            links += 1;
            if links > self.config.ed_link_limit {
                self.die("endpoint descriptor list too long or cyclic");
                return false;
            }

            let mut ed = match Ed::read(mem, cur) {
                Ok(ed) => ed,
                Err(err) => {
                    warn!(%err, ed = format_args!("{cur:#x}"), "ED read failed");
                    self.die("ED read failed");
                    return false;
                }
            };
            let next = ed.next & DPTR_MASK;

            if ed.is_halted() || ed.is_skipped() {
                // A paused endpoint gives up its in-flight packet.
                if self.async_td != 0 && ed.head_ptr() == self.async_td {
                    self.stop_async_endpoint();
                }
                cur = next;
                continue;
            }

            let mut tds = 0usize;
            let mut last_td = None;
            while ed.head_ptr() != ed.tail_ptr() {
                // Partial OUT service leaves the same TD at the head; only new TDs count as links.
                if last_td != Some(ed.head_ptr()) {
                    last_td = Some(ed.head_ptr());
                    tds += 1;
                    if tds > self.config.td_link_limit {
                        self.die("transfer descriptor list too long or cyclic");
                        return false;
                    }
                }
                active = true;
                let stop = if ed.is_iso() {
                    self.service_iso_td(mem, &mut ed)
                } else {
                    self.service_td(mem, &mut ed)
                };
                if stop {
                    break;
                }
            }

            if let Err(err) = ed.write_head(mem, cur) {
                warn!(%err, ed = format_args!("{cur:#x}"), "ED writeback failed");
                self.die("ED writeback failed");
                return false;
            }
            cur = next;
        }

        active
    }

    /// Cancels the pending packet because its endpoint was halted or skipped.
    fn stop_async_endpoint(&mut self) {
        let key = self.packet.endpoint();
        let dev = self.async_device.take().and_then(|weak| weak.upgrade());
        match dev {
            Some(dev) if self.packet.state().is_in_flight() => {
                let mut dev = dev.borrow_mut();
                cancel_packet(&mut *dev, &mut self.packet);
                dev.endpoint_stopped(key);
            }
            _ => self.packet = UsbPacket::new(),
        }
        self.async_td = 0;
        self.async_complete = false;
    }

    fn find_device(&self, addr: u8) -> Option<UsbDeviceHandle> {
        self.ports
            .iter()
            .filter(|p| p.ctrl & PORT_PES != 0)
            .find_map(|p| port::find_device(&p.port, addr))
    }

    /// Moves a finished TD from the ED onto the controller's done queue.
    fn retire(&mut self, ed: &mut Ed, td_next: &mut u32, addr: u32, delay_interrupt: u8) {
        ed.set_head_ptr(*td_next);
        *td_next = self.done;
        self.done = addr;
        self.done_count = self.done_count.min(delay_interrupt);
    }

    /// Services the general TD at the head of `ed`. Returns `true` when processing of this ED must
    /// stop for the current frame.
    fn service_td(&mut self, mem: &mut dyn GuestMemory, ed: &mut Ed) -> bool {
        let addr = ed.head_ptr();
        let completion = self.async_td != 0 && addr == self.async_td;
        if completion && !self.async_complete {
            trace!(td = format_args!("{addr:#x}"), "TD still in flight");
            return true;
        }

        let mut td = match Td::read(mem, addr) {
            Ok(td) => td,
            Err(err) => {
                warn!(%err, td = format_args!("{addr:#x}"), "TD read failed");
                self.die("TD read failed");
                return true;
            }
        };

        let dir = match ed.direction() {
            dir @ (DIR_OUT | DIR_IN) => dir,
            _ => td.direction(),
        };
        let Some(pid) = token_for_direction(dir) else {
            warn!(td = format_args!("{addr:#x}"), "bad TD direction");
            return true;
        };

        let mut out = Vec::new();
        let (len, pktlen) = if td.cbp != 0 && td.be != 0 {
            if td.cbp & PAGE_MASK == td.be & PAGE_MASK && td.cbp > td.be {
                self.die("TD buffer end precedes current buffer pointer");
                return true;
            }
            let len = buffer_len(td.cbp, td.be);
            let pktlen = if dir == DIR_IN {
                len
            } else {
                // OUT/SETUP data goes out at most one max-packet at a time.
                let pktlen = ed.max_packet_size().min(len);
                if pktlen == 0 {
                    self.die("OUT TD with data on a zero max-packet endpoint");
                    return true;
                }
                if !completion {
                    out.resize(pktlen, 0);
                    if let Err(err) = read_two_pages(mem, td.cbp, td.be, &mut out) {
                        warn!(%err, td = format_args!("{addr:#x}"), "TD buffer read failed");
                        self.die("TD buffer read failed");
                        return true;
                    }
                }
                pktlen
            };
            (len, pktlen)
        } else {
            (0, 0)
        };

        let flag_r = td.buffer_rounding();

        if completion {
            self.async_td = 0;
            self.async_complete = false;
            self.async_device = None;
        } else {
            let Some(dev) = self.find_device(ed.function_address()) else {
                trace!(addr = ed.function_address(), "no device at address");
                return true;
            };
            if self.async_td != 0 {
                // Only one packet may be in flight at a time.
                trace!(td = format_args!("{addr:#x}"), "TD deferred behind pending packet");
                return true;
            }

            let key = EndpointKey::new(pid, ed.endpoint_number());
            self.packet.setup(
                pid,
                key,
                0,
                u64::from(addr),
                flag_r,
                td.delay_interrupt() == 0,
            );
            if dir == DIR_IN {
                self.packet.append_zeroed(pktlen);
            } else {
                self.packet.append_buffer(&out);
            }

            let mut d = dev.borrow_mut();
            handle_packet(Some(&mut *d), &mut self.packet);
            if self.packet.status == UsbStatus::Async {
                d.flush_endpoint_queue(key);
                drop(d);
                self.async_td = addr;
                self.async_device = Some(Rc::downgrade(&dev));
                return true;
            }
        }

        let result = transfer_result(&self.packet);

        if let Ok(n) = result {
            if dir == DIR_IN {
                let data = &self.packet.transferred()[..n];
                if let Err(err) = write_two_pages(mem, td.cbp, td.be, data) {
                    warn!(%err, td = format_args!("{addr:#x}"), "TD buffer write failed");
                    self.die("TD buffer write failed");
                    return true;
                }
            }
        }

        match result {
            Ok(n) if n == pktlen || (dir == DIR_IN && flag_r) => {
                if n == len {
                    td.cbp = 0;
                } else if (td.cbp & OFFSET_MASK) as usize + n > OFFSET_MASK as usize {
                    td.cbp = (td.be & PAGE_MASK) + (td.cbp.wrapping_add(n as u32) & OFFSET_MASK);
                } else {
                    td.cbp += n as u32;
                }
                td.flags |= TD_T1;
                td.flags ^= TD_T0;
                td.set_condition_code(CC_NOERROR);
                td.set_error_count(0);

                if dir != DIR_IN && n != len {
                    // More OUT data left in this TD; send the next packet before retiring it.
                    return self.put_td(mem, addr, &td);
                }

                ed.set_toggle_carry(td.flags & TD_T0 != 0);
            }
            result => {
                let cc = match result {
                    Ok(_) => CC_DATAUNDERRUN,
                    Err(UsbStatus::IoError | UsbStatus::NoDev) => CC_DEVICENOTRESPONDING,
                    Err(UsbStatus::Nak) => {
                        trace!(td = format_args!("{addr:#x}"), "TD NAKed");
                        return true;
                    }
                    Err(UsbStatus::Stall) => CC_STALL,
                    Err(UsbStatus::Babble) => CC_DATAOVERRUN,
                    Err(_) => CC_UNEXPECTEDPID,
                };
                trace!(td = format_args!("{addr:#x}"), cc, "TD completed with error");
                td.set_condition_code(cc);
                td.set_error_count(3);
                if result.is_err() {
                    // Errors flush the done queue at the next frame boundary.
                    self.done_count = 0;
                }
                ed.head |= ED_H;
            }
        }

        let di = td.delay_interrupt();
        self.retire(ed, &mut td.next, addr, di);
        self.put_td(mem, addr, &td)
    }

    /// Writes `td` back and reports whether list processing should stop (it failed).
    fn put_td(&mut self, mem: &mut dyn GuestMemory, addr: u32, td: &Td) -> bool {
        if let Err(err) = td.write(mem, addr) {
            warn!(%err, td = format_args!("{addr:#x}"), "TD writeback failed");
            self.die("TD writeback failed");
            return true;
        }
        td.condition_code() != CC_NOERROR
    }

    /// Services the isochronous TD at the head of `ed` for the current frame.
    fn service_iso_td(&mut self, mem: &mut dyn GuestMemory, ed: &mut Ed) -> bool {
        let addr = ed.head_ptr();
        if addr == 0 {
            self.die("isochronous TD at address 0");
            return true;
        }
        let mut td = match IsoTd::read(mem, addr) {
            Ok(td) => td,
            Err(err) => {
                warn!(%err, td = format_args!("{addr:#x}"), "iso TD read failed");
                self.die("iso TD read failed");
                return true;
            }
        };

        let frame_count = td.frame_count();
        let rel = self.frame_number.wrapping_sub(td.starting_frame()) as i16;
        if rel < 0 {
            // Not due yet.
            return true;
        }
        let rel = rel as u16;

        if rel > frame_count {
            // The guest queued it too late; every packet window has passed.
            if td.condition_code() == CC_DATAOVERRUN {
                return true;
            }
            td.set_condition_code(CC_DATAOVERRUN);
            let di = td.delay_interrupt();
            self.retire(ed, &mut td.next, addr, di);
            if let Err(err) = td.write(mem, addr) {
                warn!(%err, td = format_args!("{addr:#x}"), "iso TD writeback failed");
                self.die("iso TD writeback failed");
                return true;
            }
            return false;
        }

        let dir = ed.direction();
        let Some(pid) = token_for_direction(dir) else {
            warn!(td = format_args!("{addr:#x}"), "bad iso TD direction");
            return true;
        };

        if td.bp == 0 || td.be == 0 {
            trace!(td = format_args!("{addr:#x}"), "iso TD without a buffer");
            return true;
        }

        let idx = usize::from(rel);
        let last = rel == frame_count;
        let start_offset = u32::from(td.offset[idx]);
        let next_offset = if last {
            td.be
        } else {
            u32::from(td.offset[idx + 1])
        };

        // Unprocessed offsets carry a NotAccessed (0b111x) condition code.
        if td.psw_condition_code(idx) & 0xe == 0
            || (!last && td.psw_condition_code(idx + 1) & 0xe == 0)
        {
            trace!(td = format_args!("{addr:#x}"), "iso TD offset already processed");
            return true;
        }
        if !last && start_offset > next_offset {
            trace!(td = format_args!("{addr:#x}"), "iso TD offsets out of order");
            return true;
        }

        let page_of = |offset: u32| {
            let base = if offset & 0x1000 == 0 { td.bp } else { td.be };
            (base & PAGE_MASK) | (offset & OFFSET_MASK)
        };
        let start_addr = page_of(start_offset);
        let end_addr = if last {
            next_offset
        } else {
            page_of(next_offset.wrapping_sub(1))
        };
        if start_addr > end_addr {
            trace!(td = format_args!("{addr:#x}"), "iso packet buffer runs backwards");
            return true;
        }

        let len = buffer_len(start_addr, end_addr);
        let mut packet = UsbPacket::new();
        let key = EndpointKey::new(pid, ed.endpoint_number());
        packet.setup(
            pid,
            key,
            0,
            u64::from(addr),
            false,
            last && td.delay_interrupt() == 0,
        );
        if dir == DIR_IN {
            packet.append_zeroed(len);
        } else if len > 0 {
            let mut out = vec![0u8; len];
            if let Err(err) = read_two_pages(mem, start_addr, end_addr, &mut out) {
                warn!(%err, td = format_args!("{addr:#x}"), "iso buffer read failed");
                self.die("iso buffer read failed");
                return true;
            }
            packet.append_buffer(&out);
        }

        let Some(dev) = self.find_device(ed.function_address()) else {
            trace!(addr = ed.function_address(), "no device at address");
            return true;
        };
        {
            let mut d = dev.borrow_mut();
            handle_packet(Some(&mut *d), &mut packet);
            if packet.status == UsbStatus::Async {
                d.flush_endpoint_queue(key);
                return true;
            }
        }

        match transfer_result(&packet) {
            Ok(n) if dir == DIR_IN && n <= len => {
                if let Err(err) = write_two_pages(mem, start_addr, end_addr, packet.transferred())
                {
                    warn!(%err, td = format_args!("{addr:#x}"), "iso buffer write failed");
                    self.die("iso buffer write failed");
                    return true;
                }
                td.set_psw(idx, CC_NOERROR, n as u32);
            }
            Ok(n) if dir == DIR_OUT && n == len => td.set_psw(idx, CC_NOERROR, 0),
            Ok(n) if n > len => td.set_psw(idx, CC_DATAOVERRUN, len as u32),
            Ok(n) => td.set_psw(idx, CC_DATAUNDERRUN, n as u32),
            Err(UsbStatus::IoError | UsbStatus::NoDev) => {
                td.set_psw(idx, CC_DEVICENOTRESPONDING, 0)
            }
            Err(UsbStatus::Nak | UsbStatus::Stall) => td.set_psw(idx, CC_STALL, 0),
            Err(status) => {
                trace!(?status, "iso packet failed");
                td.set_psw(idx, CC_UNEXPECTEDPID, 0);
            }
        }

        if last {
            td.set_condition_code(CC_NOERROR);
            let di = td.delay_interrupt();
            self.retire(ed, &mut td.next, addr, di);
        }
        if let Err(err) = td.write(mem, addr) {
            warn!(%err, td = format_args!("{addr:#x}"), "iso TD writeback failed");
            self.die("iso TD writeback failed");
        }
        true
    }
}
