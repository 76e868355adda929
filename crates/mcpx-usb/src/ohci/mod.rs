//! OHCI (USB 1.1) host controller model.
//!
//! The controller owns the operational register file and the root hub, and walks the guest's
//! endpoint descriptor lists once per 1ms frame. Frames are driven by [`OhciController::poll`],
//! which runs every frame boundary that has elapsed on the host clock.
//!
//! Only one general TD can be pending asynchronously at a time; while it is outstanding the list
//! walk stops at that TD and picks up again once [`OhciController::complete_async_packet`] delivers
//! the result.

pub mod descriptor;
mod hub;
pub mod regs;
mod schedule;

use std::cell::RefCell;
use std::rc::Weak;
use std::sync::Arc;

use mcpx_time::{FrameTimer, HostClock};
use memory::{GuestMemory, MmioHandler};
use tracing::{debug, error, trace, warn};

use crate::device::{UsbDevice, DATA_BUF_SIZE};
use crate::packet::{cancel_packet, complete_packet, PacketState, UsbPacket, UsbPid, UsbStatus};

use descriptor::Hcca;
use hub::OhciPort;
use regs::*;

/// Highest port count HcRhDescriptorA.NDP can report for this model.
pub const MAX_PORTS: usize = 15;

#[derive(Debug, Clone)]
pub struct OhciConfig {
    pub num_ports: usize,
    /// Speeds accepted on every root-hub port (see [`crate::UsbSpeed::mask`]).
    pub port_speed_mask: u8,
    pub frame_ns: u64,
    pub bit_time_ns: u64,
    /// Endpoint descriptors visited per list before the list is declared corrupt.
    pub ed_link_limit: usize,
    /// Distinct transfer descriptors visited per endpoint descriptor per frame before the TD list
    /// is declared corrupt.
    pub td_link_limit: usize,
    /// Upper bound on frames caught up by a single [`OhciController::poll`].
    pub max_frames_per_poll: u32,
}

impl Default for OhciConfig {
    fn default() -> Self {
        Self {
            num_ports: 2,
            port_speed_mask: 0x3,
            frame_ns: 1_000_000,
            bit_time_ns: 83,
            ed_link_limit: 32,
            td_link_limit: 4096,
            max_frames_per_poll: 16,
        }
    }
}

pub struct OhciController {
    config: OhciConfig,
    clock: Arc<dyn HostClock>,
    timer: FrameTimer,

    ctl: u32,
    old_ctl: u32,
    status: u32,
    intr_status: u32,
    intr: u32,

    hcca: u32,
    per_cur: u32,
    ctrl_head: u32,
    ctrl_cur: u32,
    bulk_head: u32,
    bulk_cur: u32,
    done: u32,
    done_count: u8,

    fsmps: u16,
    fit: bool,
    fi: u16,
    frt: bool,
    frame_number: u16,
    pstart: u16,
    lst: u16,

    rhdesc_a: u32,
    rhdesc_b: u32,
    rhstatus: u32,
    ports: Vec<OhciPort>,

    packet: UsbPacket,
    async_td: u32,
    async_complete: bool,
    async_device: Option<Weak<RefCell<dyn UsbDevice>>>,

    irq_level: bool,
    detected_parity: bool,
}

impl OhciController {
    /// # Panics
    ///
    /// Panics if `config.num_ports` is zero or above [`MAX_PORTS`], or if the frame length is zero.
    pub fn new(config: OhciConfig, clock: Arc<dyn HostClock>) -> Self {
        assert!(
            (1..=MAX_PORTS).contains(&config.num_ports),
            "OHCI root hub supports 1..={MAX_PORTS} ports, got {}",
            config.num_ports
        );
        assert!(config.bit_time_ns > 0, "bit time must be non-zero");
        let ports = (0..config.num_ports)
            .map(|i| OhciPort::new(i, config.port_speed_mask))
            .collect();
        let mut ohci = Self {
            timer: FrameTimer::new(config.frame_ns),
            config,
            clock,
            ctl: 0,
            old_ctl: 0,
            status: 0,
            intr_status: 0,
            intr: 0,
            hcca: 0,
            per_cur: 0,
            ctrl_head: 0,
            ctrl_cur: 0,
            bulk_head: 0,
            bulk_cur: 0,
            done: 0,
            done_count: DONE_COUNT_IDLE,
            fsmps: FSMPS_DEFAULT,
            fit: false,
            fi: FI_DEFAULT,
            frt: false,
            frame_number: 0,
            pstart: 0,
            lst: LS_THRESHOLD_DEFAULT,
            rhdesc_a: 0,
            rhdesc_b: 0,
            rhstatus: 0,
            ports,
            packet: UsbPacket::new(),
            async_td: 0,
            async_complete: false,
            async_device: None,
            irq_level: false,
            detected_parity: false,
        };
        ohci.hard_reset();
        ohci
    }

    pub fn config(&self) -> &OhciConfig {
        &self.config
    }

    pub fn irq_level(&self) -> bool {
        self.irq_level
    }

    /// PCI status bits raised since the last call (currently only "detected parity error", which
    /// reports an unrecoverable controller error).
    pub fn take_pci_status_bits(&mut self) -> u16 {
        if std::mem::take(&mut self.detected_parity) {
            PCI_STATUS_DETECTED_PARITY_ERROR
        } else {
            0
        }
    }

    pub fn frame_number(&self) -> u16 {
        self.frame_number
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn port_status(&self, port: usize) -> Option<u32> {
        self.ports.get(port).map(|p| p.ctrl)
    }

    /// Whether the frame timer is armed (the controller is operational and has not died).
    pub fn is_running(&self) -> bool {
        self.timer.is_armed()
    }

    /// Correlation id of the TD whose packet is pending asynchronously, if any.
    pub fn pending_async_td(&self) -> Option<u32> {
        (self.async_td != 0).then_some(self.async_td)
    }

    pub fn read_register(&mut self, addr: u64) -> u32 {
        if addr & 3 != 0 {
            warn!(addr = format_args!("{addr:#x}"), "unaligned OHCI register read");
            return 0xffff_ffff;
        }

        match addr {
            REG_REVISION => OHCI_REVISION,
            REG_CONTROL => self.ctl,
            REG_COMMAND_STATUS => self.status,
            REG_INTERRUPT_STATUS => self.intr_status,
            REG_INTERRUPT_ENABLE | REG_INTERRUPT_DISABLE => self.intr,
            REG_HCCA => self.hcca,
            REG_PERIOD_CURRENT_ED => self.per_cur,
            REG_CONTROL_HEAD_ED => self.ctrl_head,
            REG_CONTROL_CURRENT_ED => self.ctrl_cur,
            REG_BULK_HEAD_ED => self.bulk_head,
            REG_BULK_CURRENT_ED => self.bulk_cur,
            REG_DONE_HEAD => self.done,
            REG_FM_INTERVAL => {
                (u32::from(self.fit) << 31) | (u32::from(self.fsmps) << 16) | u32::from(self.fi)
            }
            REG_FM_REMAINING => self.frame_remaining(),
            REG_FM_NUMBER => u32::from(self.frame_number),
            REG_PERIODIC_START => u32::from(self.pstart),
            REG_LS_THRESHOLD => u32::from(self.lst),
            REG_RH_DESCRIPTOR_A => self.rhdesc_a,
            REG_RH_DESCRIPTOR_B => self.rhdesc_b,
            REG_RH_STATUS => self.rhstatus,
            _ => match self.port_index(addr) {
                Some(port) => self.ports[port].ctrl,
                None => {
                    warn!(addr = format_args!("{addr:#x}"), "read of unknown OHCI register");
                    0xffff_ffff
                }
            },
        }
    }

    pub fn write_register(&mut self, addr: u64, val: u32) {
        if addr & 3 != 0 {
            warn!(addr = format_args!("{addr:#x}"), "unaligned OHCI register write");
            return;
        }

        match addr {
            REG_REVISION => {}
            REG_CONTROL => self.set_control(val),
            REG_COMMAND_STATUS => {
                let val = val & !STATUS_SOC;
                self.status |= val;
                if self.status & STATUS_HCR != 0 {
                    self.soft_reset();
                }
            }
            REG_INTERRUPT_STATUS => {
                self.intr_status &= !val;
                self.update_irq();
            }
            REG_INTERRUPT_ENABLE => {
                self.intr |= val;
                self.update_irq();
            }
            REG_INTERRUPT_DISABLE => {
                self.intr &= !val;
                self.update_irq();
            }
            REG_HCCA => self.hcca = val & HCCA_WRITE_MASK,
            REG_PERIOD_CURRENT_ED | REG_DONE_HEAD | REG_FM_REMAINING | REG_FM_NUMBER => {
                trace!(addr = format_args!("{addr:#x}"), "write to read-only OHCI register");
            }
            REG_CONTROL_HEAD_ED => self.ctrl_head = val & DPTR_MASK,
            REG_CONTROL_CURRENT_ED => self.ctrl_cur = val & DPTR_MASK,
            REG_BULK_HEAD_ED => self.bulk_head = val & DPTR_MASK,
            REG_BULK_CURRENT_ED => self.bulk_cur = val & DPTR_MASK,
            REG_FM_INTERVAL => {
                if (val & FMI_FI) as u16 != self.fi {
                    debug!(fi = val & FMI_FI, "frame interval changed");
                }
                self.fsmps = ((val & FMI_FSMPS) >> 16) as u16;
                self.fit = val & FMI_FIT != 0;
                self.fi = (val & FMI_FI) as u16;
            }
            REG_PERIODIC_START => self.pstart = val as u16,
            REG_LS_THRESHOLD => self.lst = val as u16,
            REG_RH_DESCRIPTOR_A => {
                self.rhdesc_a = (self.rhdesc_a & !RHA_RW_MASK) | (val & RHA_RW_MASK);
            }
            REG_RH_DESCRIPTOR_B => {}
            REG_RH_STATUS => self.set_hub_status(val),
            _ => match self.port_index(addr) {
                Some(port) => self.port_set_status(port, val),
                None => {
                    warn!(
                        addr = format_args!("{addr:#x}"),
                        val = format_args!("{val:#x}"),
                        "write to unknown OHCI register"
                    );
                }
            },
        }
    }

    fn port_index(&self, addr: u64) -> Option<usize> {
        let rel = addr.checked_sub(REG_RH_PORT_STATUS_BASE)?;
        let port = usize::try_from(rel / 4).ok()?;
        (port < self.ports.len()).then_some(port)
    }

    /// HcFmRemaining: bit times left in the current frame, derived from the host clock.
    fn frame_remaining(&self) -> u32 {
        let toggle = u32::from(self.frt) << 31;
        if self.ctl & CTL_HCFS != USB_OPERATIONAL {
            return toggle;
        }
        let elapsed = self.clock.now_ns().saturating_sub(self.timer.sof_ns());
        if elapsed >= self.config.frame_ns {
            return toggle;
        }
        let bits = elapsed / self.config.bit_time_ns;
        let remaining = u64::from(self.fi).saturating_sub(bits) as u32;
        toggle | (remaining & FMI_FI)
    }

    fn set_control(&mut self, val: u32) {
        let old_state = self.ctl & CTL_HCFS;
        self.ctl = val;
        let new_state = self.ctl & CTL_HCFS;
        if old_state == new_state {
            return;
        }

        match new_state {
            USB_OPERATIONAL => self.bus_start(),
            USB_SUSPEND => {
                self.bus_stop();
                // A pending SOF would fire right after resume otherwise.
                self.intr_status &= !INTR_SF;
                self.update_irq();
                debug!("OHCI suspended");
            }
            USB_RESUME => debug!("OHCI resuming"),
            _ => {
                debug!("OHCI entered reset state");
                self.root_hub_reset();
            }
        }
    }

    fn bus_start(&mut self) {
        let now = self.clock.now_ns();
        debug!(now_ns = now, "OHCI operational, starting frame timer");
        self.timer.start(now);
    }

    fn bus_stop(&mut self) {
        self.timer.cancel();
    }

    /// Host controller reset (HcCommandStatus.HCR): registers return to their defaults and the
    /// controller enters the suspend state. Root-hub state is preserved.
    pub fn soft_reset(&mut self) {
        self.bus_stop();
        self.ctl = (self.ctl & CTL_IR) | USB_SUSPEND;
        self.old_ctl = 0;
        self.status = 0;
        self.intr_status = 0;
        self.intr = INTR_MIE;

        self.hcca = 0;
        self.ctrl_head = 0;
        self.ctrl_cur = 0;
        self.bulk_head = 0;
        self.bulk_cur = 0;
        self.per_cur = 0;
        self.done = 0;
        self.done_count = DONE_COUNT_IDLE;

        self.fsmps = FSMPS_DEFAULT;
        self.fit = false;
        self.fi = FI_DEFAULT;
        self.frt = false;
        self.frame_number = 0;
        self.pstart = 0;
        self.lst = LS_THRESHOLD_DEFAULT;

        self.update_irq();
        debug!("OHCI soft reset");
    }

    /// Power-on / PCI reset: soft reset followed by a full root-hub reset.
    pub fn hard_reset(&mut self) {
        self.soft_reset();
        self.ctl = 0;
        self.root_hub_reset();
    }

    fn set_interrupt(&mut self, bits: u32) {
        self.intr_status |= bits;
        self.update_irq();
    }

    fn update_irq(&mut self) {
        self.irq_level = self.intr & INTR_MIE != 0 && self.intr_status & self.intr != 0;
    }

    /// Unrecoverable error: the controller stops processing until the guest resets it.
    fn die(&mut self, reason: &str) {
        error!(reason, "OHCI unrecoverable error");
        self.set_interrupt(INTR_UE);
        self.bus_stop();
        self.detected_parity = true;
    }

    /// Runs every frame boundary that has elapsed on the host clock and returns how many ran.
    ///
    /// At most `max_frames_per_poll` frames are caught up per call; any remaining backlog is
    /// dropped and the frame timer restarts from the current time.
    pub fn poll(&mut self, mem: &mut dyn GuestMemory) -> u32 {
        let now = self.clock.now_ns();
        let mut frames = 0;
        while frames < self.config.max_frames_per_poll && self.timer.is_due(now) {
            let before = self.timer.deadline_ns();
            self.run_frame(mem);
            frames += 1;
            if self.timer.deadline_ns() == before {
                break;
            }
        }
        if self.timer.is_due(now) {
            warn!(
                backlog = self.timer.pending_frames(now),
                "OHCI frame backlog dropped, resynchronising frame timer"
            );
            self.timer.resync(now);
        }
        frames
    }

    /// Processes one frame boundary: periodic list, control and bulk lists, frame counter, done
    /// queue writeback and SOF.
    pub fn run_frame(&mut self, mem: &mut dyn GuestMemory) {
        let mut hcca = match Hcca::read(mem, self.hcca) {
            Ok(hcca) => hcca,
            Err(err) => {
                error!(%err, "HCCA read failed");
                self.die("HCCA read failed");
                return;
            }
        };

        if self.ctl & CTL_PLE != 0 {
            let head = hcca.intr[usize::from(self.frame_number & 0x1f)];
            self.service_ed_list(mem, head);
        }

        // Lists just disabled by the guest: drop whatever was in flight on them.
        if self.old_ctl & !self.ctl & (CTL_BLE | CTL_CLE) != 0 {
            self.cancel_async();
            self.stop_endpoints();
        }
        self.old_ctl = self.ctl;
        self.process_lists(mem);

        if self.intr_status & INTR_UE != 0 {
            return;
        }

        self.frt = self.fit;
        self.frame_number = self.frame_number.wrapping_add(1);
        hcca.frame = self.frame_number;
        hcca.pad = 0;

        if self.done_count == 0 && self.intr_status & INTR_WD == 0 {
            if self.done == 0 {
                warn!("done queue writeback requested with an empty done queue");
                self.done_count = DONE_COUNT_IDLE;
            } else {
                if self.intr & self.intr_status != 0 {
                    self.done |= 1;
                }
                hcca.done = self.done;
                self.done = 0;
                self.done_count = DONE_COUNT_IDLE;
                self.set_interrupt(INTR_WD);
            }
        }
        if self.done_count != DONE_COUNT_IDLE && self.done_count != 0 {
            self.done_count -= 1;
        }

        self.timer.advance();
        self.set_interrupt(INTR_SF);

        if let Err(err) = hcca.write_back(mem, self.hcca) {
            error!(%err, "HCCA writeback failed");
            self.die("HCCA writeback failed");
        }
    }

    /// Cancels the pending asynchronous packet, if any.
    fn cancel_async(&mut self) {
        if self.async_td == 0 {
            return;
        }
        trace!(td = format_args!("{:#x}", self.async_td), "canceling pending TD");
        match self.async_device.take().and_then(|weak| weak.upgrade()) {
            Some(dev) if self.packet.state().is_in_flight() => {
                cancel_packet(&mut *dev.borrow_mut(), &mut self.packet);
            }
            // The device went away with the packet still pending.
            _ => self.packet = UsbPacket::new(),
        }
        self.async_td = 0;
        self.async_complete = false;
    }

    fn stop_endpoints(&mut self) {
        for port in &self.ports {
            let Some(dev) = port.port.device() else {
                continue;
            };
            let mut dev = dev.borrow_mut();
            if !dev.state().attached {
                continue;
            }
            let keys: Vec<_> = dev.state().endpoints().map(|ep| ep.key()).collect();
            for key in keys {
                dev.endpoint_stopped(key);
            }
        }
    }

    /// Delivers the result of the pending asynchronous TD and reprocesses the control and bulk
    /// lists so it retires immediately.
    ///
    /// `data` carries the bytes returned for an IN transfer, or the response of a control request
    /// the device finished late. Returns `false` (and does nothing) when `id` does not name the
    /// pending TD.
    ///
    /// # Panics
    ///
    /// Panics if `status` still reports the transfer as pending.
    pub fn complete_async_packet(
        &mut self,
        mem: &mut dyn GuestMemory,
        id: u64,
        status: UsbStatus,
        data: &[u8],
    ) -> bool {
        if self.async_td == 0
            || u64::from(self.async_td) != id
            || self.packet.state() != PacketState::Async
        {
            warn!(id = format_args!("{id:#x}"), "completion for a TD that is not pending");
            return false;
        }
        assert!(
            !matches!(
                status,
                UsbStatus::Async | UsbStatus::Nak | UsbStatus::AddToQueue | UsbStatus::RemoveFromQueue
            ),
            "async completion with pending status {status:?}"
        );
        let Some(dev) = self.async_device.as_ref().and_then(Weak::upgrade) else {
            warn!(id = format_args!("{id:#x}"), "async completion after device removal");
            self.cancel_async();
            return false;
        };

        {
            let mut dev = dev.borrow_mut();
            self.packet.status = status;
            if self.packet.endpoint().is_control() {
                let len = data.len().min(DATA_BUF_SIZE);
                dev.state_mut().data_buf_mut()[..len].copy_from_slice(&data[..len]);
                self.packet.actual_length = len;
            } else if status == UsbStatus::Success {
                if self.packet.pid() == UsbPid::In {
                    let len = data.len().min(self.packet.remaining());
                    self.packet.copy_from_device(&data[..len]);
                } else {
                    self.packet.actual_length = self.packet.size();
                }
            }
            complete_packet(&mut *dev, &mut self.packet);
        }

        self.async_complete = true;
        self.process_lists(mem);
        true
    }
}

impl MmioHandler for OhciController {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        if size != 4 {
            warn!(offset = format_args!("{offset:#x}"), size, "non-dword OHCI MMIO read");
            return all_ones(size);
        }
        u64::from(self.read_register(offset))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        if size != 4 {
            warn!(offset = format_args!("{offset:#x}"), size, "non-dword OHCI MMIO write ignored");
            return;
        }
        self.write_register(offset, value as u32);
    }
}

fn all_ones(size: usize) -> u64 {
    match size {
        0 => 0,
        1..=7 => (1u64 << (size * 8)) - 1,
        _ => u64::MAX,
    }
}
