#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use mcpx_time::FakeHostClock;
use mcpx_usb::device::{DEVICE_OUT_REQUEST, DEVICE_REQUEST, REQ_GET_DESCRIPTOR, REQ_SET_ADDRESS};
use mcpx_usb::ohci::descriptor::{
    ED_D_SHIFT, ED_EN_SHIFT, ED_F, ED_MPS_SHIFT, ISO_TD_FC_SHIFT, TD_CC_SHIFT, TD_DI_SHIFT,
    TD_DP_SHIFT, TD_R,
};
use mcpx_usb::ohci::regs::*;
use mcpx_usb::{
    ControlRequest, DeviceState, OhciConfig, OhciController, TransferType, UsbDevice,
    UsbDeviceHandle, UsbDeviceState, UsbPacket, UsbPid, UsbSpeed, UsbStatus,
};
use memory::{DenseMemory, GuestMemory};

pub const MEM_SIZE: u64 = 0x2_0000;
pub const HCCA: u32 = 0x1000;
pub const FRAME_NS: u64 = 1_000_000;

pub const ED_DIR_TD: u32 = 0;
pub const ED_DIR_OUT: u32 = 1;
pub const ED_DIR_IN: u32 = 2;

pub const TD_DP_SETUP: u32 = 0;
pub const TD_DP_OUT: u32 = 1;
pub const TD_DP_IN: u32 = 2;

/// DelayInterrupt value meaning "no interrupt for this TD".
pub const TD_DI_NONE: u32 = 7;

/// A gamepad-style device descriptor (18 bytes).
pub const DEVICE_DESCRIPTOR: [u8; 18] = [
    0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x40, 0x5e, 0x04, 0x89, 0x02, 0x21, 0x01, 0x00, 0x00,
    0x00, 0x01,
];

pub fn ed_flags(fa: u8, en: u8, dir: u32, mps: u16) -> u32 {
    u32::from(fa) | (u32::from(en) << ED_EN_SHIFT) | (dir << ED_D_SHIFT) | (u32::from(mps) << ED_MPS_SHIFT)
}

pub fn iso_ed_flags(fa: u8, en: u8, dir: u32, mps: u16) -> u32 {
    ed_flags(fa, en, dir, mps) | ED_F
}

/// TD flags with CC = NotAccessed, the way a guest driver queues them.
pub fn td_flags(dp: u32, di: u32, rounding: bool) -> u32 {
    let mut flags = (dp << TD_DP_SHIFT) | (di << TD_DI_SHIFT) | (0xf << TD_CC_SHIFT);
    if rounding {
        flags |= TD_R;
    }
    flags
}

pub fn iso_td_flags(starting_frame: u16, frame_count: u32, di: u32) -> u32 {
    u32::from(starting_frame)
        | (di << TD_DI_SHIFT)
        | ((frame_count - 1) << ISO_TD_FC_SHIFT)
        | (0xf << TD_CC_SHIFT)
}

pub fn write_ed(mem: &mut DenseMemory, addr: u32, flags: u32, tail: u32, head: u32, next: u32) {
    for (i, word) in [flags, tail, head, next].into_iter().enumerate() {
        mem.write_u32_le(u64::from(addr) + i as u64 * 4, word).unwrap();
    }
}

pub fn write_td(mem: &mut DenseMemory, addr: u32, flags: u32, cbp: u32, next: u32, be: u32) {
    for (i, word) in [flags, cbp, next, be].into_iter().enumerate() {
        mem.write_u32_le(u64::from(addr) + i as u64 * 4, word).unwrap();
    }
}

/// General TD covering `len` bytes at `buf` (a zero-length TD when `len == 0`).
pub fn write_buffer_td(mem: &mut DenseMemory, addr: u32, flags: u32, buf: u32, len: u32, next: u32) {
    let (cbp, be) = if len == 0 { (0, 0) } else { (buf, buf + len - 1) };
    write_td(mem, addr, flags, cbp, next, be);
}

pub fn read_u32(mem: &DenseMemory, addr: u32) -> u32 {
    mem.read_u32_le(u64::from(addr)).unwrap()
}

pub fn td_cc(mem: &DenseMemory, td: u32) -> u32 {
    read_u32(mem, td) >> 28
}

pub fn ed_head(mem: &DenseMemory, ed: u32) -> u32 {
    read_u32(mem, ed + 8)
}

pub fn hcca_frame(mem: &DenseMemory) -> u16 {
    mem.read_u16_le(u64::from(HCCA) + 0x80).unwrap()
}

pub fn hcca_done(mem: &DenseMemory) -> u32 {
    read_u32(mem, HCCA + 0x84)
}

/// Routes controller logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub ohci: OhciController,
    pub mem: DenseMemory,
    pub clock: FakeHostClock,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OhciConfig::default())
    }

    pub fn with_config(config: OhciConfig) -> Self {
        init_tracing();
        let clock = FakeHostClock::new(0);
        let ohci = OhciController::new(config, Arc::new(clock.clone()));
        Self {
            ohci,
            mem: DenseMemory::new(MEM_SIZE).unwrap(),
            clock,
        }
    }

    /// Programs the HCCA and puts the controller in the operational state with every list
    /// enabled.
    pub fn start(&mut self) {
        self.ohci.write_register(REG_HCCA, HCCA);
        self.ohci
            .write_register(REG_CONTROL, USB_OPERATIONAL | CTL_PLE | CTL_CLE | CTL_BLE);
    }

    /// Plugs `dev` into `port`, resets the port and clears the change bits, leaving the device in
    /// the default state.
    pub fn plug(&mut self, port: usize, dev: &UsbDeviceHandle) {
        self.ohci.attach(port, dev).unwrap();
        self.ohci.write_register(reg_rh_port_status(port), PORT_PRS);
        self.ohci
            .write_register(reg_rh_port_status(port), PORT_CSC | PORT_PRSC);
        self.ohci.write_register(REG_INTERRUPT_STATUS, INTR_RHSC);
    }

    pub fn set_control_head(&mut self, ed: u32) {
        self.ohci.write_register(REG_CONTROL_HEAD_ED, ed);
        self.ohci.write_register(REG_COMMAND_STATUS, STATUS_CLF);
    }

    pub fn set_bulk_head(&mut self, ed: u32) {
        self.ohci.write_register(REG_BULK_HEAD_ED, ed);
        self.ohci.write_register(REG_COMMAND_STATUS, STATUS_BLF);
    }

    /// Points every periodic slot of the HCCA interrupt table at `ed`.
    pub fn set_periodic_head(&mut self, ed: u32) {
        for slot in 0..32u64 {
            self.mem
                .write_u32_le(u64::from(HCCA) + slot * 4, ed)
                .unwrap();
        }
    }

    /// Advances the clock by one frame and lets the controller catch up.
    pub fn tick(&mut self) -> u32 {
        self.clock.advance_ns(FRAME_NS);
        self.ohci.poll(&mut self.mem)
    }

    pub fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    pub fn intr_status(&mut self) -> u32 {
        self.ohci.read_register(REG_INTERRUPT_STATUS)
    }
}

/// Scripted response for the next non-control transfer.
#[derive(Debug, Clone)]
pub enum Reply {
    Data(Vec<u8>),
    Status(UsbStatus),
    Async,
}

/// Device with a fixed descriptor on endpoint 0 and scripted replies on its other endpoints.
pub struct TestDevice {
    pub state: UsbDeviceState,
    pub replies: VecDeque<Reply>,
    pub received: Vec<Vec<u8>>,
    pub canceled: Vec<u64>,
    pub stopped: usize,
    pub flushed: usize,
}

impl TestDevice {
    pub fn new(speed: UsbSpeed) -> Self {
        let mut state = UsbDeviceState::new(speed, "test device");
        state.configure_endpoint(UsbPid::In, 1, TransferType::Bulk, 64);
        state.configure_endpoint(UsbPid::Out, 2, TransferType::Bulk, 64);
        state.configure_endpoint(UsbPid::In, 3, TransferType::Isochronous, 192);
        Self {
            state,
            replies: VecDeque::new(),
            received: Vec::new(),
            canceled: Vec::new(),
            stopped: 0,
            flushed: 0,
        }
    }

    pub fn shared(speed: UsbSpeed) -> Rc<RefCell<TestDevice>> {
        Rc::new(RefCell::new(Self::new(speed)))
    }
}

impl UsbDevice for TestDevice {
    fn state(&self) -> &UsbDeviceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut UsbDeviceState {
        &mut self.state
    }

    fn handle_control(&mut self, p: &mut UsbPacket, req: ControlRequest, data: &mut [u8]) {
        const GET_DESCRIPTOR: u16 = DEVICE_REQUEST | REQ_GET_DESCRIPTOR as u16;
        const SET_ADDRESS: u16 = DEVICE_OUT_REQUEST | REQ_SET_ADDRESS as u16;
        match req.request {
            GET_DESCRIPTOR if req.value == 0x0100 => {
                data[..DEVICE_DESCRIPTOR.len()].copy_from_slice(&DEVICE_DESCRIPTOR);
                p.actual_length = DEVICE_DESCRIPTOR.len();
            }
            SET_ADDRESS => self.state.addr = req.value as u8,
            _ => p.status = UsbStatus::Stall,
        }
    }

    fn handle_data(&mut self, p: &mut UsbPacket) {
        if p.pid() != UsbPid::In {
            let mut buf = vec![0u8; p.remaining()];
            p.copy_to_device(&mut buf);
            self.received.push(buf);
            return;
        }
        match self.replies.pop_front() {
            Some(Reply::Data(bytes)) => {
                let n = bytes.len().min(p.remaining());
                p.copy_from_device(&bytes[..n]);
                if bytes.len() > n {
                    p.status = UsbStatus::Babble;
                }
            }
            Some(Reply::Status(status)) => p.status = status,
            Some(Reply::Async) => p.status = UsbStatus::Async,
            None => p.status = UsbStatus::Nak,
        }
    }

    fn cancel_packet(&mut self, p: &UsbPacket) {
        self.canceled.push(p.id());
    }

    fn endpoint_stopped(&mut self, _ep: mcpx_usb::EndpointKey) {
        self.stopped += 1;
    }

    fn flush_endpoint_queue(&mut self, _ep: mcpx_usb::EndpointKey) {
        self.flushed += 1;
    }
}

pub fn is_default(dev: &Rc<RefCell<TestDevice>>) -> bool {
    dev.borrow().state.state == DeviceState::Default
}
