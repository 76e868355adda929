mod util;

use std::cell::RefCell;
use std::rc::Rc;

use mcpx_usb::ohci::descriptor::{CC_NOERROR, CC_STALL, ED_K};
use mcpx_usb::ohci::regs::*;
use mcpx_usb::{UsbDeviceHandle, UsbSpeed, UsbStatus};
use memory::GuestMemory;
use pretty_assertions::assert_eq;
use util::*;

const ED: u32 = 0x2000;
const TD: u32 = 0x3000;
const TAIL: u32 = 0x3010;
const BUF: u32 = 0x8000;

/// Starts a bulk IN transfer that the device defers.
fn pending_in() -> (Harness, Rc<RefCell<TestDevice>>, UsbDeviceHandle) {
    let mut h = Harness::new();
    let dev = TestDevice::shared(UsbSpeed::Full);
    let handle: UsbDeviceHandle = dev.clone();
    h.plug(0, &handle);
    h.start();

    dev.borrow_mut().replies.push_back(Reply::Async);
    write_ed(&mut h.mem, ED, ed_flags(0, 1, ED_DIR_IN, 64), TAIL, TD, 0);
    write_buffer_td(&mut h.mem, TD, td_flags(TD_DP_IN, 0, true), BUF, 16, TAIL);
    h.set_bulk_head(ED);
    h.tick();
    (h, dev, handle)
}

#[test]
fn deferred_td_stays_on_ed_until_completed() {
    let (mut h, dev, _handle) = pending_in();

    assert_eq!(h.ohci.pending_async_td(), Some(TD));
    assert_eq!(dev.borrow().flushed, 1);
    assert_eq!(td_cc(&h.mem, TD), 0xf);

    h.ticks(3);
    assert_eq!(h.ohci.pending_async_td(), Some(TD));
    assert_eq!(ed_head(&h.mem, ED), TD);

    assert!(h
        .ohci
        .complete_async_packet(&mut h.mem, u64::from(TD), UsbStatus::Success, &[9, 8, 7, 6]));

    assert_eq!(h.ohci.pending_async_td(), None);
    assert_eq!(td_cc(&h.mem, TD), CC_NOERROR);
    assert_eq!(read_u32(&h.mem, TD + 4), BUF + 4);
    assert_eq!(ed_head(&h.mem, ED) & !0xf, TAIL);
    let mut got = [0u8; 4];
    h.mem.read_into(u64::from(BUF), &mut got).unwrap();
    assert_eq!(got, [9, 8, 7, 6]);

    // DelayInterrupt 0: the done queue goes out at the next frame boundary.
    h.tick();
    assert_eq!(hcca_done(&h.mem), TD);
}

#[test]
fn completion_for_another_td_is_ignored() {
    let (mut h, _dev, _handle) = pending_in();
    assert!(!h
        .ohci
        .complete_async_packet(&mut h.mem, 0x4000, UsbStatus::Success, &[]));
    assert_eq!(h.ohci.pending_async_td(), Some(TD));
}

#[test]
fn failed_completion_halts_ed() {
    let (mut h, _dev, _handle) = pending_in();
    assert!(h
        .ohci
        .complete_async_packet(&mut h.mem, u64::from(TD), UsbStatus::Stall, &[]));
    assert_eq!(td_cc(&h.mem, TD), CC_STALL);
    assert_ne!(ed_head(&h.mem, ED) & 1, 0);
}

#[test]
#[should_panic(expected = "pending status")]
fn completion_with_pending_status_panics() {
    let (mut h, _dev, _handle) = pending_in();
    h.ohci
        .complete_async_packet(&mut h.mem, u64::from(TD), UsbStatus::Async, &[]);
}

#[test]
fn skipping_ed_cancels_in_flight_packet() {
    let (mut h, dev, _handle) = pending_in();
    let flags = read_u32(&h.mem, ED);
    h.mem.write_u32_le(u64::from(ED), flags | ED_K).unwrap();

    h.tick();

    assert_eq!(h.ohci.pending_async_td(), None);
    let dev = dev.borrow();
    assert_eq!(dev.canceled, vec![u64::from(TD)]);
    assert_eq!(dev.stopped, 1);
    assert_eq!(td_cc(&h.mem, TD), 0xf);
}

#[test]
fn disabling_bulk_list_cancels_and_stops_endpoints() {
    let (mut h, dev, _handle) = pending_in();
    h.ohci
        .write_register(REG_CONTROL, USB_OPERATIONAL | CTL_PLE | CTL_CLE);

    h.tick();

    assert_eq!(h.ohci.pending_async_td(), None);
    let dev = dev.borrow();
    assert_eq!(dev.canceled, vec![u64::from(TD)]);
    // One notification per endpoint slot: control, 15 IN and 15 OUT.
    assert_eq!(dev.stopped, 31);
}

#[test]
fn detaching_device_cancels_its_packet() {
    let (mut h, dev, _handle) = pending_in();
    h.ohci.detach(0).unwrap();

    assert_eq!(h.ohci.pending_async_td(), None);
    assert_eq!(dev.borrow().canceled, vec![u64::from(TD)]);
    assert_ne!(h.ohci.port_status(0).unwrap() & PORT_CSC, 0);
}

#[test]
fn dropped_device_abandons_pending_td() {
    let (mut h, dev, handle) = pending_in();
    drop(handle);
    drop(dev);

    h.tick();
    assert!(!h
        .ohci
        .complete_async_packet(&mut h.mem, u64::from(TD), UsbStatus::Success, &[]));
    assert_eq!(h.ohci.pending_async_td(), None);

    // Transfers for other devices are no longer held up behind the abandoned TD.
    const ED2: u32 = 0x2100;
    const TD2: u32 = 0x3100;
    const TAIL2: u32 = 0x3110;
    let other = TestDevice::shared(UsbSpeed::Full);
    let other_handle: UsbDeviceHandle = other.clone();
    h.plug(1, &other_handle);
    other.borrow_mut().state.addr = 5;
    other
        .borrow_mut()
        .replies
        .push_back(Reply::Data(vec![1, 2, 3, 4]));
    write_ed(&mut h.mem, ED, ed_flags(0, 1, ED_DIR_IN, 64), TAIL, TD, ED2);
    write_ed(&mut h.mem, ED2, ed_flags(5, 1, ED_DIR_IN, 64), TAIL2, TD2, 0);
    write_buffer_td(&mut h.mem, TD2, td_flags(TD_DP_IN, 0, true), BUF + 0x100, 16, TAIL2);
    h.set_bulk_head(ED);

    h.ticks(2);
    assert_eq!(td_cc(&h.mem, TD2), CC_NOERROR);
    assert_eq!(ed_head(&h.mem, ED2) & !0xf, TAIL2);
    assert_eq!(ed_head(&h.mem, ED), TD);
    assert_eq!(h.ohci.pending_async_td(), None);
}

#[test]
fn detaching_a_dropped_device_frees_its_port() {
    let (mut h, dev, handle) = pending_in();
    drop(handle);
    drop(dev);
    h.ohci.write_register(reg_rh_port_status(0), PORT_CSC);

    h.ohci.detach(0).unwrap();

    assert_eq!(h.ohci.pending_async_td(), None);
    let status = h.ohci.port_status(0).unwrap();
    assert_eq!(status & (PORT_CCS | PORT_PES), 0);
    assert_eq!(status & (PORT_CSC | PORT_PESC), PORT_CSC | PORT_PESC);
    assert_eq!(h.ohci.detach(0), Err(mcpx_usb::UsbError::PortEmpty(0)));

    let replacement: UsbDeviceHandle = TestDevice::shared(UsbSpeed::Full);
    h.ohci.attach(0, &replacement).unwrap();
}

#[test]
fn entering_reset_state_cancels_pending_packet() {
    let (mut h, dev, _handle) = pending_in();
    h.ohci.write_register(REG_CONTROL, USB_RESET);

    assert_eq!(h.ohci.pending_async_td(), None);
    assert!(!h.ohci.is_running());
    let dev = dev.borrow();
    assert_eq!(dev.canceled, vec![u64::from(TD)]);
    assert_eq!(dev.stopped, 31);
}
