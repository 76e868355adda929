mod util;

use std::cell::RefCell;
use std::rc::Rc;

use mcpx_usb::ohci::descriptor::{CC_DATAOVERRUN, CC_NOERROR, CC_STALL};
use mcpx_usb::{UsbDeviceHandle, UsbSpeed};
use memory::{DenseMemory, GuestMemory};
use pretty_assertions::assert_eq;
use util::*;

const ED: u32 = 0x2000;
const TD: u32 = 0x4000;
const TAIL: u32 = 0x4040;
const BUF: u32 = 0x8000;

/// NotAccessed condition code as queued by the guest in every packet status word.
const PSW_NOT_ACCESSED: u16 = 0xe000;

fn write_iso_td(mem: &mut DenseMemory, flags: u32, be: u32, offsets: &[u16]) {
    write_td(mem, TD, flags, BUF, TAIL, be);
    for (i, off) in offsets.iter().enumerate() {
        mem.write_u16_le(u64::from(TD) + 16 + i as u64 * 2, *off)
            .unwrap();
    }
}

fn psw(mem: &DenseMemory, idx: u64) -> u16 {
    mem.read_u16_le(u64::from(TD) + 16 + idx * 2).unwrap()
}

fn iso_setup() -> (Harness, Rc<RefCell<TestDevice>>, UsbDeviceHandle) {
    let mut h = Harness::new();
    let dev = TestDevice::shared(UsbSpeed::Full);
    let handle: UsbDeviceHandle = dev.clone();
    h.plug(0, &handle);
    h.start();
    write_ed(&mut h.mem, ED, iso_ed_flags(0, 3, ED_DIR_IN, 192), TAIL, TD, 0);
    h.set_periodic_head(ED);
    (h, dev, handle)
}

#[test]
fn iso_in_fills_one_packet_per_frame() {
    let (mut h, dev, _handle) = iso_setup();
    write_iso_td(
        &mut h.mem,
        iso_td_flags(0, 2, 0),
        BUF + 0x7f,
        &[PSW_NOT_ACCESSED, PSW_NOT_ACCESSED | 0x40],
    );
    dev.borrow_mut().replies.extend([
        Reply::Data(vec![0x11; 10]),
        Reply::Data(vec![0x22; 64]),
    ]);

    h.tick();
    assert_eq!(psw(&h.mem, 0), 10);
    assert_eq!(psw(&h.mem, 1), PSW_NOT_ACCESSED | 0x40);
    assert_eq!(ed_head(&h.mem, ED), TD, "TD stays queued until its last packet");

    h.tick();
    assert_eq!(psw(&h.mem, 1), 64);
    assert_eq!(td_cc(&h.mem, TD), CC_NOERROR);
    assert_eq!(ed_head(&h.mem, ED), TAIL);
    assert_eq!(&h.mem.as_slice()[0x8000..0x800a], &[0x11; 10]);
    assert_eq!(&h.mem.as_slice()[0x8040..0x8080], &[0x22; 64]);

    h.tick();
    assert_eq!(hcca_done(&h.mem), TD);
}

#[test]
fn iso_td_waits_for_its_starting_frame() {
    let (mut h, dev, _handle) = iso_setup();
    write_iso_td(&mut h.mem, iso_td_flags(2, 1, 0), BUF + 0x3f, &[PSW_NOT_ACCESSED]);
    dev.borrow_mut().replies.push_back(Reply::Data(vec![0; 8]));

    h.ticks(2);
    assert_eq!(td_cc(&h.mem, TD), 0xf);
    assert_eq!(dev.borrow().replies.len(), 1);

    h.tick();
    assert_eq!(td_cc(&h.mem, TD), CC_NOERROR);
    assert_eq!(psw(&h.mem, 0), 8);
}

#[test]
fn expired_iso_td_is_retired_with_data_overrun() {
    let (mut h, dev, _handle) = iso_setup();
    // Starting frame 0xfff0 is 16 frames in the past at frame 0.
    write_iso_td(
        &mut h.mem,
        iso_td_flags(0xfff0, 1, 0),
        BUF + 0x3f,
        &[PSW_NOT_ACCESSED],
    );

    h.tick();
    assert_eq!(td_cc(&h.mem, TD), CC_DATAOVERRUN);
    assert_eq!(ed_head(&h.mem, ED), TAIL);
    assert!(dev.borrow().replies.is_empty());
    assert_eq!(psw(&h.mem, 0), PSW_NOT_ACCESSED);
}

#[test]
fn unanswered_iso_packet_is_recorded_in_psw() {
    let (mut h, _dev, _handle) = iso_setup();
    write_iso_td(&mut h.mem, iso_td_flags(0, 1, 0), BUF + 0x3f, &[PSW_NOT_ACCESSED]);

    h.tick();
    assert_eq!(psw(&h.mem, 0) >> 12, CC_STALL as u16);
    assert_eq!(td_cc(&h.mem, TD), CC_NOERROR);
}
