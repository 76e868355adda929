mod util;

use mcpx_usb::ohci::descriptor::{
    CC_DATAOVERRUN, CC_DATAUNDERRUN, CC_NOERROR, CC_STALL, ED_H, TD_EC_SHIFT,
};
use mcpx_usb::ohci::regs::*;
use mcpx_usb::{UsbDeviceHandle, UsbSpeed, UsbStatus};
use memory::GuestMemory;
use pretty_assertions::assert_eq;
use util::*;

const ED: u32 = 0x2000;
const TD: u32 = 0x3000;
const TAIL: u32 = 0x3010;
const BUF: u32 = 0x8000;

fn plugged() -> (Harness, std::rc::Rc<std::cell::RefCell<TestDevice>>) {
    let mut h = Harness::new();
    let dev = TestDevice::shared(UsbSpeed::Full);
    let handle: UsbDeviceHandle = dev.clone();
    h.plug(0, &handle);
    h.start();
    (h, dev)
}

fn queue_in(h: &mut Harness, len: u32, rounding: bool) {
    write_ed(&mut h.mem, ED, ed_flags(0, 1, ED_DIR_IN, 64), TAIL, TD, 0);
    write_buffer_td(
        &mut h.mem,
        TD,
        td_flags(TD_DP_IN, TD_DI_NONE, rounding),
        BUF,
        len,
        TAIL,
    );
    h.set_bulk_head(ED);
}

#[test]
fn out_td_is_split_into_max_packet_chunks() {
    let (mut h, dev) = plugged();
    let payload: Vec<u8> = (0..20).collect();
    h.mem.write_from(u64::from(BUF), &payload).unwrap();
    write_ed(&mut h.mem, ED, ed_flags(0, 2, ED_DIR_OUT, 8), TAIL, TD, 0);
    write_buffer_td(
        &mut h.mem,
        TD,
        td_flags(TD_DP_OUT, TD_DI_NONE, false),
        BUF,
        20,
        TAIL,
    );
    h.set_bulk_head(ED);

    h.tick();

    let dev = dev.borrow();
    let sizes: Vec<usize> = dev.received.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![8, 8, 4]);
    assert_eq!(dev.received.concat(), payload);
    assert_eq!(td_cc(&h.mem, TD), CC_NOERROR);
    assert_eq!(read_u32(&h.mem, TD + 4), 0, "CBP cleared once the TD is fully sent");
    assert_eq!(ed_head(&h.mem, ED) & !0xf, TAIL);
}

#[test]
fn stall_halts_endpoint_and_flushes_done_queue() {
    let (mut h, dev) = plugged();
    dev.borrow_mut().replies.push_back(Reply::Status(UsbStatus::Stall));
    queue_in(&mut h, 16, false);

    h.tick();

    let td_flags = read_u32(&h.mem, TD);
    assert_eq!(td_flags >> 28, CC_STALL);
    assert_eq!((td_flags >> TD_EC_SHIFT) & 3, 3);
    let head = ed_head(&h.mem, ED);
    assert_ne!(head & ED_H, 0);
    assert_eq!(head & !0xf, TAIL);
    // DelayInterrupt was 7, but an error forces the writeback in this frame.
    assert_eq!(hcca_done(&h.mem), TD);
    assert_ne!(h.intr_status() & INTR_WD, 0);
}

#[test]
fn halted_ed_is_skipped() {
    let (mut h, dev) = plugged();
    dev.borrow_mut().replies.push_back(Reply::Data(vec![1; 16]));
    queue_in(&mut h, 16, false);
    let head = ed_head(&h.mem, ED);
    h.mem.write_u32_le(u64::from(ED) + 8, head | ED_H).unwrap();

    h.ticks(2);
    assert_eq!(td_cc(&h.mem, TD), 0xf);
    assert_eq!(dev.borrow().replies.len(), 1);
}

#[test]
fn short_in_without_rounding_is_data_underrun() {
    let (mut h, dev) = plugged();
    dev.borrow_mut().replies.push_back(Reply::Data(vec![0xaa; 4]));
    queue_in(&mut h, 16, false);

    h.tick();

    assert_eq!(td_cc(&h.mem, TD), CC_DATAUNDERRUN);
    assert_ne!(ed_head(&h.mem, ED) & ED_H, 0);
    let mut got = [0u8; 4];
    h.mem.read_into(u64::from(BUF), &mut got).unwrap();
    assert_eq!(got, [0xaa; 4]);
}

#[test]
fn short_in_with_rounding_succeeds() {
    let (mut h, dev) = plugged();
    dev.borrow_mut().replies.push_back(Reply::Data(vec![0x55; 4]));
    queue_in(&mut h, 16, true);

    h.tick();

    assert_eq!(td_cc(&h.mem, TD), CC_NOERROR);
    assert_eq!(ed_head(&h.mem, ED) & ED_H, 0);
    assert_eq!(read_u32(&h.mem, TD + 4), BUF + 4);
}

#[test]
fn babble_is_data_overrun() {
    let (mut h, dev) = plugged();
    dev.borrow_mut().replies.push_back(Reply::Data(vec![0; 32]));
    queue_in(&mut h, 16, true);

    h.tick();

    assert_eq!(td_cc(&h.mem, TD), CC_DATAOVERRUN);
    assert_ne!(ed_head(&h.mem, ED) & ED_H, 0);
}

#[test]
fn nak_leaves_td_queued_for_retry() {
    let (mut h, dev) = plugged();
    queue_in(&mut h, 8, false);

    h.tick();
    assert_eq!(td_cc(&h.mem, TD), 0xf);
    assert_eq!(ed_head(&h.mem, ED), TD);
    assert_ne!(h.ohci.read_register(REG_COMMAND_STATUS) & STATUS_BLF, 0);

    dev.borrow_mut()
        .replies
        .push_back(Reply::Data((1..=8).collect()));
    h.tick();
    assert_eq!(td_cc(&h.mem, TD), CC_NOERROR);
    let mut got = [0u8; 8];
    h.mem.read_into(u64::from(BUF), &mut got).unwrap();
    assert_eq!(got, [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn in_buffer_crossing_a_page_continues_at_end_page() {
    let (mut h, dev) = plugged();
    let reply: Vec<u8> = (0..16).collect();
    dev.borrow_mut().replies.push_back(Reply::Data(reply.clone()));
    write_ed(&mut h.mem, ED, ed_flags(0, 1, ED_DIR_IN, 64), TAIL, TD, 0);
    write_td(
        &mut h.mem,
        TD,
        td_flags(TD_DP_IN, TD_DI_NONE, false),
        0x8ff8,
        TAIL,
        0xa007,
    );
    h.set_bulk_head(ED);

    h.tick();

    assert_eq!(td_cc(&h.mem, TD), CC_NOERROR);
    assert_eq!(&h.mem.as_slice()[0x8ff8..0x9000], &reply[..8]);
    assert_eq!(&h.mem.as_slice()[0xa000..0xa008], &reply[8..]);
    assert_eq!(&h.mem.as_slice()[0x9000..0x9008], &[0u8; 8]);
}

#[test]
fn td_delay_interrupt_defers_writeback() {
    let (mut h, dev) = plugged();
    dev.borrow_mut().replies.push_back(Reply::Data(vec![0; 8]));
    write_ed(&mut h.mem, ED, ed_flags(0, 1, ED_DIR_IN, 64), TAIL, TD, 0);
    write_buffer_td(&mut h.mem, TD, td_flags(TD_DP_IN, 2, false), BUF, 8, TAIL);
    h.set_bulk_head(ED);

    h.ticks(2);
    assert_eq!(h.intr_status() & INTR_WD, 0);
    assert_eq!(hcca_done(&h.mem), 0);
    h.tick();
    assert_ne!(h.intr_status() & INTR_WD, 0);
    assert_eq!(hcca_done(&h.mem), TD);
}

#[test]
fn done_queue_is_not_overwritten_until_guest_acknowledges() {
    let (mut h, dev) = plugged();
    dev.borrow_mut().replies.push_back(Reply::Data(vec![0; 8]));
    write_ed(&mut h.mem, ED, ed_flags(0, 1, ED_DIR_IN, 64), TAIL, TD, 0);
    write_buffer_td(&mut h.mem, TD, td_flags(TD_DP_IN, 0, false), BUF, 8, TAIL);
    h.set_bulk_head(ED);
    h.tick();
    assert_eq!(hcca_done(&h.mem), TD);

    // Second TD retires while WD is still pending: the HCCA keeps the first one.
    const TD2: u32 = 0x3020;
    dev.borrow_mut().replies.push_back(Reply::Data(vec![0; 8]));
    write_buffer_td(&mut h.mem, TAIL, td_flags(TD_DP_IN, 0, false), BUF, 8, TD2);
    h.mem.write_u32_le(u64::from(ED) + 4, TD2).unwrap();
    h.ohci.write_register(REG_COMMAND_STATUS, STATUS_BLF);
    h.tick();
    assert_eq!(td_cc(&h.mem, TAIL), CC_NOERROR);
    assert_eq!(hcca_done(&h.mem), TD);

    h.ohci.write_register(REG_INTERRUPT_STATUS, INTR_WD);
    h.tick();
    assert_eq!(hcca_done(&h.mem), TAIL);
}
