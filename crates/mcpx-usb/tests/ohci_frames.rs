mod util;

use mcpx_usb::ohci::descriptor::CC_NOERROR;
use mcpx_usb::ohci::regs::*;
use mcpx_usb::{OhciConfig, UsbDeviceHandle, UsbSpeed};
use pretty_assertions::assert_eq;
use util::*;

const ED: u32 = 0x2000;
const TD: u32 = 0x3000;
const TAIL: u32 = 0x3010;
const BUF: u32 = 0x8000;

#[test]
fn frame_number_is_mirrored_into_hcca() {
    let mut h = Harness::new();
    h.start();
    h.ticks(3);

    assert_eq!(hcca_frame(&h.mem), 3);
    assert_eq!(h.ohci.read_register(REG_FM_NUMBER), 3);
    assert_ne!(h.intr_status() & INTR_SF, 0);
}

#[test]
fn frame_number_wraps_after_65535() {
    let mut h = Harness::with_config(OhciConfig {
        max_frames_per_poll: 0x1_0000,
        ..OhciConfig::default()
    });
    h.start();
    h.clock.advance_ns(0xfffe * FRAME_NS);
    assert_eq!(h.ohci.poll(&mut h.mem), 0xfffe);
    assert_eq!(h.ohci.frame_number(), 0xfffe);
    assert_eq!(hcca_frame(&h.mem), 0xfffe);

    h.tick();
    assert_eq!(h.ohci.frame_number(), 0xffff);
    assert_eq!(hcca_frame(&h.mem), 0xffff);

    h.tick();
    assert_eq!(h.ohci.frame_number(), 0);
    assert_eq!(h.ohci.read_register(REG_FM_NUMBER), 0);
    assert_eq!(hcca_frame(&h.mem), 0);
    // The pad half of the HCCA frame word is always written as zero.
    assert_eq!(read_u32(&h.mem, HCCA + 0x80), 0);

    h.tick();
    assert_eq!(h.ohci.frame_number(), 1);
    assert_eq!(hcca_frame(&h.mem), 1);
}

#[test]
fn start_of_frame_raises_irq_when_enabled() {
    let mut h = Harness::new();
    h.start();
    h.ohci
        .write_register(REG_INTERRUPT_ENABLE, INTR_MIE | INTR_SF);
    assert!(!h.ohci.irq_level());

    h.tick();
    assert!(h.ohci.irq_level());

    h.ohci.write_register(REG_INTERRUPT_STATUS, INTR_SF);
    assert!(!h.ohci.irq_level());
}

#[test]
fn no_frames_run_until_operational() {
    let mut h = Harness::new();
    h.ohci.write_register(REG_HCCA, HCCA);
    assert_eq!(h.tick(), 0);
    assert_eq!(hcca_frame(&h.mem), 0);
    assert_eq!(h.intr_status() & INTR_SF, 0);
}

#[test]
fn periodic_list_is_serviced_without_control_or_bulk() {
    let mut h = Harness::new();
    let dev = TestDevice::shared(UsbSpeed::Full);
    let handle: UsbDeviceHandle = dev.clone();
    h.plug(0, &handle);
    h.ohci.write_register(REG_HCCA, HCCA);
    h.ohci
        .write_register(REG_CONTROL, USB_OPERATIONAL | CTL_PLE);

    write_ed(&mut h.mem, ED, ed_flags(0, 1, ED_DIR_IN, 8), TAIL, TD, 0);
    write_buffer_td(&mut h.mem, TD, td_flags(TD_DP_IN, 0, false), BUF, 8, TAIL);
    h.set_periodic_head(ED);
    dev.borrow_mut()
        .replies
        .push_back(Reply::Data(vec![0x42; 8]));

    h.tick();
    assert_eq!(td_cc(&h.mem, TD), CC_NOERROR);
    assert_eq!(&h.mem.as_slice()[0x8000..0x8008], &[0x42; 8]);
}

#[test]
fn cyclic_ed_list_is_unrecoverable() {
    let mut h = Harness::new();
    h.start();
    h.ohci
        .write_register(REG_INTERRUPT_ENABLE, INTR_MIE | INTR_UE);
    // An ED with no TDs that links back to itself.
    write_ed(&mut h.mem, ED, ed_flags(0, 0, ED_DIR_TD, 8), 0, 0, ED);
    h.set_control_head(ED);

    h.tick();

    assert_ne!(h.intr_status() & INTR_UE, 0);
    assert!(h.ohci.irq_level());
    assert!(!h.ohci.is_running());
    assert_eq!(h.ohci.read_register(REG_FM_NUMBER), 0);
    assert_eq!(
        h.ohci.take_pci_status_bits(),
        PCI_STATUS_DETECTED_PARITY_ERROR
    );
    assert_eq!(h.ohci.take_pci_status_bits(), 0);

    // Halted until the guest restarts it.
    assert_eq!(h.tick(), 0);
}

#[test]
fn out_td_on_zero_max_packet_endpoint_is_unrecoverable() {
    let mut h = Harness::new();
    let dev = TestDevice::shared(UsbSpeed::Full);
    let handle: UsbDeviceHandle = dev.clone();
    h.plug(0, &handle);
    h.start();

    // Max packet size 0 would leave the TD at the head forever.
    write_ed(&mut h.mem, ED, ed_flags(0, 2, ED_DIR_OUT, 0), TAIL, TD, 0);
    write_buffer_td(&mut h.mem, TD, td_flags(TD_DP_OUT, 0, false), BUF, 8, TAIL);
    h.set_bulk_head(ED);

    h.tick();

    assert_ne!(h.intr_status() & INTR_UE, 0);
    assert!(!h.ohci.is_running());
    assert!(dev.borrow().received.is_empty());
}

#[test]
fn td_link_limit_counts_descriptors_not_packets() {
    let mut h = Harness::with_config(OhciConfig {
        td_link_limit: 2,
        ..OhciConfig::default()
    });
    let dev = TestDevice::shared(UsbSpeed::Full);
    let handle: UsbDeviceHandle = dev.clone();
    h.plug(0, &handle);
    h.start();

    // One TD that takes 64 eight-byte packets to send.
    write_ed(&mut h.mem, ED, ed_flags(0, 2, ED_DIR_OUT, 8), TAIL, TD, 0);
    write_buffer_td(&mut h.mem, TD, td_flags(TD_DP_OUT, 0, false), BUF, 512, TAIL);
    h.set_bulk_head(ED);

    h.tick();

    assert_eq!(h.intr_status() & INTR_UE, 0);
    assert!(h.ohci.is_running());
    assert_eq!(dev.borrow().received.len(), 64);
    assert_eq!(td_cc(&h.mem, TD), CC_NOERROR);
    assert_eq!(ed_head(&h.mem, ED) & !0xf, TAIL);
}

#[test]
fn hcca_outside_guest_memory_stops_controller() {
    let mut h = Harness::new();
    h.ohci
        .write_register(REG_HCCA, (MEM_SIZE as u32) + 0x1000);
    h.ohci.write_register(REG_CONTROL, USB_OPERATIONAL);

    h.tick();

    assert_ne!(h.intr_status() & INTR_UE, 0);
    assert!(!h.ohci.is_running());
}

#[test]
fn restart_after_error_resumes_frames() {
    let mut h = Harness::new();
    h.ohci
        .write_register(REG_HCCA, (MEM_SIZE as u32) + 0x1000);
    h.ohci.write_register(REG_CONTROL, USB_OPERATIONAL);
    h.tick();
    assert!(!h.ohci.is_running());

    h.ohci.write_register(REG_COMMAND_STATUS, STATUS_HCR);
    assert_eq!(h.intr_status(), 0);
    h.start();
    assert_eq!(h.tick(), 1);
    assert_eq!(hcca_frame(&h.mem), 1);
}
