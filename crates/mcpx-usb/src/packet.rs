//! In-flight USB transfers and the single dispatch entry point.
//!
//! A [`UsbPacket`] is owned by whoever submits it (a host controller keeps one per pending
//! transfer). Endpoints only record the correlation ids of packets they are still holding, so the
//! owner can cancel or complete a packet without the endpoint ever borrowing it.
//!
//! Packet lifecycle:
//!
//! ```text
//! Undefined -> Setup -> { Async | Queued | Complete | Canceled }
//! Queued -> { Async | Complete | Canceled }
//! Async -> { Complete | Canceled }
//! ```
//!
//! `Complete` and `Canceled` are terminal. A packet left in `Setup` after dispatch was NAKed and can
//! be set up again.

use crate::control;
use crate::device::{DeviceState, UsbDevice};
use crate::endpoint::{EndpointKey, TransferType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsbPid {
    Setup,
    In,
    Out,
}

impl UsbPid {
    /// Token PID byte as sent on the wire.
    pub const fn token(self) -> u8 {
        match self {
            Self::Setup => 0x2D,
            Self::In => 0x69,
            Self::Out => 0xE1,
        }
    }

    pub const fn from_token(token: u8) -> Option<Self> {
        match token {
            0x2D => Some(Self::Setup),
            0x69 => Some(Self::In),
            0xE1 => Some(Self::Out),
            _ => None,
        }
    }
}

/// Result of processing a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbStatus {
    Success,
    NoDev,
    Nak,
    Stall,
    Babble,
    IoError,
    /// The device will complete the packet later.
    Async,
    /// The device cannot take the packet yet; it is queued behind earlier transfers.
    AddToQueue,
    RemoveFromQueue,
}

impl UsbStatus {
    /// Numeric status code (`0` for success, negative for everything else).
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::NoDev => -1,
            Self::Nak => -2,
            Self::Stall => -3,
            Self::Babble => -4,
            Self::IoError => -5,
            Self::Async => -6,
            Self::AddToQueue => -7,
            Self::RemoveFromQueue => -8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketState {
    #[default]
    Undefined,
    Setup,
    Queued,
    Async,
    Complete,
    Canceled,
}

impl PacketState {
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Async)
    }
}

#[derive(Debug, Clone)]
pub struct UsbPacket {
    pid: UsbPid,
    id: u64,
    endpoint: EndpointKey,
    stream: u32,
    buffer: Vec<u8>,
    /// Inline control request for host-resident control transfers (0 = none).
    pub parameter: u64,
    short_ok: bool,
    int_req: bool,
    pub status: UsbStatus,
    pub actual_length: usize,
    state: PacketState,
}

impl Default for UsbPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbPacket {
    pub fn new() -> Self {
        Self {
            pid: UsbPid::Setup,
            id: 0,
            endpoint: EndpointKey::CONTROL,
            stream: 0,
            buffer: Vec::new(),
            parameter: 0,
            short_ok: false,
            int_req: false,
            status: UsbStatus::Success,
            actual_length: 0,
            state: PacketState::Undefined,
        }
    }

    /// Prepares the packet for a new transfer.
    ///
    /// # Panics
    ///
    /// Panics if the packet is still queued or pending asynchronously.
    pub fn setup(
        &mut self,
        pid: UsbPid,
        endpoint: EndpointKey,
        stream: u32,
        id: u64,
        short_ok: bool,
        int_req: bool,
    ) {
        assert!(
            !self.state.is_in_flight(),
            "packet {:#x} set up while {:?}",
            self.id,
            self.state
        );
        self.pid = pid;
        self.id = id;
        self.endpoint = endpoint;
        self.stream = stream;
        self.buffer.clear();
        self.parameter = 0;
        self.short_ok = short_ok;
        self.int_req = int_req;
        self.status = UsbStatus::Success;
        self.actual_length = 0;
        self.state = PacketState::Setup;
    }

    /// Appends outgoing bytes (SETUP/OUT) to the transfer buffer.
    pub fn append_buffer(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Reserves `len` bytes of buffer space for an IN transfer.
    pub fn append_zeroed(&mut self, len: usize) {
        self.buffer.resize(self.buffer.len() + len, 0);
    }

    pub fn pid(&self) -> UsbPid {
        self.pid
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> EndpointKey {
        self.endpoint
    }

    pub fn stream(&self) -> u32 {
        self.stream
    }

    pub fn short_ok(&self) -> bool {
        self.short_ok
    }

    pub fn int_req(&self) -> bool {
        self.int_req
    }

    pub fn state(&self) -> PacketState {
        self.state
    }

    /// Total size of the transfer buffer.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer space not yet consumed (OUT) or filled (IN).
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.actual_length
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Bytes transferred so far.
    pub fn transferred(&self) -> &[u8] {
        &self.buffer[..self.actual_length]
    }

    /// Moves the next `dst.len()` outgoing bytes to the device.
    ///
    /// # Panics
    ///
    /// Panics if that would read past the end of the buffer.
    pub fn copy_to_device(&mut self, dst: &mut [u8]) {
        let start = self.actual_length;
        let end = start + dst.len();
        assert!(end <= self.buffer.len(), "packet copy past end of buffer");
        dst.copy_from_slice(&self.buffer[start..end]);
        self.actual_length = end;
    }

    /// Appends device data to an IN transfer.
    ///
    /// # Panics
    ///
    /// Panics if that would write past the end of the buffer.
    pub fn copy_from_device(&mut self, src: &[u8]) {
        let start = self.actual_length;
        let end = start + src.len();
        assert!(end <= self.buffer.len(), "packet copy past end of buffer");
        self.buffer[start..end].copy_from_slice(src);
        self.actual_length = end;
    }

    fn check_state(&self, expected: PacketState) {
        assert_eq!(
            self.state, expected,
            "packet {:#x} in unexpected state",
            self.id
        );
    }
}

/// Submits `packet` to `device`.
///
/// On return `packet.status` holds the result; [`UsbStatus::Async`] means the packet is parked on
/// its endpoint queue until [`complete_packet`] or [`cancel_packet`].
///
/// # Panics
///
/// Panics if the device is not attached and in the default state, if the packet was not freshly
/// set up, or if an isochronous (or non-passthrough interrupt) endpoint defers completion.
pub fn handle_packet(device: Option<&mut dyn UsbDevice>, packet: &mut UsbPacket) {
    let Some(dev) = device else {
        packet.status = UsbStatus::NoDev;
        return;
    };

    {
        let state = dev.state();
        assert!(
            state.attached && state.state == DeviceState::Default,
            "packet dispatched to device in state {:?} (attached: {})",
            state.state,
            state.attached
        );
    }
    packet.check_state(PacketState::Setup);

    let key = packet.endpoint();
    let (queue_empty, pipeline) = {
        let ep = dev.state_mut().endpoint_mut(key);
        if ep.halted {
            assert!(ep.queue_is_empty(), "halted endpoint with queued packets");
            ep.halted = false;
        }
        (ep.queue_is_empty(), ep.pipeline)
    };

    if !(queue_empty || pipeline || packet.stream != 0) {
        queue_one(dev, packet);
        return;
    }

    process_one(dev, packet);
    match packet.status {
        UsbStatus::Async => {
            let transfer_type = dev.state().endpoint(key).transfer_type;
            assert_ne!(
                transfer_type,
                TransferType::Isochronous,
                "isochronous transfers cannot complete asynchronously"
            );
            assert!(
                transfer_type != TransferType::Interrupt || dev.is_host_passthrough(),
                "interrupt transfers cannot complete asynchronously"
            );
            packet.state = PacketState::Async;
            dev.state_mut().endpoint_mut(key).push(packet.id);
        }
        UsbStatus::AddToQueue => queue_one(dev, packet),
        status => {
            // A synchronous result must not overtake packets still queued on the endpoint.
            let ep = dev.state().endpoint(key);
            assert!(
                packet.stream != 0 || !ep.pipeline || ep.queue_is_empty(),
                "pipelined endpoint completed out of order"
            );
            if status != UsbStatus::Nak {
                packet.state = PacketState::Complete;
            }
        }
    }
}

pub(crate) fn process_one(dev: &mut dyn UsbDevice, packet: &mut UsbPacket) {
    packet.status = UsbStatus::Success;

    if !packet.endpoint().is_control() {
        dev.handle_data(packet);
        return;
    }

    if packet.parameter != 0 {
        control::do_parameter(dev, packet);
        return;
    }
    match packet.pid() {
        UsbPid::Setup => control::do_token_setup(dev, packet),
        UsbPid::In => control::do_token_in(dev, packet),
        UsbPid::Out => control::do_token_out(dev, packet),
    }
}

fn queue_one(dev: &mut dyn UsbDevice, packet: &mut UsbPacket) {
    packet.state = PacketState::Queued;
    dev.state_mut().endpoint_mut(packet.endpoint()).push(packet.id);
    packet.status = UsbStatus::Async;
}

/// Cancels a queued or asynchronous packet.
///
/// # Panics
///
/// Panics (before touching any queue) if the packet is not in flight.
pub fn cancel_packet(dev: &mut dyn UsbDevice, packet: &mut UsbPacket) {
    assert!(
        packet.state.is_in_flight(),
        "cannot cancel packet {:#x} in state {:?}",
        packet.id,
        packet.state
    );
    let was_async = packet.state == PacketState::Async;
    packet.state = PacketState::Canceled;
    dev.state_mut()
        .endpoint_mut(packet.endpoint())
        .remove(packet.id);
    if was_async {
        dev.cancel_packet(packet);
    }
}

/// Finishes an asynchronous packet once the device has filled in its result.
///
/// An error status, or a short transfer on a packet that does not accept one, halts the endpoint.
///
/// # Panics
///
/// Panics if the packet is not the oldest one pending on its endpoint, or if `packet.status` still
/// says the transfer is pending.
pub fn complete_packet(dev: &mut dyn UsbDevice, packet: &mut UsbPacket) {
    packet.check_state(PacketState::Async);
    assert!(
        !matches!(
            packet.status,
            UsbStatus::Async | UsbStatus::Nak | UsbStatus::AddToQueue
        ),
        "completed packet still reports {:?}",
        packet.status
    );

    assert_eq!(
        dev.state().endpoint(packet.endpoint()).front(),
        Some(packet.id),
        "packet completed out of submission order"
    );
    if packet.endpoint().is_control() {
        control::complete_async(dev, packet);
    }

    let ep = dev.state_mut().endpoint_mut(packet.endpoint());
    if packet.status != UsbStatus::Success
        || (!packet.short_ok && packet.actual_length < packet.size())
    {
        ep.halted = true;
    }
    ep.remove(packet.id);
    packet.state = PacketState::Complete;
}
