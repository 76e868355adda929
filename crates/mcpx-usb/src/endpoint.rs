use std::collections::VecDeque;

use crate::packet::UsbPid;

/// Highest endpoint number a USB device can expose.
pub const MAX_ENDPOINTS: u8 = 15;

/// Identifies an endpoint within a device.
///
/// Endpoint 0 is the bidirectional control endpoint, so its key compares equal regardless of the
/// token that addressed it. For other endpoints a SETUP token addresses the OUT endpoint (SETUP is
/// host-to-device).
#[derive(Debug, Clone, Copy, Eq)]
pub struct EndpointKey {
    pub pid: UsbPid,
    pub number: u8,
}

impl EndpointKey {
    pub const CONTROL: Self = Self {
        pid: UsbPid::Setup,
        number: 0,
    };

    pub const fn new(pid: UsbPid, number: u8) -> Self {
        Self { pid, number }
    }

    pub const fn is_control(self) -> bool {
        self.number == 0
    }

    /// Direction used to select the endpoint array; SETUP folds into OUT.
    pub const fn direction(self) -> UsbPid {
        match self.pid {
            UsbPid::In => UsbPid::In,
            UsbPid::Out | UsbPid::Setup => UsbPid::Out,
        }
    }
}

impl PartialEq for EndpointKey {
    fn eq(&self, other: &Self) -> bool {
        if self.number == 0 || other.number == 0 {
            return self.number == other.number;
        }
        self.number == other.number && self.direction() == other.direction()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
    /// Endpoint not described by the active configuration.
    Invalid,
}

/// Per-endpoint queuing state.
///
/// The queue holds correlation ids of packets that were accepted but not yet completed, in
/// submission order.
#[derive(Debug, Clone)]
pub struct UsbEndpoint {
    pub number: u8,
    pub pid: UsbPid,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    pub pipeline: bool,
    pub halted: bool,
    queue: VecDeque<u64>,
}

impl UsbEndpoint {
    pub(crate) fn new(pid: UsbPid, number: u8, transfer_type: TransferType) -> Self {
        Self {
            number,
            pid,
            transfer_type,
            max_packet_size: if number == 0 { 64 } else { 0 },
            pipeline: false,
            halted: false,
            queue: VecDeque::new(),
        }
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey::new(self.pid, self.number)
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queued(&self) -> impl Iterator<Item = u64> + '_ {
        self.queue.iter().copied()
    }

    pub(crate) fn front(&self) -> Option<u64> {
        self.queue.front().copied()
    }

    pub(crate) fn push(&mut self, id: u64) {
        self.queue.push_back(id);
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|&queued| queued == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }
}
