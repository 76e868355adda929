use crate::endpoint::{EndpointKey, TransferType, UsbEndpoint, MAX_ENDPOINTS};
use crate::packet::{UsbPacket, UsbPid};

/// Size of the endpoint-zero data stage buffer; longer OUT control transfers are stalled.
pub const DATA_BUF_SIZE: usize = 4096;

/// `bmRequestType` values, pre-shifted into the high byte of [`ControlRequest::request`].
pub const DEVICE_REQUEST: u16 = 0x80 << 8;
pub const DEVICE_OUT_REQUEST: u16 = 0x0000;
pub const INTERFACE_REQUEST: u16 = 0x81 << 8;
pub const INTERFACE_OUT_REQUEST: u16 = 0x01 << 8;
pub const ENDPOINT_REQUEST: u16 = 0x82 << 8;
pub const ENDPOINT_OUT_REQUEST: u16 = 0x02 << 8;
pub const CLASS_INTERFACE_REQUEST: u16 = 0xa1 << 8;
pub const CLASS_INTERFACE_OUT_REQUEST: u16 = 0x21 << 8;

pub const REQ_GET_STATUS: u8 = 0x00;
pub const REQ_CLEAR_FEATURE: u8 = 0x01;
pub const REQ_SET_FEATURE: u8 = 0x03;
pub const REQ_SET_ADDRESS: u8 = 0x05;
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_SET_DESCRIPTOR: u8 = 0x07;
pub const REQ_GET_CONFIGURATION: u8 = 0x08;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;
pub const REQ_GET_INTERFACE: u8 = 0x0a;
pub const REQ_SET_INTERFACE: u8 = 0x0b;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
}

impl UsbSpeed {
    /// Bit used in port speed masks.
    pub const fn mask(self) -> u8 {
        match self {
            Self::Low => 1 << 0,
            Self::Full => 1 << 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    NotAttached,
    Attached,
    /// Reset and answering on address 0 or its assigned address.
    Default,
    Suspended,
}

/// Endpoint-zero control transfer stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetupState {
    #[default]
    Idle,
    Setup,
    Data,
    Ack,
    Param,
}

/// Decoded 8-byte SETUP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// `bmRequestType << 8 | bRequest`.
    pub request: u16,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlRequest {
    pub fn from_bytes(b: [u8; 8]) -> Self {
        Self {
            request: u16::from(b[0]) << 8 | u16::from(b[1]),
            value: u16::from_le_bytes([b[2], b[3]]),
            index: u16::from_le_bytes([b[4], b[5]]),
            length: u16::from_le_bytes([b[6], b[7]]),
        }
    }

    pub fn request_type(&self) -> u8 {
        (self.request >> 8) as u8
    }

    pub fn request_code(&self) -> u8 {
        self.request as u8
    }

    pub fn is_device_to_host(&self) -> bool {
        self.request_type() & 0x80 != 0
    }
}

/// State common to every emulated USB device.
#[derive(Debug, Clone)]
pub struct UsbDeviceState {
    pub addr: u8,
    pub attached: bool,
    pub state: DeviceState,
    pub speed: UsbSpeed,
    pub remote_wakeup: bool,
    pub product_desc: String,

    pub(crate) setup_buf: [u8; 8],
    pub(crate) data_buf: Vec<u8>,
    pub(crate) setup_state: SetupState,
    pub(crate) setup_len: usize,
    pub(crate) setup_index: usize,

    ep_ctl: UsbEndpoint,
    ep_in: Vec<UsbEndpoint>,
    ep_out: Vec<UsbEndpoint>,
}

impl UsbDeviceState {
    pub fn new(speed: UsbSpeed, product_desc: impl Into<String>) -> Self {
        let bank = |pid| {
            (1..=MAX_ENDPOINTS)
                .map(|n| UsbEndpoint::new(pid, n, TransferType::Invalid))
                .collect()
        };
        Self {
            addr: 0,
            attached: false,
            state: DeviceState::NotAttached,
            speed,
            remote_wakeup: false,
            product_desc: product_desc.into(),
            setup_buf: [0; 8],
            data_buf: vec![0; DATA_BUF_SIZE],
            setup_state: SetupState::Idle,
            setup_len: 0,
            setup_index: 0,
            ep_ctl: UsbEndpoint::new(UsbPid::Setup, 0, TransferType::Control),
            ep_in: bank(UsbPid::In),
            ep_out: bank(UsbPid::Out),
        }
    }

    pub fn setup_state(&self) -> SetupState {
        self.setup_state
    }

    /// Endpoint-zero data buffer, for devices that finish a control request asynchronously.
    pub fn data_buf_mut(&mut self) -> &mut [u8] {
        &mut self.data_buf
    }

    /// # Panics
    ///
    /// Panics if the endpoint number is above 15.
    pub fn endpoint(&self, key: EndpointKey) -> &UsbEndpoint {
        if key.is_control() {
            return &self.ep_ctl;
        }
        let idx = Self::bank_index(key);
        match key.direction() {
            UsbPid::In => &self.ep_in[idx],
            _ => &self.ep_out[idx],
        }
    }

    /// # Panics
    ///
    /// Panics if the endpoint number is above 15.
    pub fn endpoint_mut(&mut self, key: EndpointKey) -> &mut UsbEndpoint {
        if key.is_control() {
            return &mut self.ep_ctl;
        }
        let idx = Self::bank_index(key);
        match key.direction() {
            UsbPid::In => &mut self.ep_in[idx],
            _ => &mut self.ep_out[idx],
        }
    }

    /// Every endpoint, control endpoint first.
    pub fn endpoints(&self) -> impl Iterator<Item = &UsbEndpoint> {
        std::iter::once(&self.ep_ctl)
            .chain(self.ep_in.iter())
            .chain(self.ep_out.iter())
    }

    pub fn configure_endpoint(
        &mut self,
        pid: UsbPid,
        number: u8,
        transfer_type: TransferType,
        max_packet_size: u16,
    ) {
        let ep = self.endpoint_mut(EndpointKey::new(pid, number));
        ep.transfer_type = transfer_type;
        ep.max_packet_size = max_packet_size;
    }

    fn bank_index(key: EndpointKey) -> usize {
        assert!(
            key.number <= MAX_ENDPOINTS,
            "invalid endpoint number {}",
            key.number
        );
        usize::from(key.number - 1)
    }
}

/// Capability interface of an attachable USB peripheral.
///
/// Only [`state`](UsbDevice::state), [`state_mut`](UsbDevice::state_mut) and
/// [`handle_control`](UsbDevice::handle_control) are mandatory; endpoint-zero framing (SETUP/DATA/
/// STATUS stages) is handled by the packet layer and devices only see whole requests.
pub trait UsbDevice {
    fn state(&self) -> &UsbDeviceState;
    fn state_mut(&mut self) -> &mut UsbDeviceState;

    /// Handles a decoded control request.
    ///
    /// `data` is the endpoint-zero buffer. For device-to-host requests write the response into it
    /// and set `p.actual_length` to its length; for host-to-device requests it already holds the
    /// data stage. Set `p.status` to report anything other than success.
    fn handle_control(&mut self, p: &mut UsbPacket, req: ControlRequest, data: &mut [u8]);

    fn handle_reset(&mut self) {}

    fn handle_attach(&mut self) {}

    /// Non-control endpoints.
    fn handle_data(&mut self, p: &mut UsbPacket) {
        p.status = crate::packet::UsbStatus::Stall;
    }

    /// Looks up a downstream device (hubs only).
    fn find_device(&mut self, _addr: u8) -> Option<crate::port::UsbDeviceHandle> {
        None
    }

    /// An asynchronous packet owned by this device was canceled by the host.
    fn cancel_packet(&mut self, _p: &UsbPacket) {}

    fn endpoint_stopped(&mut self, _ep: EndpointKey) {}

    /// Kicks any transfers queued behind a packet that just went asynchronous.
    fn flush_endpoint_queue(&mut self, _ep: EndpointKey) {}

    fn speed(&self) -> UsbSpeed {
        self.state().speed
    }

    fn is_host_passthrough(&self) -> bool {
        false
    }
}

/// Puts an attached device back into the default state after a bus reset.
pub fn reset_device(dev: &mut dyn UsbDevice) {
    let state = dev.state_mut();
    if !state.attached {
        return;
    }
    state.remote_wakeup = false;
    state.addr = 0;
    state.state = DeviceState::Default;
    state.setup_state = SetupState::Idle;
    dev.handle_reset();
}
