//! USB host-side emulation for the MCPX south bridge.
//!
//! The crate is split into a controller-agnostic core and the OHCI controller model:
//! - [`packet`]: in-flight transfers, endpoint queues and the dispatch entry point,
//! - [`device`]: the capability trait every attachable peripheral implements, plus the shared
//!   per-device state (address, endpoint arrays, endpoint-zero control scratch state),
//! - [`port`]: non-owning attachment points,
//! - [`ohci`]: the OHCI register file, root hub and per-frame ED/TD list processing.

mod control;
pub mod device;
pub mod endpoint;
mod error;
pub mod ohci;
pub mod packet;
pub mod port;

pub use device::{
    reset_device, ControlRequest, DeviceState, SetupState, UsbDevice, UsbDeviceState, UsbSpeed,
};
pub use endpoint::{EndpointKey, TransferType, UsbEndpoint};
pub use error::UsbError;
pub use ohci::{OhciConfig, OhciController};
pub use packet::{
    cancel_packet, complete_packet, handle_packet, PacketState, UsbPacket, UsbPid, UsbStatus,
};
pub use port::{find_device, UsbDeviceHandle, UsbPort};
