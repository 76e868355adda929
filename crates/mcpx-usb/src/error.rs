use thiserror::Error;

use crate::device::UsbSpeed;

/// Errors reported to machine-assembly and hotplug code.
///
/// Guest-visible failures never use this type; they are reported through packet status codes and
/// controller interrupts instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    #[error("port {port} is out of range (controller has {count} ports)")]
    PortOutOfRange { port: usize, count: usize },

    #[error("port {0} already has a device attached")]
    PortOccupied(usize),

    #[error("port {0} has no device attached")]
    PortEmpty(usize),

    #[error("port {port} does not support {speed:?}-speed devices")]
    UnsupportedSpeed { port: usize, speed: UsbSpeed },

    #[error("hub chain deeper than {max} levels")]
    HubChainTooDeep { max: u8 },
}
