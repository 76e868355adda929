use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::device::{DeviceState, UsbDevice, UsbSpeed};
use crate::error::UsbError;

/// Shared handle to an attachable peripheral. The machine owns the strong reference; ports only
/// hold weak ones.
pub type UsbDeviceHandle = Rc<RefCell<dyn UsbDevice>>;

/// Deepest hub nesting a port path can describe.
pub const MAX_HUB_CHAIN: u8 = 5;

/// Attachment point on a root hub or downstream hub.
#[derive(Debug, Clone)]
pub struct UsbPort {
    device: Option<Weak<RefCell<dyn UsbDevice>>>,
    pub speed_mask: u8,
    pub index: usize,
    hub_count: u8,
    path: String,
}

impl UsbPort {
    /// Root-hub port `index` (zero-based). Its path is the one-based port number.
    pub fn new(index: usize, speed_mask: u8) -> Self {
        Self {
            device: None,
            speed_mask,
            index,
            hub_count: 0,
            path: (index + 1).to_string(),
        }
    }

    /// Port `index` of a hub plugged into `self`.
    pub fn downstream(&self, index: usize, speed_mask: u8) -> Result<Self, UsbError> {
        if self.hub_count >= MAX_HUB_CHAIN {
            return Err(UsbError::HubChainTooDeep {
                max: MAX_HUB_CHAIN,
            });
        }
        Ok(Self {
            device: None,
            speed_mask,
            index,
            hub_count: self.hub_count + 1,
            path: format!("{}.{}", self.path, index + 1),
        })
    }

    /// Dotted location, e.g. `"1.3"` for port 3 of a hub on root port 1.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn hub_count(&self) -> u8 {
        self.hub_count
    }

    pub fn supports(&self, speed: UsbSpeed) -> bool {
        self.speed_mask & speed.mask() != 0
    }

    /// The attached device, if it is still alive.
    pub fn device(&self) -> Option<UsbDeviceHandle> {
        self.device.as_ref().and_then(Weak::upgrade)
    }

    pub fn has_device(&self) -> bool {
        self.device().is_some()
    }

    /// A device was plugged in here and dropped without being detached.
    pub fn is_stale(&self) -> bool {
        self.device.is_some() && !self.has_device()
    }

    /// Whether `dev` refers to the device plugged in here, alive or not.
    pub(crate) fn holds(&self, dev: &Weak<RefCell<dyn UsbDevice>>) -> bool {
        self.device.as_ref().is_some_and(|own| Weak::ptr_eq(own, dev))
    }

    pub(crate) fn set_device(&mut self, dev: &UsbDeviceHandle) {
        self.device = Some(Rc::downgrade(dev));
    }

    pub(crate) fn clear_device(&mut self) {
        self.device = None;
    }
}

/// Resolves a bus address behind `port`, descending into hubs.
pub fn find_device(port: &UsbPort, addr: u8) -> Option<UsbDeviceHandle> {
    let dev = port.device()?;
    let downstream = {
        let mut d = dev.try_borrow_mut().ok()?;
        let state = d.state();
        if !state.attached || state.state != DeviceState::Default {
            return None;
        }
        if state.addr == addr {
            None
        } else {
            Some(d.find_device(addr))
        }
    };
    match downstream {
        None => Some(dev),
        Some(found) => found,
    }
}
