//! OHCI root hub: HcRhStatus, HcRhPortStatus and device hotplug.

use tracing::{debug, trace};

use super::regs::*;
use super::OhciController;
use crate::device::{reset_device, DeviceState, UsbSpeed};
use crate::error::UsbError;
use crate::port::{UsbDeviceHandle, UsbPort};

#[derive(Debug, Clone)]
pub(super) struct OhciPort {
    pub(super) port: UsbPort,
    /// HcRhPortStatus value.
    pub(super) ctrl: u32,
}

impl OhciPort {
    pub(super) fn new(index: usize, speed_mask: u8) -> Self {
        Self {
            port: UsbPort::new(index, speed_mask),
            ctrl: 0,
        }
    }

    fn attached_speed(&self) -> Option<UsbSpeed> {
        let dev = self.port.device()?;
        let dev = dev.borrow();
        dev.state().attached.then(|| dev.speed())
    }
}

impl OhciController {
    pub(super) fn root_hub_reset(&mut self) {
        self.bus_stop();
        self.rhdesc_a = RHA_NPS | self.ports.len() as u32;
        self.rhdesc_b = 0;
        self.rhstatus = 0;

        for i in 0..self.ports.len() {
            // No power switching: ports come out of reset powered.
            self.ports[i].ctrl = PORT_PPS;
            if self.ports[i].attached_speed().is_some() {
                self.port_connect(i);
                if let Some(dev) = self.ports[i].port.device() {
                    reset_device(&mut *dev.borrow_mut());
                }
            }
        }
        self.cancel_async();
        self.stop_endpoints();
        debug!("OHCI root hub reset");
    }

    /// HcRhStatus write.
    pub(super) fn set_hub_status(&mut self, val: u32) {
        let old = self.rhstatus;
        let old_ports: Vec<u32> = self.ports.iter().map(|p| p.ctrl).collect();

        if val & RHS_OCIC != 0 {
            self.rhstatus &= !RHS_OCIC;
        }
        if val & RHS_LPS != 0 {
            for i in 0..self.ports.len() {
                self.port_power(i, false);
            }
            debug!("root hub powered off");
        }
        if val & RHS_LPSC != 0 {
            for i in 0..self.ports.len() {
                self.port_power(i, true);
            }
            debug!("root hub powered on");
        }
        if val & RHS_DRWE != 0 {
            self.rhstatus |= RHS_DRWE;
        }
        if val & RHS_CRWE != 0 {
            self.rhstatus &= !RHS_DRWE;
        }

        let ports_changed = self
            .ports
            .iter()
            .zip(old_ports)
            .any(|(port, old)| port.ctrl != old);
        if old != self.rhstatus || ports_changed {
            self.set_interrupt(INTR_RHSC);
        }
    }

    /// HcRhPortStatus write.
    pub(super) fn port_set_status(&mut self, i: usize, val: u32) {
        let old = self.ports[i].ctrl;

        self.ports[i].ctrl &= !(val & PORT_WTC);

        // ClearPortEnable.
        if val & PORT_CCS != 0 {
            self.ports[i].ctrl &= !PORT_PES;
        }

        self.port_set_if_connected(i, val & PORT_PES);

        if self.port_set_if_connected(i, val & PORT_PSS) {
            trace!(port = i, "port suspended");
        }

        if self.port_set_if_connected(i, val & PORT_PRS) {
            trace!(port = i, "port reset");
            if let Some(dev) = self.ports[i].port.device() {
                reset_device(&mut *dev.borrow_mut());
            }
            let port = &mut self.ports[i];
            port.ctrl &= !PORT_PRS;
            port.ctrl |= PORT_PES | PORT_PRSC;
        }

        // ClearPortPower / SetPortPower share bits with LSDA / PPS.
        if val & PORT_LSDA != 0 {
            self.port_power(i, false);
        }
        if val & PORT_PPS != 0 {
            self.port_power(i, true);
        }

        if old != self.ports[i].ctrl {
            self.set_interrupt(INTR_RHSC);
        }
    }

    /// Sets `bit` only if a device is connected; a request on an empty port latches a connect
    /// status change instead. Returns whether the bit went from clear to set.
    fn port_set_if_connected(&mut self, i: usize, bit: u32) -> bool {
        if bit == 0 {
            return false;
        }
        let port = &mut self.ports[i];
        if port.ctrl & PORT_PPS == 0 {
            return false;
        }
        if port.ctrl & PORT_CCS == 0 {
            port.ctrl |= PORT_CSC;
            return false;
        }
        let was_set = port.ctrl & bit != 0;
        port.ctrl |= bit;
        !was_set
    }

    fn port_power(&mut self, i: usize, on: bool) {
        if on {
            self.ports[i].ctrl |= PORT_PPS;
            if self.ports[i].ctrl & PORT_CCS == 0 && self.ports[i].attached_speed().is_some() {
                self.port_connect(i);
            }
        } else {
            self.ports[i].ctrl &= !(PORT_PPS | PORT_CCS | PORT_PES | PORT_PSS | PORT_PRS);
        }
    }

    /// Latches a connect on port `i` for the device currently plugged into it.
    fn port_connect(&mut self, i: usize) {
        let Some(speed) = self.ports[i].attached_speed() else {
            return;
        };
        let port = &mut self.ports[i];
        let old = port.ctrl;
        if port.ctrl & PORT_PPS == 0 {
            trace!(port = i, "device connected to unpowered port");
            return;
        }

        port.ctrl |= PORT_CCS | PORT_CSC;
        if speed == UsbSpeed::Low {
            port.ctrl |= PORT_LSDA;
        } else {
            port.ctrl &= !PORT_LSDA;
        }
        let changed = old != port.ctrl;

        if self.ctl & CTL_HCFS == USB_SUSPEND {
            self.set_interrupt(INTR_RD);
        }
        if changed {
            self.set_interrupt(INTR_RHSC);
        }
    }

    fn port_disconnect(&mut self, i: usize) {
        let owns_async = self
            .async_device
            .as_ref()
            .is_some_and(|pending| self.ports[i].port.holds(pending));
        if owns_async {
            self.cancel_async();
        }

        let port = &mut self.ports[i];
        let old = port.ctrl;
        if port.ctrl & PORT_CCS != 0 {
            port.ctrl &= !PORT_CCS;
            port.ctrl |= PORT_CSC;
        }
        if port.ctrl & PORT_PES != 0 {
            port.ctrl &= !PORT_PES;
            port.ctrl |= PORT_PESC;
        }
        if old != port.ctrl {
            self.set_interrupt(INTR_RHSC);
        }
    }

    /// Plugs `dev` into root-hub port `port`.
    ///
    /// The device is marked attached and reported to the guest as a connect; it enters the default
    /// state once the guest resets the port.
    ///
    /// # Panics
    ///
    /// Panics if the device is already attached somewhere else.
    pub fn attach(&mut self, port: usize, dev: &UsbDeviceHandle) -> Result<(), UsbError> {
        let count = self.ports.len();
        let slot = self
            .ports
            .get_mut(port)
            .ok_or(UsbError::PortOutOfRange { port, count })?;
        if slot.port.has_device() {
            return Err(UsbError::PortOccupied(port));
        }
        let speed = dev.borrow().speed();
        if !slot.port.supports(speed) {
            return Err(UsbError::UnsupportedSpeed { port, speed });
        }

        {
            let mut d = dev.borrow_mut();
            let state = d.state_mut();
            assert_eq!(
                state.state,
                DeviceState::NotAttached,
                "device attached twice"
            );
            state.attached = true;
        }
        slot.port.set_device(dev);
        self.port_connect(port);

        let mut d = dev.borrow_mut();
        d.state_mut().state = DeviceState::Attached;
        d.handle_attach();
        debug!(port, ?speed, product = %d.state().product_desc, "USB device attached");
        Ok(())
    }

    /// Unplugs whatever device sits on root-hub port `port`.
    pub fn detach(&mut self, port: usize) -> Result<(), UsbError> {
        let count = self.ports.len();
        let slot = self
            .ports
            .get(port)
            .ok_or(UsbError::PortOutOfRange { port, count })?;
        let Some(dev) = slot.port.device() else {
            if !slot.port.is_stale() {
                return Err(UsbError::PortEmpty(port));
            }
            // Dropped without a detach: report the disconnect and free the port.
            self.port_disconnect(port);
            self.ports[port].port.clear_device();
            debug!(port, "stale USB device detached");
            return Ok(());
        };

        self.port_disconnect(port);
        {
            let mut d = dev.borrow_mut();
            let state = d.state_mut();
            state.state = DeviceState::NotAttached;
            state.attached = false;
        }
        self.ports[port].port.clear_device();
        debug!(port, "USB device detached");
        Ok(())
    }
}
