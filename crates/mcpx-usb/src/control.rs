//! Endpoint-zero control transfer framing.
//!
//! SETUP, DATA and STATUS stages arrive as separate packets; this module tracks the stage in the
//! device's [`SetupState`] and calls [`UsbDevice::handle_control`] once per request, either when the
//! SETUP arrives (device-to-host) or when the host starts the status stage (host-to-device).

use tracing::trace;

use crate::device::{ControlRequest, SetupState, UsbDevice, DATA_BUF_SIZE};
use crate::packet::{UsbPacket, UsbStatus};

fn dispatch(dev: &mut dyn UsbDevice, p: &mut UsbPacket, req: ControlRequest) {
    let mut data = std::mem::take(&mut dev.state_mut().data_buf);
    dev.handle_control(p, req, &mut data);
    dev.state_mut().data_buf = data;
}

fn current_request(dev: &dyn UsbDevice) -> ControlRequest {
    ControlRequest::from_bytes(dev.state().setup_buf)
}

fn stall(dev: &mut dyn UsbDevice, p: &mut UsbPacket) {
    trace!(setup_state = ?dev.state().setup_state, pid = ?p.pid(), "control token stalled");
    dev.state_mut().setup_state = SetupState::Idle;
    p.status = UsbStatus::Stall;
}

pub(crate) fn do_token_setup(dev: &mut dyn UsbDevice, p: &mut UsbPacket) {
    if p.size() != 8 {
        p.status = UsbStatus::Stall;
        return;
    }

    let mut setup = [0u8; 8];
    p.copy_to_device(&mut setup);
    p.actual_length = 0;

    let req = ControlRequest::from_bytes(setup);
    {
        let state = dev.state_mut();
        state.setup_buf = setup;
        state.setup_len = usize::from(req.length);
        state.setup_index = 0;
    }

    if req.is_device_to_host() {
        dispatch(dev, p, req);
        if p.status == UsbStatus::Async {
            dev.state_mut().setup_state = SetupState::Setup;
        }
        if p.status != UsbStatus::Success {
            return;
        }
        let state = dev.state_mut();
        state.setup_len = state.setup_len.min(p.actual_length);
        state.setup_state = SetupState::Data;
    } else {
        let state = dev.state_mut();
        if state.setup_len > DATA_BUF_SIZE {
            p.status = UsbStatus::Stall;
            return;
        }
        state.setup_state = if state.setup_len == 0 {
            SetupState::Ack
        } else {
            SetupState::Data
        };
    }

    p.actual_length = 8;
}

pub(crate) fn do_token_in(dev: &mut dyn UsbDevice, p: &mut UsbPacket) {
    let req = current_request(dev);
    match (dev.state().setup_state, req.is_device_to_host()) {
        (SetupState::Ack, false) => {
            dispatch(dev, p, req);
            if p.status == UsbStatus::Async {
                return;
            }
            dev.state_mut().setup_state = SetupState::Idle;
            p.actual_length = 0;
        }
        (SetupState::Data, true) => {
            let state = dev.state_mut();
            let len = (state.setup_len - state.setup_index).min(p.remaining());
            let start = state.setup_index;
            p.copy_from_device(&state.data_buf[start..start + len]);
            state.setup_index += len;
            if state.setup_index >= state.setup_len {
                state.setup_state = SetupState::Ack;
            }
        }
        _ => stall(dev, p),
    }
}

pub(crate) fn do_token_out(dev: &mut dyn UsbDevice, p: &mut UsbPacket) {
    let req = current_request(dev);
    match (dev.state().setup_state, req.is_device_to_host()) {
        (SetupState::Ack, true) => {
            dev.state_mut().setup_state = SetupState::Idle;
            p.actual_length = 0;
        }
        (SetupState::Data, false) => {
            let state = dev.state_mut();
            let len = (state.setup_len - state.setup_index).min(p.remaining());
            let start = state.setup_index;
            p.copy_to_device(&mut state.data_buf[start..start + len]);
            state.setup_index += len;
            if state.setup_index >= state.setup_len {
                state.setup_state = SetupState::Ack;
            }
        }
        _ => stall(dev, p),
    }
}

/// Host-resident control transfer: the request travels in `p.parameter` instead of a SETUP token.
pub(crate) fn do_parameter(dev: &mut dyn UsbDevice, p: &mut UsbPacket) {
    let setup = p.parameter.to_le_bytes();
    let req = ControlRequest::from_bytes(setup);
    let len = usize::from(req.length);
    {
        let state = dev.state_mut();
        state.setup_buf = setup;
        state.setup_state = SetupState::Param;
        state.setup_len = len;
        state.setup_index = 0;
    }

    if len > DATA_BUF_SIZE || (!req.is_device_to_host() && len > p.size()) {
        p.status = UsbStatus::Stall;
        return;
    }

    if !req.is_device_to_host() {
        p.copy_to_device(&mut dev.state_mut().data_buf[..len]);
    }

    dispatch(dev, p, req);
    if p.status == UsbStatus::Async {
        return;
    }
    finish_parameter(dev, p, req);
}

fn finish_parameter(dev: &mut dyn UsbDevice, p: &mut UsbPacket, req: ControlRequest) {
    let state = dev.state_mut();
    state.setup_len = state.setup_len.min(p.actual_length);
    if req.is_device_to_host() {
        p.actual_length = 0;
        let len = state.setup_len.min(p.size());
        p.copy_from_device(&state.data_buf[..len]);
    }
}

/// Advances the stage machine for a control request the device completed asynchronously.
pub(crate) fn complete_async(dev: &mut dyn UsbDevice, p: &mut UsbPacket) {
    if p.status != UsbStatus::Success {
        dev.state_mut().setup_state = SetupState::Idle;
        return;
    }
    match dev.state().setup_state {
        SetupState::Setup => {
            let state = dev.state_mut();
            state.setup_len = state.setup_len.min(p.actual_length);
            state.setup_state = SetupState::Data;
            p.actual_length = 8;
        }
        SetupState::Ack => {
            dev.state_mut().setup_state = SetupState::Idle;
            p.actual_length = 0;
        }
        SetupState::Param => {
            let req = current_request(dev);
            finish_parameter(dev, p, req);
        }
        SetupState::Idle | SetupState::Data => {}
    }
}
