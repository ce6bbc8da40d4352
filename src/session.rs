// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! A session with one DFU interface of one device.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use crate::error::{Error, HostError, Result};
use crate::locate::InterfaceSetting;
use crate::protocol::{
    DfuState, DfuStatus, DFU_ABORT, DFU_CLRSTATUS, DFU_DETACH, DFU_GETSTATE, DFU_GETSTATUS,
};
use crate::transport::{ControlSetup, Recipient, RequestType, TransferStatus, Transport};

/// Lifecycle of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Active,
    Closing,
    /// The device went away.  The session cannot be used again.
    Disconnected,
}

/// DFU interface session
///
/// Binds a [`Transport`] to one [`InterfaceSetting`].  Create one per chosen
/// setting, [`open()`](DeviceSession::open) it, issue requests, then
/// [`close()`](DeviceSession::close) it.
///
/// Requests borrow the session mutably and block until the transport
/// completes them, so only one is ever outstanding.
///
/// Example:
/// ```no_run
/// use dfu_session::{find_devices, find_dfu_interfaces, DeviceSession, Transport};
///
/// let mut transports = find_devices().unwrap();
/// let transport = transports.remove(0);
/// let setting = find_dfu_interfaces(transport.configurations()).remove(0);
///
/// let mut session = DeviceSession::new(transport, setting);
/// session.open().unwrap();
/// session.detach(1000).unwrap();
/// session.close();
/// ```
pub struct DeviceSession<T: Transport> {
    transport: T,
    setting: InterfaceSetting,
    interface: u8,
    connected: bool,
    state: SessionState,
}

impl<T: Transport> fmt::Display for DeviceSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.setting, self.state)
    }
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(transport: T, setting: InterfaceSetting) -> Self {
        let interface = setting.interface;
        DeviceSession {
            transport,
            setting,
            interface,
            connected: true,
            state: SessionState::Closed,
        }
    }

    pub fn setting(&self) -> &InterfaceSetting {
        &self.setting
    }

    pub fn interface_number(&self) -> u8 {
        self.interface
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Opens the device and selects the bound configuration, interface and
    /// alternate setting.
    ///
    /// Only the selections that differ from the device's current state are
    /// made, so calling this again on an active session is cheap.  The
    /// exception is an interface with several alternate settings, which is
    /// always reselected as some devices silently default to alternate 0.
    ///
    /// Fails with [`Error::Disconnected`] once the device has gone.
    pub fn open(&mut self) -> Result<()> {
        self.ensure_connected()?;
        trace!("Opening DFU session: {}", self.setting);
        self.state = SessionState::Opening;
        match self.configure() {
            Ok(()) => {
                self.state = SessionState::Active;
                debug!("DFU session active: {}", self.setting);
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    fn configure(&mut self) -> Result<()> {
        self.transport.open().map_err(Error::Open)?;

        let config = self.setting.configuration;
        if self.transport.active_configuration() != Some(config) {
            trace!("Selecting configuration {}", config);
            self.transport
                .select_configuration(config)
                .map_err(Error::SelectConfiguration)?;
        }

        let intf = self.interface;
        if !self.transport.is_claimed(intf) {
            trace!("Claiming interface {}", intf);
            self.transport
                .claim_interface(intf)
                .map_err(Error::ClaimInterface)?;
        }

        let alt = self.setting.alternate;
        if self.transport.current_alternate(intf) != Some(alt)
            || self.transport.alternate_count(intf) > 1
        {
            trace!("Selecting alt setting {} on interface {}", alt, intf);
            if let Err(e) = self.transport.select_alternate_interface(intf, alt) {
                let redundant = e == HostError::RedundantInterfaceSelection
                    && self.transport.current_alternate(intf) == Some(alt);
                if !redundant {
                    return Err(Error::InterfaceSelection {
                        interface: intf,
                        alternate: alt,
                        source: e,
                    });
                }
                warn!(
                    "Redundant SET_INTERFACE request to select alt setting {} failed",
                    alt
                );
            }
        } else {
            debug!("Alt setting {} already selected", alt);
        }

        Ok(())
    }

    /// Closes the device.  Failures are logged and otherwise ignored.
    pub fn close(&mut self) {
        trace!("Closing DFU session: {}", self.setting);
        if self.state != SessionState::Disconnected {
            self.state = SessionState::Closing;
        }
        if let Err(e) = self.transport.close() {
            warn!("Failed to close device: {}", e);
        }
        if self.state != SessionState::Disconnected {
            self.state = SessionState::Closed;
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state {
            SessionState::Disconnected => Err(Error::Disconnected),
            _ => Ok(()),
        }
    }

    fn class_setup(&self, request: u8, value: u16) -> ControlSetup {
        ControlSetup {
            request_type: RequestType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: u16::from(self.interface),
        }
    }

    /// Issues a class request to the interface with `data` as the data
    /// stage.
    pub fn request_out(&mut self, request: u8, data: &[u8], value: u16) -> Result<&T> {
        self.ensure_connected()?;
        trace!(
            "DFU request 0x{:02X} OUT, value {}, {} bytes",
            request,
            value,
            data.len()
        );
        let setup = self.class_setup(request, value);
        let status = self
            .transport
            .control_transfer_out(setup, data)
            .map_err(Error::ControlTransfer)?;
        match status {
            TransferStatus::Ok => Ok(&self.transport),
            status => Err(Error::Transfer { status }),
        }
    }

    /// Issues a class request to the interface, reading up to `length`
    /// bytes.
    pub fn request_in(&mut self, request: u8, length: u16, value: u16) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        trace!(
            "DFU request 0x{:02X} IN, value {}, {} bytes",
            request,
            value,
            length
        );
        let setup = self.class_setup(request, value);
        let result = self
            .transport
            .control_transfer_in(setup, length)
            .map_err(Error::ControlTransfer)?;
        match result.status {
            TransferStatus::Ok => Ok(result.data),
            status => Err(Error::Transfer { status }),
        }
    }

    /// Sends DFU_DETACH.  The device waits up to `timeout_ms` for a reset
    /// before reverting to normal operation.
    pub fn detach(&mut self, timeout_ms: u16) -> Result<&T> {
        debug!("Sending DFU detach, timeout {}ms", timeout_ms);
        self.request_out(DFU_DETACH, &[], timeout_ms)
    }

    /// Reads DFU_GETSTATUS.  Fails with [`Error::DfuStatus`] if the device
    /// reports an error.
    pub fn get_status(&mut self) -> Result<DfuStatus> {
        let data = self.request_in(DFU_GETSTATUS, DfuStatus::LENGTH as u16, 0)?;
        let status = DfuStatus::from_bytes(&data).ok_or(Error::ShortResponse {
            request: DFU_GETSTATUS,
            length: data.len(),
        })?;
        trace!("DFU status {} state {}", status.status, status.state);
        if status.is_error() {
            return Err(Error::DfuStatus {
                error: status.status,
                state: status.state,
            });
        }
        Ok(status)
    }

    pub fn get_state(&mut self) -> Result<DfuState> {
        let data = self.request_in(DFU_GETSTATE, 1, 0)?;
        let state = *data.first().ok_or(Error::ShortResponse {
            request: DFU_GETSTATE,
            length: 0,
        })?;
        DfuState::try_from(state).map_err(Error::UnknownState)
    }

    pub fn clear_status(&mut self) -> Result<()> {
        trace!("Clearing DFU status");
        self.request_out(DFU_CLRSTATUS, &[], 0)?;
        Ok(())
    }

    pub fn abort(&mut self) -> Result<()> {
        trace!("Sending DFU abort");
        self.request_out(DFU_ABORT, &[], 0)?;
        Ok(())
    }

    /// Waits for the device to disconnect, typically after a detach.
    ///
    /// With no timeout, or a zero one, waits for as long as it takes.
    /// Otherwise fails with [`Error::Timeout`] if the device is still
    /// connected when `timeout` expires.  The disconnect listener is removed
    /// before this returns, whatever the outcome.
    pub fn wait_disconnected(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        trace!("Waiting for disconnect, timeout {:?}", timeout);

        let subscription = self
            .transport
            .subscribe_disconnect()
            .map_err(Error::Subscribe)?;
        let outcome = subscription.wait(timeout);
        subscription.cancel();

        match outcome {
            Ok(()) => {
                debug!("Device disconnected");
                self.connected = false;
                self.state = SessionState::Disconnected;
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => match timeout {
                Some(timeout) if self.connected => Err(Error::Timeout(timeout)),
                _ => Ok(()),
            },
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Subscribe(HostError::Disconnected))
            }
        }
    }
}
