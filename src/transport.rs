// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! The boundary to the host USB stack.
//!
//! [`Transport`] is the set of primitives a [`DeviceSession`] and the string
//! resolver need from a host USB stack.  [`RusbTransport`] implements it on
//! top of `rusb`; tests implement it with a scripted mock.
//!
//! [`DeviceSession`]: crate::DeviceSession
//! [`RusbTransport`]: crate::RusbTransport

use std::fmt;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::error::HostError;

/// Request type field of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
}

/// Recipient field of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
}

/// Setup stage of a control transfer, minus direction and length, which are
/// implied by the transfer call made with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// Encodes `bmRequestType` for this setup in the given direction.
    pub fn bm_request_type(&self, device_to_host: bool) -> u8 {
        let direction = if device_to_host { 0x80 } else { 0x00 };
        let request_type = match self.request_type {
            RequestType::Standard => 0x00,
            RequestType::Class => 0x20,
            RequestType::Vendor => 0x40,
        };
        let recipient = match self.recipient {
            Recipient::Device => 0x00,
            Recipient::Interface => 0x01,
            Recipient::Endpoint => 0x02,
        };
        direction | request_type | recipient
    }
}

/// Completion status of a control transfer that reached the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Ok,
    /// The device stalled the request.
    Stall,
    /// The device returned more data than requested.
    Babble,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Ok => write!(f, "ok"),
            TransferStatus::Stall => write!(f, "stall"),
            TransferStatus::Babble => write!(f, "babble"),
        }
    }
}

/// Result of a control transfer IN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlIn {
    pub status: TransferStatus,
    pub data: Vec<u8>,
}

/// One alternate setting, as enumerated by the host without reading raw
/// descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateInfo {
    pub setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Interface name, if the host has already resolved it.
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alternates: Vec<AlternateInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationInfo {
    /// `bConfigurationValue`
    pub value: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

/// A registration for the disconnect notification of one device.
///
/// The listener is deregistered when the subscription is dropped or
/// cancelled, whichever way the wait on it ended.
pub struct DisconnectSubscription {
    events: Receiver<()>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DisconnectSubscription {
    /// Creates a subscription that completes when a value arrives on
    /// `events`.  `release` deregisters the listener and runs exactly once.
    pub fn new<F>(events: Receiver<()>, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        DisconnectSubscription {
            events,
            release: Some(Box::new(release)),
        }
    }

    /// Blocks until the device disconnects, or until `timeout` elapses if one
    /// is given.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), RecvTimeoutError> {
        match timeout {
            Some(timeout) => self.events.recv_timeout(timeout),
            None => self
                .events
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        }
    }

    /// Deregisters the listener now.
    pub fn cancel(self) {}
}

impl Drop for DisconnectSubscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for DisconnectSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectSubscription")
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Host USB stack primitives for a single device.
///
/// Implementations are expected to serialize control transfers on the
/// device handle.  All calls block until the host stack completes them.
pub trait Transport {
    /// Opens the device handle.
    fn open(&mut self) -> Result<(), HostError>;

    fn close(&mut self) -> Result<(), HostError>;

    /// The device's configurations, interfaces and alternate settings as
    /// enumerated by the host.
    fn configurations(&self) -> &[ConfigurationInfo];

    /// `bConfigurationValue` of the active configuration, if any.
    fn active_configuration(&self) -> Option<u8>;

    fn select_configuration(&mut self, value: u8) -> Result<(), HostError>;

    fn is_claimed(&self, interface: u8) -> bool;

    fn claim_interface(&mut self, interface: u8) -> Result<(), HostError>;

    /// Alternate setting currently selected on `interface`, if known.
    fn current_alternate(&self, interface: u8) -> Option<u8>;

    fn select_alternate_interface(&mut self, interface: u8, alternate: u8)
        -> Result<(), HostError>;

    fn control_transfer_in(&mut self, setup: ControlSetup, length: u16)
        -> Result<ControlIn, HostError>;

    fn control_transfer_out(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<TransferStatus, HostError>;

    /// Registers for this device's disconnect notification.
    fn subscribe_disconnect(&mut self) -> Result<DisconnectSubscription, HostError>;

    /// Number of alternate settings `interface` exposes in the active
    /// configuration.
    fn alternate_count(&self, interface: u8) -> usize {
        let Some(active) = self.active_configuration() else {
            return 0;
        };
        self.configurations()
            .iter()
            .find(|c| c.value == active)
            .and_then(|c| c.interfaces.iter().find(|i| i.number == interface))
            .map(|i| i.alternates.len())
            .unwrap_or(0)
    }
}
