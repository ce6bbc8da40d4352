// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Error types.

use rusb::Error as RusbError;
use std::time::Duration;
use thiserror::Error;

use crate::transport::TransferStatus;

/// Failure reported by a [`Transport`](crate::Transport) implementation.
///
/// This is distinct from a control transfer that completes with a non-ok
/// [`TransferStatus`], which is reported as part of the transfer result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
    /// The device rejected a SET_INTERFACE that would not have changed the
    /// selected alternate setting.
    #[error("redundant interface selection rejected by device")]
    RedundantInterfaceSelection,
    /// The device is no longer present.
    #[error("device disconnected")]
    Disconnected,
    /// A request needing an open handle was made before `open()`.
    #[error("device not open")]
    NotOpen,
    #[error("{0}")]
    Usb(#[from] RusbError),
}

/// Error type
///
/// Many of the errors are wrappers around [`HostError`], and so often around
/// `rusb::Error`.  [`Error::usb_stack_error()`] can be used to retrieve the
/// underlying USB stack error for further analysis, or test whether the
/// failure was a USB stack one.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A descriptor buffer was too short for a declared length or header.
    #[error("malformed descriptor at offset {offset}: {reason}")]
    MalformedDescriptor { offset: usize, reason: &'static str },
    /// A control transfer completed with a non-ok status.
    #[error("control transfer failed with status {status}")]
    Transfer { status: TransferStatus },
    /// Language id 0 asks for the supported languages and has no text.
    #[error("language id 0 is the language query, not a text language")]
    LanguageQuery,
    /// A DFU class request returned fewer bytes than its reply needs.
    #[error("DFU request 0x{request:02X} returned {length} bytes")]
    ShortResponse { request: u8, length: usize },
    /// The device disconnected; the session cannot be used again.
    #[error("device disconnected")]
    Disconnected,
    /// A string descriptor could not be resolved.
    #[error("failed to read string descriptor {index}: {source}")]
    StringResolution { index: u8, source: Box<Error> },
    /// Selecting the alternate setting failed.
    #[error("failed to select alternate setting {alternate} of interface {interface}: {source}")]
    InterfaceSelection {
        interface: u8,
        alternate: u8,
        source: HostError,
    },
    /// The device did not disconnect before the deadline.
    #[error("disconnect timeout of {0:?} expired")]
    Timeout(Duration),
    /// DFU Device not found
    #[error("DFU device not found")]
    DeviceNotFound,
    /// DFU status error returned by device
    #[error("DFU status error: error code {error}, state {state}")]
    DfuStatus { error: u8, state: u8 },
    /// Device reported a DFU state outside the ones DFU 1.1 defines
    #[error("unknown DFU state {0}")]
    UnknownState(u8),
    #[error("USB context error: {0}")]
    UsbContext(RusbError),
    #[error("USB device enumeration error: {0}")]
    UsbDeviceEnumeration(RusbError),
    #[error("device open error: {0}")]
    Open(HostError),
    #[error("set configuration error: {0}")]
    SelectConfiguration(HostError),
    #[error("claim interface error: {0}")]
    ClaimInterface(HostError),
    #[error("control transfer error: {0}")]
    ControlTransfer(HostError),
    #[error("disconnect subscription error: {0}")]
    Subscribe(HostError),
}

impl Error {
    /// Returns the underlying USB stack error if applicable.
    pub fn usb_stack_error(&self) -> Option<&RusbError> {
        match self {
            Error::UsbContext(e) | Error::UsbDeviceEnumeration(e) => Some(e),
            Error::Open(e)
            | Error::SelectConfiguration(e)
            | Error::ClaimInterface(e)
            | Error::ControlTransfer(e)
            | Error::Subscribe(e)
            | Error::InterfaceSelection { source: e, .. } => match e {
                HostError::Usb(e) => Some(e),
                _ => None,
            },
            Error::StringResolution { source, .. } => source.usb_stack_error(),
            _ => None,
        }
    }

    pub(crate) fn malformed(offset: usize, reason: &'static str) -> Self {
        Error::MalformedDescriptor { offset, reason }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
