// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Locates USB DFU interfaces and prepares sessions with them.
//!
//! Based on [`rusb`](https://docs.rs/rusb/latest/rusb/) for USB communication,
//! this crate provides what a host application needs before it can transfer
//! firmware to a device using USB DFU:
//!
//! - Device discovery, returning each device with its configurations,
//!   interfaces and alternate settings
//! - Selection of DFU interfaces (runtime and DFU mode) among those
//! - Decoding of raw device, configuration, interface and DFU functional
//!   descriptors
//! - String descriptor reads, including the supported language query, and an
//!   index of interface names across all configurations
//! - A [`DeviceSession`] which selects the right configuration, interface and
//!   alternate setting, and issues DFU class requests such as DFU_DETACH
//! - Waiting for a device to disconnect after detaching
//!
//! All calls block - wrap in `tokio::task::spawn_blocking` for async
//! runtimes.
//!
//! The host USB stack sits behind the [`Transport`] trait.  [`RusbTransport`]
//! is the implementation for real devices.
//!
//! # Usage
//!
//! ```no_run
//! use dfu_session::{find_devices, find_dfu_interfaces, read_interface_names};
//! use dfu_session::{DeviceSession, Transport};
//!
//! let mut transport = find_devices().unwrap().remove(0);
//! transport.open().unwrap();
//! let names = read_interface_names(&mut transport).unwrap();
//!
//! let mut settings = find_dfu_interfaces(transport.configurations());
//! for setting in settings.iter_mut() {
//!     setting.apply_names(&names);
//!     println!("{}", setting);
//! }
//!
//! let mut session = DeviceSession::new(transport, settings.remove(0));
//! session.open().unwrap();
//! println!("DFU state: {}", session.get_state().unwrap());
//! session.close();
//! ```
//!
//! See [`DeviceSession`] for more.

pub mod descriptor;
mod error;
mod locate;
#[cfg(test)]
mod mock;
pub mod protocol;
mod rusb_transport;
mod session;
pub mod strings;
mod transport;

pub use error::{Error, HostError, Result};
pub use locate::{find_dfu_interfaces, DfuMode, InterfaceSetting};
pub use rusb_transport::{find_devices, DeviceInfo, RusbTransport, DEFAULT_USB_TIMEOUT};
pub use session::{DeviceSession, SessionState};
pub use strings::{
    read_configuration_descriptor, read_device_descriptor, read_interface_names,
    read_string_descriptor, resolve_languages, resolve_text, InterfaceNames,
};
pub use transport::{
    AlternateInfo, ConfigurationInfo, ControlIn, ControlSetup, DisconnectSubscription,
    InterfaceInfo, Recipient, RequestType, TransferStatus, Transport,
};
