// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! [`Transport`] on top of `rusb`.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rusb::{
    Context, Device as RusbDevice, DeviceHandle, Error as RusbError, Hotplug, HotplugBuilder,
    UsbContext,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{Error, HostError};
use crate::locate::find_dfu_interfaces;
use crate::transport::{
    AlternateInfo, ConfigurationInfo, ControlIn, ControlSetup, DisconnectSubscription,
    InterfaceInfo, TransferStatus, Transport,
};

// Timeout
pub const DEFAULT_USB_TIMEOUT: Duration = Duration::from_secs(5);

// How often the hotplug event pump checks whether it should stop
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// USB device information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// USB device vendor ID
    pub vid: u16,
    /// USB device product ID
    pub pid: u16,
    /// USB bus number
    pub bus: u8,
    /// USB device address
    pub address: u8,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:0>4X}:{:0>4X}", self.vid, self.pid)
    }
}

/// Enumerates the USB bus and returns a transport for every device exposing
/// at least one DFU interface.
///
/// Devices whose descriptors cannot be read are skipped.  The transports are
/// not yet open.
///
/// Example:
/// ```no_run
/// use dfu_session::{find_devices, find_dfu_interfaces, Transport};
///
/// for transport in find_devices().unwrap() {
///     println!("Found DFU Device: {}", transport);
///     for setting in find_dfu_interfaces(transport.configurations()) {
///         println!("  {}", setting);
///     }
/// }
/// ```
pub fn find_devices() -> Result<Vec<RusbTransport>, Error> {
    let context = Context::new().map_err(Error::UsbContext)?;

    let devices = context.devices().map_err(Error::UsbDeviceEnumeration)?;

    let dfu_devices: Vec<RusbTransport> = devices
        .iter()
        .filter_map(|device| RusbTransport::new(context.clone(), device).ok())
        .filter(|transport| !find_dfu_interfaces(transport.configurations()).is_empty())
        .collect();

    debug!("Found {} DFU devices", dfu_devices.len());
    Ok(dfu_devices)
}

/// A USB device reached through libusb.
///
/// libusb cannot report which alternate setting an interface is using, so
/// [`Transport::current_alternate()`] only knows about settings selected
/// through this transport.
pub struct RusbTransport {
    context: Context,
    device: RusbDevice<Context>,
    handle: Option<DeviceHandle<Context>>,
    info: DeviceInfo,
    configurations: Vec<ConfigurationInfo>,
    claimed: BTreeSet<u8>,
    alternates: BTreeMap<u8, u8>,
    timeout: Duration,
}

impl std::fmt::Display for RusbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (bus {} address {})",
            self.info, self.info.bus, self.info.address
        )
    }
}

impl RusbTransport {
    /// Creates a transport for `device`, reading its configuration
    /// descriptors.  Configurations that cannot be read are skipped.
    pub fn new(context: Context, device: RusbDevice<Context>) -> Result<Self, Error> {
        let desc = device
            .device_descriptor()
            .map_err(Error::UsbDeviceEnumeration)?;

        let info = DeviceInfo {
            vid: desc.vendor_id(),
            pid: desc.product_id(),
            bus: device.bus_number(),
            address: device.address(),
        };

        let mut configurations = Vec::new();
        for config_idx in 0..desc.num_configurations() {
            let config = match device.config_descriptor(config_idx) {
                Ok(c) => c,
                Err(e) => {
                    debug!("{}: skipping configuration {}: {}", info, config_idx, e);
                    continue;
                }
            };

            let interfaces = config
                .interfaces()
                .map(|interface| InterfaceInfo {
                    number: interface.number(),
                    alternates: interface
                        .descriptors()
                        .map(|alt| AlternateInfo {
                            setting: alt.setting_number(),
                            class: alt.class_code(),
                            subclass: alt.sub_class_code(),
                            protocol: alt.protocol_code(),
                            name: None,
                        })
                        .collect(),
                })
                .collect();

            configurations.push(ConfigurationInfo {
                value: config.number(),
                interfaces,
            });
        }

        Ok(RusbTransport {
            context,
            device,
            handle: None,
            info,
            configurations,
            claimed: BTreeSet::new(),
            alternates: BTreeMap::new(),
            timeout: DEFAULT_USB_TIMEOUT,
        })
    }

    /// Sets the USB timeout duration for control transfers.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Returns the device information.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>, HostError> {
        self.handle.as_ref().ok_or(HostError::NotOpen)
    }

    fn handle_mut(&mut self) -> Result<&mut DeviceHandle<Context>, HostError> {
        self.handle.as_mut().ok_or(HostError::NotOpen)
    }
}

impl Transport for RusbTransport {
    fn open(&mut self) -> Result<(), HostError> {
        if self.handle.is_none() {
            trace!("Opening USB device: {}", self);
            self.handle = Some(self.device.open()?);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), HostError> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        trace!("Closing USB device: {}", self);

        let mut result = Ok(());
        for interface in std::mem::take(&mut self.claimed) {
            if let Err(e) = handle.release_interface(interface) {
                if result.is_ok() {
                    result = Err(HostError::Usb(e));
                }
            }
        }
        self.alternates.clear();
        result
    }

    fn configurations(&self) -> &[ConfigurationInfo] {
        &self.configurations
    }

    fn active_configuration(&self) -> Option<u8> {
        // 0 means unconfigured.
        self.handle
            .as_ref()?
            .active_configuration()
            .ok()
            .filter(|value| *value != 0)
    }

    fn select_configuration(&mut self, value: u8) -> Result<(), HostError> {
        self.handle_mut()?.set_active_configuration(value)?;
        self.claimed.clear();
        self.alternates.clear();
        Ok(())
    }

    fn is_claimed(&self, interface: u8) -> bool {
        self.claimed.contains(&interface)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), HostError> {
        let handle = self.handle_mut()?;

        // Detach kernel driver if needed
        if let Ok(true) = handle.kernel_driver_active(interface) {
            handle.detach_kernel_driver(interface)?;
        }

        handle.claim_interface(interface)?;
        self.claimed.insert(interface);
        Ok(())
    }

    fn current_alternate(&self, interface: u8) -> Option<u8> {
        self.alternates.get(&interface).copied()
    }

    fn select_alternate_interface(
        &mut self,
        interface: u8,
        alternate: u8,
    ) -> Result<(), HostError> {
        let result = self.handle_mut()?.set_alternate_setting(interface, alternate);
        match result {
            Ok(()) => {
                self.alternates.insert(interface, alternate);
                Ok(())
            }
            // A stalled SET_INTERFACE is a redundant one if the alternate is
            // already known to be selected, or is the only one there is.
            Err(RusbError::Pipe)
                if self.current_alternate(interface) == Some(alternate)
                    || self.alternate_count(interface) == 1 =>
            {
                self.alternates.insert(interface, alternate);
                Err(HostError::RedundantInterfaceSelection)
            }
            Err(e) => Err(HostError::Usb(e)),
        }
    }

    fn control_transfer_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
    ) -> Result<ControlIn, HostError> {
        let mut buf = vec![0u8; usize::from(length)];
        let result = self.handle()?.read_control(
            setup.bm_request_type(true),
            setup.request,
            setup.value,
            setup.index,
            &mut buf,
            self.timeout,
        );
        let status = match result {
            Ok(n) => {
                buf.truncate(n);
                TransferStatus::Ok
            }
            Err(RusbError::Pipe) => TransferStatus::Stall,
            Err(RusbError::Overflow) => TransferStatus::Babble,
            Err(e) => {
                trace!("Control transfer IN error: {e}");
                return Err(HostError::Usb(e));
            }
        };
        if status != TransferStatus::Ok {
            buf.clear();
        }
        Ok(ControlIn { status, data: buf })
    }

    fn control_transfer_out(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<TransferStatus, HostError> {
        let result = self.handle()?.write_control(
            setup.bm_request_type(false),
            setup.request,
            setup.value,
            setup.index,
            data,
            self.timeout,
        );
        match result {
            Ok(_) => Ok(TransferStatus::Ok),
            Err(RusbError::Pipe) => Ok(TransferStatus::Stall),
            Err(RusbError::Overflow) => Ok(TransferStatus::Babble),
            Err(e) => {
                trace!("Control transfer OUT error: {e}");
                Err(HostError::Usb(e))
            }
        }
    }

    fn subscribe_disconnect(&mut self) -> Result<DisconnectSubscription, HostError> {
        if !rusb::has_hotplug() {
            return Err(HostError::Usb(RusbError::NotSupported));
        }

        let (events, rx) = channel();
        let watch: Box<dyn Hotplug<Context>> = Box::new(DisconnectWatch {
            bus: self.info.bus,
            address: self.info.address,
            events,
        });

        let mut builder = HotplugBuilder::new();
        builder
            .vendor_id(self.info.vid)
            .product_id(self.info.pid)
            .enumerate(false);
        let registration = builder.register(&self.context, watch)?;

        // libusb only delivers hotplug callbacks while events are handled.
        let stop = Arc::new(AtomicBool::new(false));
        let pump = {
            let stop = stop.clone();
            let context = self.context.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if let Err(e) = context.handle_events(Some(EVENT_POLL_INTERVAL)) {
                        warn!("USB event handling failed: {}", e);
                        break;
                    }
                }
            })
        };

        trace!("Subscribed to disconnect of {}", self);
        Ok(DisconnectSubscription::new(rx, move || {
            drop(registration);
            stop.store(true, Ordering::SeqCst);
            if pump.join().is_err() {
                warn!("USB event thread panicked");
            }
        }))
    }
}

struct DisconnectWatch {
    bus: u8,
    address: u8,
    events: Sender<()>,
}

impl<T: UsbContext> Hotplug<T> for DisconnectWatch {
    fn device_arrived(&mut self, _device: RusbDevice<T>) {}

    fn device_left(&mut self, device: RusbDevice<T>) {
        if device.bus_number() == self.bus && device.address() == self.address {
            // The receiver may already be gone if the wait timed out.
            let _ = self.events.send(());
        }
    }
}
