// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Standard GET_DESCRIPTOR reads: string descriptors, raw device and
//! configuration descriptors, and the interface name index built from them.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::descriptor::{
    decode_configuration, decode_device, decode_string_units, units_to_text, DeviceDescriptor,
    StringDescriptor,
};
use crate::error::{Error, Result};
use crate::protocol::{DT_CONFIGURATION, DT_DEVICE, DT_STRING, GET_DESCRIPTOR, US_ENGLISH};
use crate::transport::{ControlSetup, Recipient, RequestType, TransferStatus, Transport};

/// Interface names by configuration value, interface number and alternate
/// setting.  `None` means the interface has no name, or it could not be read.
pub type InterfaceNames = BTreeMap<u8, BTreeMap<u8, BTreeMap<u8, Option<String>>>>;

fn get_descriptor<T: Transport + ?Sized>(
    transport: &mut T,
    descriptor_type: u8,
    index: u8,
    language: u16,
    length: u16,
) -> Result<Vec<u8>> {
    let setup = ControlSetup {
        request_type: RequestType::Standard,
        recipient: Recipient::Device,
        request: GET_DESCRIPTOR,
        value: (u16::from(descriptor_type) << 8) | u16::from(index),
        index: language,
    };
    let result = transport
        .control_transfer_in(setup, length)
        .map_err(Error::ControlTransfer)?;
    if result.status != TransferStatus::Ok {
        return Err(Error::Transfer {
            status: result.status,
        });
    }
    Ok(result.data)
}

// Reads bLength first, then the whole descriptor.
fn read_string_units<T: Transport + ?Sized>(
    transport: &mut T,
    index: u8,
    language: u16,
) -> Result<Vec<u16>> {
    trace!("Reading string descriptor {} language 0x{:04X}", index, language);
    let head = get_descriptor(transport, DT_STRING, index, language, 1)?;
    let length = *head
        .first()
        .ok_or(Error::malformed(0, "empty string descriptor"))?;
    let data = get_descriptor(transport, DT_STRING, index, language, u16::from(length))?;
    decode_string_units(&data)
}

/// Reads string descriptor `index`.  A `language` of 0 queries the list of
/// supported language ids instead of text.
pub fn read_string_descriptor<T: Transport + ?Sized>(
    transport: &mut T,
    index: u8,
    language: u16,
) -> Result<StringDescriptor> {
    let units = read_string_units(transport, index, language)?;
    if language == 0 {
        Ok(StringDescriptor::Languages(units))
    } else {
        Ok(StringDescriptor::Text(units_to_text(&units)))
    }
}

/// Returns the language ids the device supports, which string descriptor
/// `index` (normally 0) lists when queried with language id 0.
pub fn resolve_languages<T: Transport + ?Sized>(
    transport: &mut T,
    index: u8,
) -> Result<Vec<u16>> {
    read_string_units(transport, index, 0)
}

/// Reads string descriptor `index` in `language` as text.
///
/// A `language` of 0 is the language id query, which has no text; it fails
/// with [`Error::LanguageQuery`] without touching the device.  Use
/// [`resolve_languages()`] for that.
pub fn resolve_text<T: Transport + ?Sized>(
    transport: &mut T,
    index: u8,
    language: u16,
) -> Result<String> {
    if language == 0 {
        return Err(Error::LanguageQuery);
    }
    let units = read_string_units(transport, index, language)?;
    Ok(units_to_text(&units))
}

/// Reads and decodes the device descriptor.
pub fn read_device_descriptor<T: Transport + ?Sized>(
    transport: &mut T,
) -> Result<DeviceDescriptor> {
    let data = get_descriptor(transport, DT_DEVICE, 0, 0, 18)?;
    decode_device(&data)
}

/// Reads the raw configuration descriptor at `index` (not
/// `bConfigurationValue`), including everything up to `wTotalLength`.
pub fn read_configuration_descriptor<T: Transport + ?Sized>(
    transport: &mut T,
    index: u8,
) -> Result<Vec<u8>> {
    let head = get_descriptor(transport, DT_CONFIGURATION, index, 0, 4)?;
    if head.len() < 4 {
        return Err(Error::malformed(head.len(), "configuration descriptor truncated"));
    }
    let total_length = u16::from_le_bytes([head[2], head[3]]);
    trace!(
        "Configuration descriptor {} is {} bytes",
        index,
        total_length
    );
    get_descriptor(transport, DT_CONFIGURATION, index, 0, total_length)
}

/// Builds the interface name index for every configuration of the device.
///
/// Each distinct string index is read once, in US English.  A string that
/// cannot be read is logged and recorded as `None` for every alternate
/// setting using it; only failure to read a configuration descriptor is an
/// error.
pub fn read_interface_names<T: Transport + ?Sized>(transport: &mut T) -> Result<InterfaceNames> {
    let mut indices: BTreeMap<u8, BTreeMap<u8, BTreeMap<u8, u8>>> = BTreeMap::new();
    let mut string_indices = BTreeSet::new();

    // Descriptor indices are 8 bits wide.
    let count = transport.configurations().len();
    for config_index in (0..=u8::MAX).take(count) {
        let raw = read_configuration_descriptor(transport, config_index)?;
        let config = decode_configuration(&raw)?;

        let by_interface = indices.entry(config.configuration_value).or_default();
        for intf in config.interfaces() {
            by_interface
                .entry(intf.interface_number)
                .or_default()
                .insert(intf.alternate_setting, intf.interface_index);
            if intf.interface_index != 0 {
                string_indices.insert(intf.interface_index);
            }
        }
    }

    let mut strings: BTreeMap<u8, Option<String>> = BTreeMap::new();
    for index in string_indices {
        let text = match resolve_text(transport, index, US_ENGLISH) {
            Ok(text) => {
                debug!("Interface string {}: {}", index, text);
                Some(text)
            }
            Err(e) => {
                let e = Error::StringResolution {
                    index,
                    source: Box::new(e),
                };
                warn!("{}", e);
                None
            }
        };
        strings.insert(index, text);
    }

    Ok(indices
        .into_iter()
        .map(|(config, interfaces)| {
            let interfaces = interfaces
                .into_iter()
                .map(|(number, alternates)| {
                    let alternates = alternates
                        .into_iter()
                        .map(|(alt, index)| (alt, strings.get(&index).cloned().flatten()))
                        .collect();
                    (number, alternates)
                })
                .collect();
            (config, interfaces)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, MockTransport};
    use crate::transport::{AlternateInfo, ConfigurationInfo, InterfaceInfo};

    fn string(text: &str) -> Vec<u8> {
        let mut data = vec![0, DT_STRING];
        for unit in text.encode_utf16() {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        data[0] = data.len() as u8;
        data
    }

    fn dfu_config_info(value: u8, alternates: u8) -> ConfigurationInfo {
        ConfigurationInfo {
            value,
            interfaces: vec![InterfaceInfo {
                number: 0,
                alternates: (0..alternates)
                    .map(|setting| AlternateInfo {
                        setting,
                        class: 0xFE,
                        subclass: 0x01,
                        protocol: 0x02,
                        name: None,
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn text_and_language_query() {
        let mut transport = MockTransport::new(Vec::new());
        transport.respond(0x0305, 0x0409, &[4, 3, 0x09, 0x04]);
        transport.respond(0x0305, 0, &[4, 3, 0x09, 0x04]);

        assert_eq!(
            resolve_text(&mut transport, 5, 0x0409).unwrap(),
            "\u{0409}"
        );
        assert_eq!(resolve_languages(&mut transport, 5).unwrap(), vec![0x0409]);
        assert_eq!(
            read_string_descriptor(&mut transport, 5, 0).unwrap(),
            StringDescriptor::Languages(vec![0x0409])
        );

        // Two round trips each: bLength first, then the full descriptor.
        let lengths: Vec<u16> = transport
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::In(setup, length) => {
                    assert_eq!(setup.request, GET_DESCRIPTOR);
                    assert_eq!(setup.bm_request_type(true), 0x80);
                    Some(*length)
                }
                _ => None,
            })
            .collect();
        assert_eq!(lengths, vec![1, 4, 1, 4, 1, 4]);
    }

    #[test]
    fn failed_round_trip_is_transfer_error() {
        let mut transport = MockTransport::new(Vec::new());
        assert_eq!(
            resolve_text(&mut transport, 9, US_ENGLISH),
            Err(Error::Transfer {
                status: TransferStatus::Stall
            })
        );

        transport.fail(0x0309, US_ENGLISH, TransferStatus::Babble);
        assert_eq!(
            resolve_text(&mut transport, 9, US_ENGLISH),
            Err(Error::Transfer {
                status: TransferStatus::Babble
            })
        );
    }

    #[test]
    fn language_query_is_never_text() {
        let mut transport = MockTransport::new(Vec::new());
        transport.respond(0x0300, 0, &[4, 3, 0x09, 0x04]);

        assert_eq!(resolve_text(&mut transport, 0, 0), Err(Error::LanguageQuery));
        assert_eq!(transport.control_ins(), 0);

        assert_eq!(resolve_languages(&mut transport, 0).unwrap(), vec![0x0409]);
        assert_eq!(
            read_string_descriptor(&mut transport, 0, 0).unwrap(),
            StringDescriptor::Languages(vec![0x0409])
        );
    }

    #[test]
    fn device_descriptor_read() {
        let mut transport = MockTransport::new(Vec::new());
        transport.respond(
            0x0100,
            0,
            &[
                0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x40, 0x83, 0x04, 0x11, 0xDF, 0x00,
                0x22, 0x01, 0x02, 0x03, 0x01,
            ],
        );
        let d = read_device_descriptor(&mut transport).unwrap();
        assert_eq!((d.vendor_id, d.product_id), (0x0483, 0xDF11));
        assert_eq!(d.usb_version, 0x0110);
    }

    #[test]
    fn configuration_read_uses_total_length() {
        let config = [
            0x09, 0x02, 0x12, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, //
            0x09, 0x04, 0x00, 0x00, 0x00, 0xFE, 0x01, 0x02, 0x04,
        ];
        let mut transport = MockTransport::new(Vec::new());
        transport.respond(0x0200, 0, &config);

        assert_eq!(
            read_configuration_descriptor(&mut transport, 0).unwrap(),
            config.to_vec()
        );
        let lengths: Vec<u16> = transport
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::In(_, length) => Some(*length),
                _ => None,
            })
            .collect();
        assert_eq!(lengths, vec![4, 18]);
    }

    #[test]
    fn shared_string_index_resolved_once() {
        let config = [
            0x09, 0x02, 0x1B, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, //
            0x09, 0x04, 0x00, 0x00, 0x00, 0xFE, 0x01, 0x02, 0x06, //
            0x09, 0x04, 0x00, 0x01, 0x00, 0xFE, 0x01, 0x02, 0x06,
        ];
        let mut transport = MockTransport::new(vec![dfu_config_info(1, 2)]);
        transport.respond(0x0200, 0, &config);
        transport.respond(0x0306, US_ENGLISH, &string("@Internal Flash"));

        let names = read_interface_names(&mut transport).unwrap();
        assert_eq!(transport.control_ins(), 4);

        let alts = &names[&1][&0];
        assert_eq!(alts[&0].as_deref(), Some("@Internal Flash"));
        assert_eq!(alts[&1].as_deref(), Some("@Internal Flash"));
    }

    #[test]
    fn failed_string_does_not_abort_index() {
        let config = [
            0x09, 0x02, 0x24, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, //
            0x09, 0x04, 0x00, 0x00, 0x00, 0xFE, 0x01, 0x02, 0x06, //
            0x09, 0x04, 0x00, 0x01, 0x00, 0xFE, 0x01, 0x02, 0x07, //
            0x09, 0x04, 0x00, 0x02, 0x00, 0xFE, 0x01, 0x02, 0x00,
        ];
        let mut transport = MockTransport::new(vec![dfu_config_info(1, 3)]);
        transport.respond(0x0200, 0, &config);
        transport.respond(0x0307, US_ENGLISH, &string("@Option Bytes"));

        let names = read_interface_names(&mut transport).unwrap();
        let alts = &names[&1][&0];
        assert_eq!(alts[&0], None);
        assert_eq!(alts[&1].as_deref(), Some("@Option Bytes"));
        assert_eq!(alts[&2], None);
        // Index 0 is never read.
        assert!(!transport.calls.iter().any(|c| matches!(
            c,
            Call::In(setup, _) if setup.value == 0x0300
        )));
    }

    #[test]
    fn unreadable_configuration_is_an_error() {
        let mut transport = MockTransport::new(vec![dfu_config_info(1, 1)]);
        assert!(matches!(
            read_interface_names(&mut transport),
            Err(Error::Transfer {
                status: TransferStatus::Stall
            })
        ));
    }
}
