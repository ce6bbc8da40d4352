// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Decoding of raw USB descriptors.
//!
//! These functions do no I/O.  Raw buffers are obtained via the functions in
//! [`strings`](crate::strings) or by any other means.  All multi-byte fields
//! are little-endian.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    DT_DFU_FUNCTIONAL, DT_INTERFACE, USB_CLASS_APPLICATION_SPECIFIC, USB_SUBCLASS_DFU,
};

const DEVICE_DESC_LEN: usize = 18;
const CONFIG_DESC_LEN: usize = 9;
const INTERFACE_DESC_LEN: usize = 9;
const FUNCTIONAL_DESC_LEN: usize = 9;
const HEADER_LEN: usize = 2;

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Device descriptor (USB 2.0 section 9.6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// bcdUSB
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// bMaxPacketSize0
    pub max_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

/// Configuration descriptor header plus every descriptor that follows it,
/// in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// wTotalLength, header included
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    /// iConfiguration
    pub configuration_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub descriptors: Vec<Descriptor>,
}

impl ConfigurationDescriptor {
    /// Interface descriptors of this configuration, one per alternate setting.
    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.descriptors.iter().filter_map(|d| match d {
            Descriptor::Interface(intf) => Some(intf),
            _ => None,
        })
    }
}

/// Interface descriptor.  `descriptors` holds what followed it up to the next
/// interface descriptor; DFU functional descriptors only appear there when
/// this is a DFU interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// iInterface
    pub interface_index: u8,
    pub descriptors: Vec<Descriptor>,
}

impl InterfaceDescriptor {
    pub fn is_dfu(&self) -> bool {
        self.class == USB_CLASS_APPLICATION_SPECIFIC && self.subclass == USB_SUBCLASS_DFU
    }

    /// The DFU functional descriptor belonging to this interface, if any.
    pub fn functional(&self) -> Option<&FunctionalDescriptor> {
        self.descriptors.iter().find_map(|d| match d {
            Descriptor::Functional(f) => Some(f),
            _ => None,
        })
    }
}

/// DFU functional descriptor (DFU 1.1 section 4.1.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub attributes: u8,
    /// wDetachTimeOut, in milliseconds
    pub detach_timeout: u16,
    /// wTransferSize
    pub transfer_size: u16,
    /// bcdDFUVersion
    pub dfu_version: u16,
}

impl FunctionalDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// Device still communicates over USB after manifestation.
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device detaches and re-attaches itself on DFU_DETACH, so the host
    /// must not reset it.
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }
}

/// Any descriptor not otherwise decoded.  `data` is the whole descriptor,
/// header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Interface(InterfaceDescriptor),
    Functional(FunctionalDescriptor),
    Generic(GenericDescriptor),
}

impl Descriptor {
    /// bLength
    pub fn length(&self) -> u8 {
        match self {
            Descriptor::Interface(d) => d.length,
            Descriptor::Functional(d) => d.length,
            Descriptor::Generic(d) => d.length,
        }
    }

    /// bDescriptorType
    pub fn descriptor_type(&self) -> u8 {
        match self {
            Descriptor::Interface(d) => d.descriptor_type,
            Descriptor::Functional(d) => d.descriptor_type,
            Descriptor::Generic(d) => d.descriptor_type,
        }
    }
}

/// Decoded string descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringDescriptor {
    /// String descriptor zero: the supported language ids.
    Languages(Vec<u16>),
    Text(String),
}

/// Decodes an 18-byte device descriptor.
pub fn decode_device(data: &[u8]) -> Result<DeviceDescriptor> {
    if data.len() < DEVICE_DESC_LEN {
        return Err(Error::malformed(data.len(), "device descriptor truncated"));
    }
    Ok(DeviceDescriptor {
        length: data[0],
        descriptor_type: data[1],
        usb_version: u16_at(data, 2),
        device_class: data[4],
        device_subclass: data[5],
        device_protocol: data[6],
        max_packet_size: data[7],
        vendor_id: u16_at(data, 8),
        product_id: u16_at(data, 10),
        device_version: u16_at(data, 12),
        manufacturer_index: data[14],
        product_index: data[15],
        serial_number_index: data[16],
        num_configurations: data[17],
    })
}

/// Decodes a configuration descriptor together with its descriptor chain.
///
/// `data` must hold at least `wTotalLength` bytes; anything beyond that is
/// ignored.
pub fn decode_configuration(data: &[u8]) -> Result<ConfigurationDescriptor> {
    if data.len() < CONFIG_DESC_LEN {
        return Err(Error::malformed(
            data.len(),
            "configuration descriptor header truncated",
        ));
    }
    let total_length = u16_at(data, 2);
    let end = usize::from(total_length);
    if end < CONFIG_DESC_LEN {
        return Err(Error::malformed(2, "wTotalLength shorter than header"));
    }
    if data.len() < end {
        return Err(Error::malformed(data.len(), "buffer shorter than wTotalLength"));
    }

    let descriptors = decode_chain(&data[CONFIG_DESC_LEN..end], CONFIG_DESC_LEN)?;
    trace!(
        "Decoded configuration {} with {} descriptors",
        data[5],
        descriptors.len()
    );

    Ok(ConfigurationDescriptor {
        length: data[0],
        descriptor_type: data[1],
        total_length,
        num_interfaces: data[4],
        configuration_value: data[5],
        configuration_index: data[6],
        attributes: data[7],
        max_power: data[8],
        descriptors,
    })
}

/// Decodes a string descriptor.  When `language_query` is set the payload is
/// the list of supported language ids, otherwise UTF-16 text with each code
/// unit taken as one character.
pub fn decode_string(data: &[u8], language_query: bool) -> Result<StringDescriptor> {
    let units = decode_string_units(data)?;
    if language_query {
        Ok(StringDescriptor::Languages(units))
    } else {
        Ok(StringDescriptor::Text(units_to_text(&units)))
    }
}

/// Payload of a string descriptor as little-endian 16-bit units.
pub(crate) fn decode_string_units(data: &[u8]) -> Result<Vec<u16>> {
    let (length, _) = header_at(data, 0)?;
    if data.len() < length {
        return Err(Error::malformed(0, "string descriptor truncated"));
    }
    Ok(data[HEADER_LEN..length]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

// No surrogate pair handling: units outside the BMP come out as U+FFFD.
pub(crate) fn units_to_text(units: &[u16]) -> String {
    units
        .iter()
        .map(|&u| char::from_u32(u32::from(u)).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Which interface, if any, trailing descriptors currently belong to.  The
/// index refers to the interface's position in the flat descriptor list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    NoInterface,
    InForeignInterface(usize),
    InDfuInterface(usize),
}

impl Scope {
    /// Scope after the interface descriptor at `index` has been read.
    pub(crate) fn enter(interface: &InterfaceDescriptor, index: usize) -> Self {
        if interface.is_dfu() {
            Scope::InDfuInterface(index)
        } else {
            Scope::InForeignInterface(index)
        }
    }

    /// Interface that owns a descriptor read now.
    pub(crate) fn owner(&self) -> Option<usize> {
        match *self {
            Scope::InDfuInterface(index) | Scope::InForeignInterface(index) => Some(index),
            Scope::NoInterface => None,
        }
    }

    /// Whether a DFU functional descriptor read now is decoded as such.
    pub(crate) fn decodes_functional(&self) -> bool {
        matches!(self, Scope::InDfuInterface(_))
    }
}

fn header_at(data: &[u8], offset: usize) -> Result<(usize, u8)> {
    if data.len() < HEADER_LEN {
        return Err(Error::malformed(offset, "descriptor header truncated"));
    }
    let length = usize::from(data[0]);
    if length < HEADER_LEN {
        return Err(Error::malformed(offset, "bLength shorter than header"));
    }
    Ok((length, data[1]))
}

// `base` is the offset of `data` within the configuration descriptor, for
// error reporting.
fn decode_chain(data: &[u8], base: usize) -> Result<Vec<Descriptor>> {
    let mut descriptors: Vec<Descriptor> = Vec::new();
    let mut scope = Scope::NoInterface;
    let mut offset = 0;

    while data.len() - offset > HEADER_LEN {
        let (length, descriptor_type) = header_at(&data[offset..], base + offset)?;
        if length > data.len() - offset {
            return Err(Error::malformed(
                base + offset,
                "bLength exceeds remaining buffer",
            ));
        }
        let raw = &data[offset..offset + length];

        if descriptor_type == DT_INTERFACE {
            let interface = decode_interface(raw, base + offset)?;
            scope = Scope::enter(&interface, descriptors.len());
            descriptors.push(Descriptor::Interface(interface));
        } else {
            let descriptor = if descriptor_type == DT_DFU_FUNCTIONAL && scope.decodes_functional()
            {
                Descriptor::Functional(decode_functional(raw, base + offset)?)
            } else {
                Descriptor::Generic(GenericDescriptor {
                    length: raw[0],
                    descriptor_type,
                    data: raw.to_vec(),
                })
            };
            if let Some(index) = scope.owner() {
                if let Descriptor::Interface(owner) = &mut descriptors[index] {
                    owner.descriptors.push(descriptor.clone());
                }
            }
            descriptors.push(descriptor);
        }

        offset += length;
    }

    Ok(descriptors)
}

fn decode_interface(raw: &[u8], offset: usize) -> Result<InterfaceDescriptor> {
    if raw.len() < INTERFACE_DESC_LEN {
        return Err(Error::malformed(offset, "interface descriptor truncated"));
    }
    Ok(InterfaceDescriptor {
        length: raw[0],
        descriptor_type: raw[1],
        interface_number: raw[2],
        alternate_setting: raw[3],
        num_endpoints: raw[4],
        class: raw[5],
        subclass: raw[6],
        protocol: raw[7],
        interface_index: raw[8],
        descriptors: Vec::new(),
    })
}

fn decode_functional(raw: &[u8], offset: usize) -> Result<FunctionalDescriptor> {
    if raw.len() < FUNCTIONAL_DESC_LEN {
        return Err(Error::malformed(offset, "DFU functional descriptor truncated"));
    }
    Ok(FunctionalDescriptor {
        length: raw[0],
        descriptor_type: raw[1],
        attributes: raw[2],
        detach_timeout: u16_at(raw, 3),
        transfer_size: u16_at(raw, 5),
        dfu_version: u16_at(raw, 7),
    })
}
