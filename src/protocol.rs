// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! USB and DFU protocol constants.

use std::fmt;

// USB class/subclass codes for DFU
pub const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
pub const USB_SUBCLASS_DFU: u8 = 0x01;

// bInterfaceProtocol values of a DFU interface
pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
pub const DFU_PROTOCOL_DFU_MODE: u8 = 0x02;

// Standard requests
pub const GET_DESCRIPTOR: u8 = 0x06;

// Descriptor types
pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIGURATION: u8 = 0x02;
pub const DT_STRING: u8 = 0x03;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_DFU_FUNCTIONAL: u8 = 0x21;

/// Language id used when resolving interface names.
pub const US_ENGLISH: u16 = 0x0409;

// DFU class requests
pub const DFU_DETACH: u8 = 0x00;
pub const DFU_DNLOAD: u8 = 0x01;
pub const DFU_UPLOAD: u8 = 0x02;
pub const DFU_GETSTATUS: u8 = 0x03;
pub const DFU_CLRSTATUS: u8 = 0x04;
pub const DFU_GETSTATE: u8 = 0x05;
pub const DFU_ABORT: u8 = 0x06;

/// bStatus value for "no error"
pub const DFU_STATUS_OK: u8 = 0x00;

/// DFU device state, as reported by DFU_GETSTATUS and DFU_GETSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    DfuError,
}

impl TryFrom<u8> for DfuState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DnloadSync,
            4 => DfuState::DnBusy,
            5 => DfuState::DnloadIdle,
            6 => DfuState::ManifestSync,
            7 => DfuState::Manifest,
            8 => DfuState::ManifestWaitReset,
            9 => DfuState::UploadIdle,
            10 => DfuState::DfuError,
            other => return Err(other),
        })
    }
}

impl From<DfuState> for u8 {
    fn from(state: DfuState) -> u8 {
        state as u8
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DnloadSync => "dfuDNLOAD-SYNC",
            DfuState::DnBusy => "dfuDNBUSY",
            DfuState::DnloadIdle => "dfuDNLOAD-IDLE",
            DfuState::ManifestSync => "dfuMANIFEST-SYNC",
            DfuState::Manifest => "dfuMANIFEST",
            DfuState::ManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::UploadIdle => "dfuUPLOAD-IDLE",
            DfuState::DfuError => "dfuERROR",
        };
        f.write_str(name)
    }
}

/// Payload of a DFU_GETSTATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    /// bStatus
    pub status: u8,
    /// bwPollTimeout, in milliseconds
    pub poll_timeout: u32,
    /// Raw bState
    pub state: u8,
    /// iString
    pub string_index: u8,
}

impl DfuStatus {
    pub const LENGTH: usize = 6;

    /// Decodes a 6-byte GETSTATUS response; `None` if too short.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LENGTH {
            return None;
        }
        Some(DfuStatus {
            status: data[0],
            poll_timeout: u32::from_le_bytes([data[1], data[2], data[3], 0]),
            state: data[4],
            string_index: data[5],
        })
    }

    /// The decoded state, if the device reported a known one.
    pub fn dfu_state(&self) -> Option<DfuState> {
        DfuState::try_from(self.state).ok()
    }

    pub fn is_error(&self) -> bool {
        self.status != DFU_STATUS_OK || self.state == u8::from(DfuState::DfuError)
    }
}
