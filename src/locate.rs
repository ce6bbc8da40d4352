// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Finding DFU interfaces in a device's enumerated configurations.

use std::fmt;

use crate::protocol::{
    DFU_PROTOCOL_DFU_MODE, DFU_PROTOCOL_RUNTIME, USB_CLASS_APPLICATION_SPECIFIC,
    USB_SUBCLASS_DFU,
};
use crate::strings::InterfaceNames;
use crate::transport::ConfigurationInfo;

/// Whether a DFU interface belongs to the application (runtime) or to the
/// bootloader (DFU mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuMode {
    Runtime,
    Dfu,
}

impl DfuMode {
    fn from_protocol(protocol: u8) -> Option<Self> {
        match protocol {
            DFU_PROTOCOL_RUNTIME => Some(DfuMode::Runtime),
            DFU_PROTOCOL_DFU_MODE => Some(DfuMode::Dfu),
            _ => None,
        }
    }
}

/// One selectable configuration/interface/alternate setting combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSetting {
    /// `bConfigurationValue`
    pub configuration: u8,
    pub interface: u8,
    pub alternate: u8,
    pub mode: DfuMode,
    /// Interface name, once resolved
    pub name: Option<String>,
}

impl InterfaceSetting {
    /// Sets `name` from a name index.  A setting the index has no name for
    /// ends up unnamed.
    pub fn apply_names(&mut self, names: &InterfaceNames) {
        self.name = names
            .get(&self.configuration)
            .and_then(|c| c.get(&self.interface))
            .and_then(|i| i.get(&self.alternate))
            .cloned()
            .flatten();
    }
}

impl fmt::Display for InterfaceSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cfg {} intf {} alt {}",
            self.configuration, self.interface, self.alternate
        )?;
        if let Some(name) = &self.name {
            write!(f, " \"{}\"", name)?;
        }
        Ok(())
    }
}

/// Returns every DFU alternate setting, in configuration, interface and then
/// alternate order.
///
/// The same interface number may legitimately appear under several
/// configurations; each is returned.
pub fn find_dfu_interfaces(configurations: &[ConfigurationInfo]) -> Vec<InterfaceSetting> {
    let mut settings = Vec::new();
    for config in configurations {
        for intf in &config.interfaces {
            for alt in &intf.alternates {
                if alt.class != USB_CLASS_APPLICATION_SPECIFIC || alt.subclass != USB_SUBCLASS_DFU
                {
                    continue;
                }
                if let Some(mode) = DfuMode::from_protocol(alt.protocol) {
                    settings.push(InterfaceSetting {
                        configuration: config.value,
                        interface: intf.number,
                        alternate: alt.setting,
                        mode,
                        name: alt.name.clone(),
                    });
                }
            }
        }
    }
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AlternateInfo, InterfaceInfo};
    use std::collections::BTreeMap;

    fn alt(setting: u8, class: u8, subclass: u8, protocol: u8) -> AlternateInfo {
        AlternateInfo {
            setting,
            class,
            subclass,
            protocol,
            name: None,
        }
    }

    #[test]
    fn finds_runtime_and_dfu_mode_only() {
        let configs = vec![ConfigurationInfo {
            value: 1,
            interfaces: vec![
                InterfaceInfo {
                    number: 0,
                    alternates: vec![alt(0, 0xFE, 0x01, 0x01), alt(1, 0xFE, 0x01, 0x02)],
                },
                InterfaceInfo {
                    number: 1,
                    alternates: vec![alt(0, 0x03, 0x00, 0x00), alt(1, 0xFE, 0x01, 0x03)],
                },
            ],
        }];

        let found = find_dfu_interfaces(&configs);
        assert_eq!(found.len(), 2);
        assert_eq!(
            (found[0].interface, found[0].alternate, found[0].mode),
            (0, 0, DfuMode::Runtime)
        );
        assert_eq!(
            (found[1].interface, found[1].alternate, found[1].mode),
            (0, 1, DfuMode::Dfu)
        );
    }

    #[test]
    fn same_interface_in_two_configurations() {
        let intf = InterfaceInfo {
            number: 2,
            alternates: vec![AlternateInfo {
                name: Some("@Internal Flash  /0x08000000/04*016Kg".to_string()),
                ..alt(0, 0xFE, 0x01, 0x02)
            }],
        };
        let configs = vec![
            ConfigurationInfo {
                value: 1,
                interfaces: vec![intf.clone()],
            },
            ConfigurationInfo {
                value: 2,
                interfaces: vec![intf],
            },
        ];

        let found = find_dfu_interfaces(&configs);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].configuration, 1);
        assert_eq!(found[1].configuration, 2);
        assert_eq!(
            found[1].name.as_deref(),
            Some("@Internal Flash  /0x08000000/04*016Kg")
        );
    }

    #[test]
    fn apply_names_from_index() {
        let mut setting = InterfaceSetting {
            configuration: 1,
            interface: 0,
            alternate: 1,
            mode: DfuMode::Dfu,
            name: None,
        };
        let mut names: InterfaceNames = BTreeMap::new();
        names
            .entry(1)
            .or_default()
            .entry(0)
            .or_default()
            .insert(1, Some("@Option Bytes".to_string()));

        setting.apply_names(&names);
        assert_eq!(setting.name.as_deref(), Some("@Option Bytes"));
        assert_eq!(
            setting.to_string(),
            "cfg 1 intf 0 alt 1 \"@Option Bytes\""
        );

        setting.alternate = 0;
        setting.apply_names(&names);
        assert_eq!(setting.name, None);
        assert_eq!(setting.to_string(), "cfg 1 intf 0 alt 0");
    }
}
