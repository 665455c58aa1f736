//! Register presets for multi-channel relay modules.
//!
//! The relay family these presets describe exposes its channels as coils
//! starting at address 0, and keeps two configuration holding registers at
//! fixed addresses regardless of channel count.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::error::{ModbusError, Result};
use crate::register::{Access, DataType, RegisterMap, RegisterMapping, RegisterType};

/// Holding register storing the module's baud-rate setting.
pub const RELAY_BAUD_RATE_REGISTER: u16 = 8192;

/// Holding register storing the module's Modbus device address.
pub const RELAY_DEVICE_ADDRESS_REGISTER: u16 = 16384;

/// Channel counts shipped in the catalog.
pub const CATALOG_CHANNEL_COUNTS: [u16; 5] = [4, 6, 8, 16, 32];

/// A named register map template.
#[derive(Debug, Clone)]
pub struct Preset {
    pub key: String,
    pub label: String,
    pub channel_count: u16,
    map: RegisterMap,
}

/// Catalog listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresetInfo {
    pub key: String,
    pub label: String,
    pub channel_count: u16,
}

static CATALOG: LazyLock<BTreeMap<String, Preset>> = LazyLock::new(|| {
    CATALOG_CHANNEL_COUNTS
        .iter()
        .map(|&count| {
            let preset = Preset {
                key: preset_key(count),
                label: format!("{}-channel relay module", count),
                channel_count: count,
                map: expand_preset(count),
            };
            (preset.key.clone(), preset)
        })
        .collect()
});

/// Catalog key for an N-channel relay module.
pub fn preset_key(channel_count: u16) -> String {
    format!("relay_{}ch", channel_count)
}

/// Generate the register map of an N-channel relay module.
///
/// Produces `channel_count` read/write coils at `0..channel_count`, followed by
/// the baud-rate and device-address configuration registers.
pub fn expand_preset(channel_count: u16) -> RegisterMap {
    let mut mappings: Vec<RegisterMapping> = (0..channel_count)
        .map(|channel| RegisterMapping {
            name: format!("Relay {}", channel + 1),
            register: channel,
            register_type: RegisterType::Coil,
            data_type: DataType::Bool,
            access: Access::Readwrite,
        })
        .collect();

    mappings.push(RegisterMapping {
        name: "Baud Rate Config".to_string(),
        register: RELAY_BAUD_RATE_REGISTER,
        register_type: RegisterType::Holding,
        data_type: DataType::Uint16,
        access: Access::Readwrite,
    });
    mappings.push(RegisterMapping {
        name: "Device Address Config".to_string(),
        register: RELAY_DEVICE_ADDRESS_REGISTER,
        register_type: RegisterType::Holding,
        data_type: DataType::Uint16,
        access: Access::Readwrite,
    });

    // Channel coils never collide with the two holding registers.
    RegisterMap::from_mappings(mappings).unwrap_or_default()
}

/// Load a catalog preset by key. The returned map is an independent copy.
pub fn load_preset(key: &str) -> Result<RegisterMap> {
    CATALOG
        .get(key)
        .map(|preset| preset.map.clone())
        .ok_or_else(|| ModbusError::NotFound(format!("preset '{}'", key)))
}

/// List catalog presets, ordered by channel count.
pub fn list_presets() -> Vec<PresetInfo> {
    let mut presets: Vec<PresetInfo> = CATALOG
        .values()
        .map(|p| PresetInfo {
            key: p.key.clone(),
            label: p.label.clone(),
            channel_count: p.channel_count,
        })
        .collect();
    presets.sort_by_key(|p| p.channel_count);
    presets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_preset_shape() {
        for count in CATALOG_CHANNEL_COUNTS {
            let map = expand_preset(count);

            let coils: Vec<u16> = map
                .iter()
                .filter(|m| m.register_type == RegisterType::Coil)
                .map(|m| m.register)
                .collect();
            assert_eq!(coils, (0..count).collect::<Vec<_>>());
            assert!(map.controllable().count() == count as usize);

            let holding: Vec<u16> = map
                .iter()
                .filter(|m| m.register_type == RegisterType::Holding)
                .map(|m| m.register)
                .collect();
            assert_eq!(holding, vec![8192, 16384]);
            assert_eq!(map.len(), count as usize + 2);
        }
    }

    #[test]
    fn test_load_preset_is_deep_copy() {
        let mut copy = load_preset("relay_8ch").unwrap();
        copy.remove(0, RegisterType::Coil).unwrap();
        assert_eq!(copy.len(), 9);

        let fresh = load_preset("relay_8ch").unwrap();
        assert_eq!(fresh.len(), 10);
        assert!(fresh.get(0, RegisterType::Coil).is_some());
    }

    #[test]
    fn test_unknown_preset() {
        assert!(matches!(
            load_preset("relay_3ch"),
            Err(ModbusError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_presets() {
        let presets = list_presets();
        let counts: Vec<u16> = presets.iter().map(|p| p.channel_count).collect();
        assert_eq!(counts, vec![4, 6, 8, 16, 32]);
        assert_eq!(presets[0].key, "relay_4ch");
    }
}
