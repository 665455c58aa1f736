//! Register map model: the addressable points of one device.
//!
//! A [`RegisterMap`] is an ordered list of [`RegisterMapping`]s, unique by
//! `(register, type)`. Maps are imported from operator-supplied JSON (a bare
//! list or a `{ mappings: [...] }` envelope) and exported with a version stamp.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{ModbusError, Result};

/// Version written into register map exports.
pub const EXPORT_VERSION: &str = "1.0";

/// Highest addressable register (protocol-relative, 16-bit).
pub const MAX_REGISTER: i64 = u16::MAX as i64;

/// Modbus register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    /// Discrete output coils (read/write, 1-bit)
    Coil,
    /// Discrete input contacts (read-only, 1-bit)
    Discrete,
    /// Holding registers (read/write, 16-bit)
    Holding,
    /// Input registers (read-only, 16-bit)
    Input,
}

impl RegisterType {
    /// Return the string name for this register type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
            RegisterType::Holding => "holding",
            RegisterType::Input => "input",
        }
    }

    /// Single-bit point types.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Discrete)
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegisterType {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "coil" => Ok(RegisterType::Coil),
            "discrete" => Ok(RegisterType::Discrete),
            "holding" => Ok(RegisterType::Holding),
            "input" => Ok(RegisterType::Input),
            other => Err(ModbusError::validation(format!(
                "invalid register type '{}' (use coil, discrete, holding or input)",
                other
            ))),
        }
    }
}

/// Value interpretation of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Single bit
    Bool,
    /// Unsigned 16-bit integer
    Uint16,
    /// Signed 16-bit integer
    Int16,
    /// Unsigned 32-bit integer (2 registers, big-endian)
    Uint32,
    /// Signed 32-bit integer (2 registers, big-endian)
    Int32,
    /// 32-bit float (2 registers, big-endian)
    Float32,
}

impl DataType {
    /// Return the string name for this data type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Uint16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Uint32 => "uint32",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
        }
    }

    /// Number of 16-bit registers one value occupies.
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::Bool | DataType::Uint16 | DataType::Int16 => 1,
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 2,
        }
    }

    /// Default data type for a register type when none is given.
    pub fn default_for(register_type: RegisterType) -> Self {
        if register_type.is_bit() {
            DataType::Bool
        } else {
            DataType::Uint16
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bool" => Ok(DataType::Bool),
            "uint16" => Ok(DataType::Uint16),
            "int16" => Ok(DataType::Int16),
            "uint32" => Ok(DataType::Uint32),
            "int32" => Ok(DataType::Int32),
            "float32" => Ok(DataType::Float32),
            other => Err(ModbusError::validation(format!(
                "invalid data type '{}' (use bool, uint16, int16, uint32, int32 or float32)",
                other
            ))),
        }
    }
}

/// Access mode of a point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Read,
    Write,
    Readwrite,
}

impl Access {
    /// Return the string name for this access mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Readwrite => "readwrite",
        }
    }

    pub fn readable(&self) -> bool {
        matches!(self, Access::Read | Access::Readwrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Access::Write | Access::Readwrite)
    }
}

impl FromStr for Access {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "read" => Ok(Access::Read),
            "write" => Ok(Access::Write),
            "readwrite" => Ok(Access::Readwrite),
            other => Err(ModbusError::validation(format!(
                "invalid access '{}' (use read, write or readwrite)",
                other
            ))),
        }
    }
}

/// One addressable point on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMapping {
    /// Human label
    pub name: String,

    /// Zero-based, protocol-relative address
    pub register: u16,

    /// Register type
    #[serde(rename = "type")]
    pub register_type: RegisterType,

    /// Value interpretation
    pub data_type: DataType,

    /// Access mode
    pub access: Access,
}

impl RegisterMapping {
    /// Create a mapping, validating the type/data-type invariant.
    pub fn new(
        name: impl Into<String>,
        register: u16,
        register_type: RegisterType,
        data_type: DataType,
        access: Access,
    ) -> Result<Self> {
        let mapping = Self {
            name: name.into().trim().to_string(),
            register,
            register_type,
            data_type,
            access,
        };
        mapping.validate()?;
        Ok(mapping)
    }

    /// Build a mapping from untyped manual-edit input.
    pub fn from_raw(
        name: &str,
        register: i64,
        register_type: &str,
        data_type: &str,
        access: &str,
    ) -> Result<Self> {
        let register = checked_register(register)?;
        Self::new(
            name,
            register,
            register_type.parse()?,
            data_type.parse()?,
            access.parse()?,
        )
    }

    /// A coil the operator may both read and switch.
    pub fn is_controllable(&self) -> bool {
        self.register_type == RegisterType::Coil && self.access == Access::Readwrite
    }

    /// Check the mapping invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ModbusError::validation("mapping name cannot be empty"));
        }

        if self.register_type.is_bit() && self.data_type != DataType::Bool {
            return Err(ModbusError::validation(format!(
                "'{}': {} points must use data type bool, got {}",
                self.name, self.register_type, self.data_type
            )));
        }

        if self.register_type == RegisterType::Discrete && self.access.writable() {
            return Err(ModbusError::validation(format!(
                "'{}': discrete inputs are read-only",
                self.name
            )));
        }

        if self.register_type == RegisterType::Input && self.access.writable() {
            return Err(ModbusError::validation(format!(
                "'{}': input registers are read-only",
                self.name
            )));
        }

        Ok(())
    }
}

fn checked_register(register: i64) -> Result<u16> {
    if register < 0 {
        return Err(ModbusError::validation(format!(
            "register {} must not be negative",
            register
        )));
    }
    if register > MAX_REGISTER {
        return Err(ModbusError::validation(format!(
            "register {} exceeds {}",
            register, MAX_REGISTER
        )));
    }
    Ok(register as u16)
}

/// Ordered register map, unique by `(register, type)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<RegisterMapping>", into = "Vec<RegisterMapping>")]
pub struct RegisterMap {
    mappings: Vec<RegisterMapping>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from mappings, validating each one and rejecting duplicates.
    pub fn from_mappings(mappings: impl IntoIterator<Item = RegisterMapping>) -> Result<Self> {
        let mut map = Self::new();
        for mapping in mappings {
            map.push(mapping)?;
        }
        Ok(map)
    }

    /// Append a mapping.
    pub fn push(&mut self, mapping: RegisterMapping) -> Result<()> {
        mapping.validate()?;
        if self.get(mapping.register, mapping.register_type).is_some() {
            return Err(ModbusError::validation(format!(
                "duplicate {} register {}",
                mapping.register_type, mapping.register
            )));
        }
        self.mappings.push(mapping);
        Ok(())
    }

    /// Remove the mapping at `(register, type)`.
    pub fn remove(&mut self, register: u16, register_type: RegisterType) -> Option<RegisterMapping> {
        let index = self
            .mappings
            .iter()
            .position(|m| m.register == register && m.register_type == register_type)?;
        Some(self.mappings.remove(index))
    }

    pub fn get(&self, register: u16, register_type: RegisterType) -> Option<&RegisterMapping> {
        self.mappings
            .iter()
            .find(|m| m.register == register && m.register_type == register_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterMapping> {
        self.mappings.iter()
    }

    pub fn as_slice(&self) -> &[RegisterMapping] {
        &self.mappings
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Coils that can be both read and written, in map order.
    pub fn controllable(&self) -> impl Iterator<Item = &RegisterMapping> {
        self.mappings.iter().filter(|m| m.is_controllable())
    }

    /// Points that can be polled, in map order.
    pub fn readable(&self) -> impl Iterator<Item = &RegisterMapping> {
        self.mappings.iter().filter(|m| m.access.readable())
    }

    /// Export with version and timestamp.
    pub fn export(&self) -> RegisterMapExport {
        RegisterMapExport {
            version: EXPORT_VERSION.to_string(),
            exported_at: fieldgate_common::current_timestamp_iso8601(),
            mappings: self.mappings.clone(),
        }
    }

    /// Export as a pretty-printed JSON document.
    pub fn export_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.export())
            .map_err(|e| ModbusError::protocol(format!("failed to encode register map: {}", e)))
    }

    /// Import from a JSON string.
    pub fn import_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| ModbusError::validation(format!("invalid register map JSON: {}", e)))?;
        Self::import_value(&value)
    }

    /// Import from a parsed JSON document.
    ///
    /// Accepts a bare list or a `{ mappings: [...] }` envelope. Entries missing
    /// `name` or `register` are dropped; a register given as a non-numeric string
    /// falls back to the entry's list index.
    pub fn import_value(value: &Value) -> Result<Self> {
        let entries = match value {
            Value::Array(items) => items,
            Value::Object(obj) => match obj.get("mappings") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(ModbusError::validation(
                        "register map object must contain a 'mappings' list",
                    ));
                }
            },
            _ => {
                return Err(ModbusError::validation(
                    "register map must be a list or an object with a 'mappings' list",
                ));
            }
        };

        let mut map = Self::new();
        for (index, entry) in entries.iter().enumerate() {
            let Some(mapping) = import_entry(index, entry)? else {
                debug!(index, "Dropping register map entry without name or register");
                continue;
            };
            map.push(mapping)
                .map_err(|e| ModbusError::validation(format!("entry {}: {}", index, e)))?;
        }

        Ok(map)
    }
}

impl TryFrom<Vec<RegisterMapping>> for RegisterMap {
    type Error = ModbusError;

    fn try_from(mappings: Vec<RegisterMapping>) -> Result<Self> {
        Self::from_mappings(mappings)
    }
}

impl From<RegisterMap> for Vec<RegisterMapping> {
    fn from(map: RegisterMap) -> Self {
        map.mappings
    }
}

impl<'a> IntoIterator for &'a RegisterMap {
    type Item = &'a RegisterMapping;
    type IntoIter = std::slice::Iter<'a, RegisterMapping>;

    fn into_iter(self) -> Self::IntoIter {
        self.mappings.iter()
    }
}

/// Persisted JSON shape of an exported register map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMapExport {
    pub version: String,
    pub exported_at: String,
    pub mappings: Vec<RegisterMapping>,
}

enum RawRegister {
    Number(i64),
    Unparsed,
}

fn raw_register(value: &Value) -> Option<RawRegister> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(v) => Some(RawRegister::Number(v)),
            None => n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| RawRegister::Number(f as i64))
                .or(Some(RawRegister::Unparsed)),
        },
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(
            s.trim()
                .parse::<i64>()
                .map(RawRegister::Number)
                .unwrap_or(RawRegister::Unparsed),
        ),
        _ => None,
    }
}

fn string_field<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
}

fn import_entry(index: usize, entry: &Value) -> Result<Option<RegisterMapping>> {
    let Some(obj) = entry.as_object() else {
        return Ok(None);
    };

    let Some(name) = obj
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty())
    else {
        return Ok(None);
    };
    let Some(register) = obj.get("register").and_then(raw_register) else {
        return Ok(None);
    };

    let err = |e: ModbusError| ModbusError::validation(format!("entry {}: {}", index, e));

    let register = match register {
        RawRegister::Number(v) => checked_register(v).map_err(err)?,
        RawRegister::Unparsed => checked_register(index as i64).map_err(err)?,
    };

    let register_type: RegisterType = string_field(obj, &["type", "register_type"])
        .ok_or_else(|| ModbusError::validation(format!("entry {}: missing type", index)))?
        .parse()
        .map_err(err)?;

    let data_type = match string_field(obj, &["dataType", "data_type"]) {
        Some(s) => s.parse().map_err(err)?,
        None => DataType::default_for(register_type),
    };

    let access = match string_field(obj, &["access"]) {
        Some(s) => s.parse().map_err(err)?,
        None => Access::default(),
    };

    RegisterMapping::new(name, register, register_type, data_type, access)
        .map(Some)
        .map_err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn coil(name: &str, register: u16) -> RegisterMapping {
        RegisterMapping::new(name, register, RegisterType::Coil, DataType::Bool, Access::Readwrite)
            .unwrap()
    }

    #[test]
    fn test_from_raw_rejects_bad_input() {
        assert!(RegisterMapping::from_raw("Relay", -1, "coil", "bool", "readwrite").is_err());
        assert!(RegisterMapping::from_raw("Relay", 70000, "coil", "bool", "readwrite").is_err());
        assert!(RegisterMapping::from_raw("   ", 0, "coil", "bool", "readwrite").is_err());
        assert!(RegisterMapping::from_raw("Relay", 0, "register", "bool", "read").is_err());
        assert!(RegisterMapping::from_raw("Relay", 0, "coil", "double", "read").is_err());
        assert!(RegisterMapping::from_raw("Relay", 0, "coil", "bool", "rw").is_err());
        assert!(RegisterMapping::from_raw("Relay", 0, "coil", "uint16", "read").is_err());

        let ok = RegisterMapping::from_raw(" Temp ", 10, "holding", "float32", "read").unwrap();
        assert_eq!(ok.name, "Temp");
        assert_eq!(ok.data_type.register_count(), 2);
    }

    #[test]
    fn test_controllable() {
        let mut map = RegisterMap::new();
        map.push(coil("Relay 1", 0)).unwrap();
        map.push(
            RegisterMapping::new("Status", 1, RegisterType::Coil, DataType::Bool, Access::Read)
                .unwrap(),
        )
        .unwrap();
        map.push(
            RegisterMapping::new(
                "Setpoint",
                0,
                RegisterType::Holding,
                DataType::Uint16,
                Access::Readwrite,
            )
            .unwrap(),
        )
        .unwrap();

        let controllable: Vec<_> = map.controllable().map(|m| m.name.as_str()).collect();
        assert_eq!(controllable, vec!["Relay 1"]);
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let mut map = RegisterMap::new();
        map.push(coil("Relay 1", 3)).unwrap();
        assert!(map.push(coil("Relay 1 again", 3)).is_err());

        // Same address, different type is fine
        map.push(
            RegisterMapping::new("Level", 3, RegisterType::Holding, DataType::Uint16, Access::Read)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_import_bare_list_and_envelope() {
        let list = json!([
            { "name": "Pump", "register": 0, "type": "coil", "dataType": "bool", "access": "readwrite" },
            { "name": "Flow", "register": "4", "type": "input", "dataType": "float32", "access": "read" }
        ]);
        let envelope = json!({ "version": "1.0", "mappings": list.clone() });

        let a = RegisterMap::import_value(&list).unwrap();
        let b = RegisterMap::import_value(&envelope).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_slice()[1].register, 4);
    }

    #[test]
    fn test_import_drops_incomplete_entries() {
        let list = json!([
            { "register": 0, "type": "coil" },
            { "name": "No register", "type": "coil" },
            { "name": "Blank register", "register": "", "type": "coil" },
            { "name": "", "register": 3, "type": "coil" },
            { "name": "   ", "register": 4, "type": "coil" },
            "not an object",
            { "name": "Kept", "register": 2, "type": "coil", "access": "readwrite" }
        ]);

        let map = RegisterMap::import_value(&list).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.as_slice()[0].name, "Kept");
        assert_eq!(map.as_slice()[0].data_type, DataType::Bool);
    }

    #[test]
    fn test_import_unparsed_register_falls_back_to_index() {
        let list = json!([
            { "name": "A", "register": 7, "type": "coil", "access": "readwrite" },
            { "name": "B", "register": "ch-two", "type": "coil", "access": "readwrite" }
        ]);

        let map = RegisterMap::import_value(&list).unwrap();
        assert_eq!(map.as_slice()[1].register, 1);
    }

    #[test]
    fn test_import_rejects_invalid_entries() {
        let negative = json!([{ "name": "A", "register": -5, "type": "coil" }]);
        let bad_type = json!([{ "name": "A", "register": 1, "type": "analog" }]);
        let bad_envelope = json!({ "points": [] });

        assert!(matches!(
            RegisterMap::import_value(&negative),
            Err(ModbusError::Validation(_))
        ));
        assert!(RegisterMap::import_value(&bad_type).is_err());
        assert!(RegisterMap::import_value(&bad_envelope).is_err());
        assert!(RegisterMap::import_str("{ not json").is_err());
    }

    #[test]
    fn test_export_then_import_preserves_order() {
        let map = RegisterMap::from_mappings([
            coil("Relay 2", 1),
            coil("Relay 1", 0),
            RegisterMapping::new(
                "Voltage",
                100,
                RegisterType::Input,
                DataType::Int32,
                Access::Read,
            )
            .unwrap(),
        ])
        .unwrap();

        let json = map.export_json().unwrap();
        let doc: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(doc["version"], "1.0");
        assert_eq!(doc["mappings"][2]["dataType"], "int32");
        assert_eq!(doc["mappings"][2]["type"], "input");

        let reimported = RegisterMap::import_str(&json).unwrap();
        assert_eq!(reimported, map);
    }

    #[test]
    fn test_serde_validates() {
        let bad = r#"[{"name":"X","register":1,"type":"coil","dataType":"uint16","access":"read"}]"#;
        assert!(serde_json::from_str::<RegisterMap>(bad).is_err());
    }
}
