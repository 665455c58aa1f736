//! Equipment records and the store they live in.
//!
//! Equipment persistence is owned by an external collaborator; the control
//! layer only reads records through [`EquipmentStore`] and hands back updated
//! calibration and status values. [`InMemoryEquipmentStore`] backs the CLI
//! and tests.

use async_trait::async_trait;
use fieldgate_common::DeviceStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::calibration::{Calibration, DEFAULT_SCALE};
use crate::error::{ModbusError, Result};
use crate::register::RegisterMap;
use crate::transport::{DeviceTarget, Endpoint};

/// Highest valid Modbus slave (unit) id.
pub const MAX_SLAVE_ID: u8 = 247;

/// A field device as persisted by the equipment store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Equipment {
    pub id: String,

    pub name: String,

    /// Protocol label ("modbus_tcp", "modbus_rtu")
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// `host:port`, bare host, or serial path
    pub address: String,

    /// Modbus unit id (1-247)
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,

    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    #[serde(default)]
    pub register_mappings: RegisterMap,

    /// The device cannot answer requests; control is commanded blind
    #[serde(default)]
    pub write_only: bool,

    #[serde(default)]
    pub calibration_offset: f64,

    #[serde(default = "default_scale")]
    pub calibration_scale: f64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub status: DeviceStatus,
}

fn default_protocol() -> String {
    "modbus_tcp".to_string()
}

fn default_slave_id() -> u8 {
    1
}

fn default_polling_interval_ms() -> u64 {
    5000
}

fn default_scale() -> f64 {
    DEFAULT_SCALE
}

fn default_enabled() -> bool {
    true
}

impl Equipment {
    pub fn calibration(&self) -> Calibration {
        Calibration::new(self.calibration_offset, self.calibration_scale)
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.address)
    }

    /// The device target with the given per-request timeout.
    pub fn target(&self, timeout: Duration) -> Result<DeviceTarget> {
        Ok(DeviceTarget::new(self.endpoint()?, self.slave_id, timeout))
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ModbusError::validation("equipment id cannot be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(ModbusError::validation("equipment name cannot be empty"));
        }
        validate_slave_id(self.slave_id)?;
        self.endpoint()?;
        Ok(())
    }
}

/// Check a slave id is in 1-247.
pub fn validate_slave_id(slave_id: u8) -> Result<()> {
    if slave_id == 0 || slave_id > MAX_SLAVE_ID {
        return Err(ModbusError::validation(format!(
            "slave id {} out of range 1-{}",
            slave_id, MAX_SLAVE_ID
        )));
    }
    Ok(())
}

/// Fields of an equipment record to create. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewEquipment {
    pub name: String,
    pub protocol: String,
    pub address: String,
    pub slave_id: u8,
    pub register_mappings: RegisterMap,
    pub write_only: bool,
}

impl NewEquipment {
    fn into_equipment(self, id: String) -> Equipment {
        Equipment {
            id,
            name: self.name,
            protocol: self.protocol,
            address: self.address,
            slave_id: self.slave_id,
            polling_interval_ms: default_polling_interval_ms(),
            register_mappings: self.register_mappings,
            write_only: self.write_only,
            calibration_offset: 0.0,
            calibration_scale: DEFAULT_SCALE,
            enabled: true,
            status: DeviceStatus::Unknown,
        }
    }
}

/// Equipment lookup and persistence callbacks.
#[async_trait]
pub trait EquipmentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Equipment>>;

    async fn list(&self) -> Result<Vec<Equipment>>;

    async fn create(&self, equipment: NewEquipment) -> Result<Equipment>;

    async fn update_calibration(&self, id: &str, calibration: Calibration) -> Result<()>;

    async fn update_status(&self, id: &str, status: DeviceStatus) -> Result<()>;
}

/// Process-local equipment store.
#[derive(Debug, Default)]
pub struct InMemoryEquipmentStore {
    records: RwLock<BTreeMap<String, Equipment>>,
}

impl InMemoryEquipmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing records.
    pub fn with_equipment(records: impl IntoIterator<Item = Equipment>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|e| (e.id.clone(), e)).collect()),
        }
    }

    fn lock_error() -> ModbusError {
        ModbusError::Store("equipment store lock poisoned".to_string())
    }
}

#[async_trait]
impl EquipmentStore for InMemoryEquipmentStore {
    async fn get(&self, id: &str) -> Result<Option<Equipment>> {
        let records = self.records.read().map_err(|_| Self::lock_error())?;
        Ok(records.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Equipment>> {
        let records = self.records.read().map_err(|_| Self::lock_error())?;
        Ok(records.values().cloned().collect())
    }

    async fn create(&self, equipment: NewEquipment) -> Result<Equipment> {
        let mut records = self.records.write().map_err(|_| Self::lock_error())?;

        let mut n = records.len() + 1;
        let id = loop {
            let candidate = format!("eq-{}", n);
            if !records.contains_key(&candidate) {
                break candidate;
            }
            n += 1;
        };

        let record = equipment.into_equipment(id.clone());
        record.validate()?;
        records.insert(id, record.clone());
        Ok(record)
    }

    async fn update_calibration(&self, id: &str, calibration: Calibration) -> Result<()> {
        let mut records = self.records.write().map_err(|_| Self::lock_error())?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| ModbusError::NotFound(format!("equipment '{}'", id)))?;
        record.calibration_offset = calibration.offset;
        record.calibration_scale = calibration.scale;
        Ok(())
    }

    async fn update_status(&self, id: &str, status: DeviceStatus) -> Result<()> {
        let mut records = self.records.write().map_err(|_| Self::lock_error())?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| ModbusError::NotFound(format!("equipment '{}'", id)))?;
        record.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_equipment(name: &str, slave_id: u8) -> NewEquipment {
        NewEquipment {
            name: name.to_string(),
            protocol: "modbus_tcp".to_string(),
            address: "10.0.0.20:502".to_string(),
            slave_id,
            register_mappings: RegisterMap::new(),
            write_only: false,
        }
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{ "id": "a", "name": "Relay", "address": "10.0.0.1" }"#;
        let equipment: Equipment = serde_json::from_str(json).unwrap();

        assert_eq!(equipment.slave_id, 1);
        assert_eq!(equipment.calibration_scale, 1.0);
        assert_eq!(equipment.calibration_offset, 0.0);
        assert!(equipment.enabled);
        assert!(!equipment.write_only);
        assert_eq!(equipment.status, DeviceStatus::Unknown);
        assert_eq!(equipment.endpoint().unwrap(), Endpoint::tcp("10.0.0.1", 502));
    }

    #[test]
    fn test_validate_slave_id() {
        assert!(validate_slave_id(0).is_err());
        assert!(validate_slave_id(1).is_ok());
        assert!(validate_slave_id(247).is_ok());
        assert!(validate_slave_id(248).is_err());
    }

    #[tokio::test]
    async fn test_store_create_and_update() {
        let store = InMemoryEquipmentStore::new();

        let a = store.create(new_equipment("Slave 3", 3)).await.unwrap();
        let b = store.create(new_equipment("Slave 4", 4)).await.unwrap();
        assert_ne!(a.id, b.id);

        store
            .update_calibration(&a.id, Calibration::new(1.5, 2.0))
            .await
            .unwrap();
        store.update_status(&b.id, DeviceStatus::Online).await.unwrap();

        let a = store.get(&a.id).await.unwrap().unwrap();
        assert_eq!(a.calibration(), Calibration::new(1.5, 2.0));
        let b = store.get(&b.id).await.unwrap().unwrap();
        assert_eq!(b.status, DeviceStatus::Online);

        assert_eq!(store.list().await.unwrap().len(), 2);
        assert!(matches!(
            store.update_status("missing", DeviceStatus::Offline).await,
            Err(ModbusError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_record() {
        let store = InMemoryEquipmentStore::new();
        assert!(store.create(new_equipment("Bad", 0)).await.is_err());
        assert!(store.list().await.unwrap().is_empty());
    }
}
