//! Request-facing operations of the control layer.
//!
//! [`GatewayService`] resolves equipment through the [`EquipmentStore`],
//! keeps one [`CoilSession`] per equipment id, and persists status and
//! calibration back through the store.

use fieldgate_common::DeviceStatus;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::calibration::Calibration;
use crate::config::GatewayConfig;
use crate::control::{CoilChannels, CoilSession, CoilSnapshot, CommandCache, DeviceLocks, SessionOptions};
use crate::equipment::{Equipment, EquipmentStore, NewEquipment};
use crate::error::{ModbusError, Result};
use crate::network::{NetworkScanReport, NetworkScanRequest, NetworkScanner};
use crate::poll::{self, PointReading};
use crate::preset::{self, PresetInfo};
use crate::register::{RegisterMap, RegisterMapExport};
use crate::scanner::{ScanConfig, ScanHandle, SlaveScanner, distinct_slave_ids};
use crate::transport::{Endpoint, ModbusTransport};

/// Most coils a relay preset may carry (one read request's worth).
pub const MAX_PRESET_CHANNELS: u16 = 2000;

/// What a cached session was built from. A changed record gets a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionKey {
    address: String,
    slave_id: u8,
    write_only: bool,
    channels: CoilChannels,
}

impl SessionKey {
    fn of(equipment: &Equipment) -> Self {
        Self {
            address: equipment.address.clone(),
            slave_id: equipment.slave_id,
            write_only: equipment.write_only,
            channels: CoilChannels::from_map(&equipment.register_mappings),
        }
    }
}

/// Control-layer facade.
pub struct GatewayService {
    config: GatewayConfig,
    store: Arc<dyn EquipmentStore>,
    transport: Arc<dyn ModbusTransport>,
    locks: DeviceLocks,
    cache: CommandCache,
    sessions: Mutex<HashMap<String, (SessionKey, Arc<CoilSession>)>>,
}

impl GatewayService {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn EquipmentStore>,
        transport: Arc<dyn ModbusTransport>,
    ) -> Self {
        let locks = DeviceLocks::new(config.modbus.busy_policy);
        Self {
            config,
            store,
            transport,
            locks,
            cache: CommandCache::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Fetch an equipment record.
    pub async fn equipment(&self, id: &str) -> Result<Equipment> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ModbusError::NotFound(format!("equipment '{}'", id)))
    }

    async fn session(&self, id: &str) -> Result<Arc<CoilSession>> {
        let equipment = self.equipment(id).await?;
        if !equipment.enabled {
            return Err(ModbusError::validation(format!("equipment '{}' is disabled", id)));
        }

        let key = SessionKey::of(&equipment);
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((cached, session)) = sessions.get(id) {
            if *cached == key {
                return Ok(session.clone());
            }
        }

        let options = SessionOptions {
            timeout: self.config.modbus.timeout(),
            verify_writes: self.config.modbus.verify_writes,
        };
        let session = Arc::new(CoilSession::for_equipment(
            &equipment,
            self.transport.clone(),
            options,
            self.cache.clone(),
            self.locks.clone(),
        )?);
        sessions.insert(id.to_string(), (key, session.clone()));
        Ok(session)
    }

    /// Persist the status implied by a session's latest snapshot.
    async fn record_status(&self, id: &str, status: DeviceStatus) {
        if let Err(e) = self.store.update_status(id, status).await {
            warn!(equipment = %id, error = %e, "Failed to persist equipment status");
        }
    }

    async fn finish(&self, session: &CoilSession, result: Result<CoilSnapshot>) -> Result<CoilSnapshot> {
        let status = match &result {
            Ok(snapshot) => snapshot.device_status(),
            Err(_) => session.snapshot().device_status(),
        };
        self.record_status(session.equipment_id(), status).await;
        result
    }

    /// Refresh and return every controllable coil of an equipment.
    pub async fn read_coils(&self, id: &str) -> Result<CoilSnapshot> {
        let session = self.session(id).await?;
        let result = session.read_all().await;
        self.finish(&session, result).await
    }

    /// Switch one coil.
    pub async fn write_coil(&self, id: &str, address: u16, value: bool) -> Result<CoilSnapshot> {
        let session = self.session(id).await?;
        let result = session.write_one(address, value).await;
        self.finish(&session, result).await
    }

    /// Switch every coil.
    pub async fn write_all_coils(&self, id: &str, value: bool) -> Result<CoilSnapshot> {
        let session = self.session(id).await?;
        let result = session.write_all(value).await;
        self.finish(&session, result).await
    }

    /// Follow the coil state of an equipment.
    pub async fn subscribe_coils(&self, id: &str) -> Result<watch::Receiver<CoilSnapshot>> {
        Ok(self.session(id).await?.subscribe())
    }

    /// Start a slave id scan. Invalid requests fail before anything is spawned.
    pub fn scan_slave_ids(&self, config: ScanConfig) -> Result<ScanHandle> {
        config.validate()?;
        let scanner = Arc::new(SlaveScanner::new(
            self.transport.clone(),
            self.config.discovery.clone(),
        ));
        Ok(scanner.spawn(config))
    }

    /// Create one equipment record per distinct valid slave id.
    ///
    /// Records are named `"{prefix} {id}"` and carry the configured default
    /// preset, if any. Returns how many were created.
    pub async fn create_equipment_from_slaves(
        &self,
        host: &str,
        port: u16,
        slave_ids: &[u8],
        name_prefix: Option<&str>,
    ) -> Result<usize> {
        let endpoint = match Endpoint::parse(host)? {
            Endpoint::Tcp { host, .. } => Endpoint::tcp(host, port),
            serial => serial,
        };
        let protocol = match endpoint {
            Endpoint::Tcp { .. } => "modbus_tcp",
            Endpoint::Serial { .. } => "modbus_rtu",
        };
        let prefix = name_prefix
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(self.config.discovery.name_prefix.as_str());
        let mappings = match &self.config.discovery.default_preset {
            Some(key) => preset::load_preset(key)?,
            None => RegisterMap::new(),
        };

        let mut created = 0;
        for slave_id in distinct_slave_ids(slave_ids) {
            self.store
                .create(NewEquipment {
                    name: format!("{} {}", prefix, slave_id),
                    protocol: protocol.to_string(),
                    address: endpoint.key(),
                    slave_id,
                    register_mappings: mappings.clone(),
                    write_only: false,
                })
                .await?;
            created += 1;
        }

        info!(gateway = %endpoint, created, "Equipment created from discovered slaves");
        Ok(created)
    }

    /// Start a sweep of IPv4 ranges for Modbus TCP devices not yet configured.
    /// Invalid requests fail before anything is spawned.
    pub async fn scan_network(&self, request: &NetworkScanRequest) -> Result<ScanHandle<NetworkScanReport>> {
        let known: HashSet<String> = self
            .store
            .list()
            .await?
            .iter()
            .filter_map(|e| e.endpoint().ok())
            .map(|e| e.key())
            .collect();

        let scanner = Arc::new(NetworkScanner::new(
            self.transport.clone(),
            self.config.network.clone(),
        ));
        scanner.spawn(request, known)
    }

    /// Coerce and persist an equipment's calibration.
    pub async fn apply_calibration(&self, id: &str, offset: &Value, scale: &Value) -> Result<Calibration> {
        self.equipment(id).await?;
        let calibration = Calibration::coerce(offset, scale);
        self.store.update_calibration(id, calibration).await?;
        info!(equipment = %id, offset = calibration.offset, scale = calibration.scale, "Calibration updated");
        Ok(calibration)
    }

    /// Read every readable point of an equipment, calibrated.
    pub async fn read_points(&self, id: &str) -> Result<Vec<PointReading>> {
        let equipment = self.equipment(id).await?;
        if equipment.write_only {
            return Err(ModbusError::validation(format!(
                "equipment '{}' is write-only and cannot be read",
                id
            )));
        }
        let target = equipment.target(self.config.modbus.timeout())?;

        let _guard = self.locks.acquire(id).await?;
        let result = poll::read_points(
            self.transport.as_ref(),
            &target,
            &equipment.register_mappings,
            equipment.calibration(),
        )
        .await;

        let status = match &result {
            Ok(_) => DeviceStatus::Online,
            Err(_) => DeviceStatus::Offline,
        };
        self.record_status(id, status).await;
        result
    }

    /// Register map of an N-channel relay module.
    pub fn expand_preset(&self, channel_count: u16) -> Result<RegisterMap> {
        if !(1..=MAX_PRESET_CHANNELS).contains(&channel_count) {
            return Err(ModbusError::validation(format!(
                "channel count must be 1-{}",
                MAX_PRESET_CHANNELS
            )));
        }
        Ok(preset::expand_preset(channel_count))
    }

    pub fn load_preset(&self, key: &str) -> Result<RegisterMap> {
        preset::load_preset(key)
    }

    pub fn list_presets(&self) -> Vec<PresetInfo> {
        preset::list_presets()
    }

    /// Parse an imported register map document.
    pub fn import_register_map(&self, json: &str) -> Result<RegisterMap> {
        RegisterMap::import_str(json)
    }

    /// Export an equipment's register map.
    pub async fn export_register_map(&self, id: &str) -> Result<RegisterMapExport> {
        Ok(self.equipment(id).await?.register_mappings.export())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::equipment::InMemoryEquipmentStore;
    use crate::simulator::{SimDevice, SimulatedBus};
    use serde_json::json;

    fn relay(id: &str, write_only: bool) -> Equipment {
        let mut equipment: Equipment = serde_json::from_value(json!({
            "id": id,
            "name": id,
            "address": "10.2.0.5:502",
            "slave_id": 1,
            "write_only": write_only,
        }))
        .unwrap();
        equipment.register_mappings = preset::expand_preset(4);
        equipment
    }

    fn service(bus: Arc<SimulatedBus>, equipment: Vec<Equipment>) -> (GatewayService, Arc<InMemoryEquipmentStore>) {
        let store = Arc::new(InMemoryEquipmentStore::with_equipment(equipment));
        (GatewayService::new(GatewayConfig::default(), store.clone(), bus), store)
    }

    #[tokio::test]
    async fn test_coil_operations_persist_status() {
        let bus = Arc::new(SimulatedBus::new());
        bus.add_device(&Endpoint::tcp("10.2.0.5", 502), 1, SimDevice::relay_module(4));
        let (service, store) = service(bus.clone(), vec![relay("relay", false)]);

        let snapshot = service.write_coil("relay", 2, true).await.unwrap();
        assert!(snapshot.confirmed);
        assert_eq!(store.get("relay").await.unwrap().unwrap().status, DeviceStatus::Online);

        bus.set_offline(&Endpoint::tcp("10.2.0.5", 502), true);
        assert!(service.read_coils("relay").await.is_err());
        assert_eq!(store.get("relay").await.unwrap().unwrap().status, DeviceStatus::Offline);

        // Last known state survives the failure
        let rx = service.subscribe_coils("relay").await.unwrap();
        assert_eq!(rx.borrow().state_of(2), Some(true));
    }

    #[tokio::test]
    async fn test_unknown_equipment() {
        let (service, _) = service(Arc::new(SimulatedBus::new()), vec![]);
        assert!(matches!(
            service.read_coils("nope").await,
            Err(ModbusError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_write_only_reads_never_touch_device() {
        let bus = Arc::new(SimulatedBus::new());
        bus.add_device(&Endpoint::tcp("10.2.0.5", 502), 1, SimDevice::relay_module(4).muted());
        let (service, _) = service(bus.clone(), vec![relay("blind", true)]);

        service.write_all_coils("blind", true).await.unwrap();
        let snapshot = service.read_coils("blind").await.unwrap();
        assert!(snapshot.states.iter().all(|s| s.state));
        assert!(!snapshot.confirmed);
        assert!(bus.requests().iter().all(|r| r.kind.is_write()));

        assert!(service.read_points("blind").await.is_err());
    }

    #[tokio::test]
    async fn test_create_equipment_from_slaves() {
        let bus = Arc::new(SimulatedBus::new());
        let store = Arc::new(InMemoryEquipmentStore::new());
        let config = GatewayConfig {
            discovery: DiscoveryConfig {
                default_preset: Some("relay_8ch".to_string()),
                ..DiscoveryConfig::default()
            },
            ..GatewayConfig::default()
        };
        let service = GatewayService::new(config, store.clone(), bus);

        let created = service
            .create_equipment_from_slaves("192.168.1.100", 502, &[3, 5, 3, 0], None)
            .await
            .unwrap();
        assert_eq!(created, 2);

        let mut names: Vec<_> = store.list().await.unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec!["Slave 3", "Slave 5"]);

        let first = &store.list().await.unwrap()[0];
        assert_eq!(first.address, "192.168.1.100:502");
        assert_eq!(CoilChannels::from_map(&first.register_mappings).len(), 8);

        let created = service
            .create_equipment_from_slaves("192.168.1.100", 502, &[7], Some("Relay"))
            .await
            .unwrap();
        assert_eq!(created, 1);
        assert!(store.list().await.unwrap().iter().any(|e| e.name == "Relay 7"));
    }

    #[tokio::test]
    async fn test_apply_calibration_keeps_explicit_zero() {
        let (service, store) = service(Arc::new(SimulatedBus::new()), vec![relay("relay", false)]);

        let calibration = service
            .apply_calibration("relay", &json!(3), &json!(0))
            .await
            .unwrap();
        assert_eq!(calibration, Calibration::new(3.0, 0.0));

        let calibration = service
            .apply_calibration("relay", &json!("abc"), &json!(null))
            .await
            .unwrap();
        assert_eq!(calibration, Calibration::default());
        assert_eq!(store.get("relay").await.unwrap().unwrap().calibration(), Calibration::default());

        assert!(service.apply_calibration("missing", &json!(1), &json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_session_rebuilt_when_record_changes() {
        let bus = Arc::new(SimulatedBus::new());
        bus.add_device(&Endpoint::tcp("10.2.0.5", 502), 1, SimDevice::relay_module(8));
        let store = Arc::new(InMemoryEquipmentStore::with_equipment([relay("relay", false)]));
        let service = GatewayService::new(GatewayConfig::default(), store.clone(), bus);

        assert_eq!(service.read_coils("relay").await.unwrap().states.len(), 4);

        let mut wider = relay("relay", false);
        wider.register_mappings = preset::expand_preset(8);
        let store = Arc::new(InMemoryEquipmentStore::with_equipment([wider]));
        let service = GatewayService { store, ..service };
        assert_eq!(service.read_coils("relay").await.unwrap().states.len(), 8);
    }

    #[test]
    fn test_expand_preset_bounds() {
        let (service, _) = service(Arc::new(SimulatedBus::new()), vec![]);
        assert!(service.expand_preset(0).is_err());
        assert!(service.expand_preset(MAX_PRESET_CHANNELS + 1).is_err());
        assert_eq!(service.expand_preset(6).unwrap().len(), 8);
    }
}
