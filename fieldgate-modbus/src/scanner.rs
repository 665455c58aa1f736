//! Slave id discovery behind a Modbus gateway.
//!
//! Unit ids are probed one after another with a small register read. Any
//! answer within the timeout, including a Modbus exception from the device,
//! marks the id as present. A gateway reporting the unit unreachable
//! (exception 0x0A/0x0B) does not. Progress is reported after every probe, and a scan can be
//! cancelled between probes through a shared [`ScanCancel`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::DiscoveryConfig;
use crate::equipment::{MAX_SLAVE_ID, validate_slave_id};
use crate::error::{ModbusError, Result};
use crate::transport::{DEFAULT_MODBUS_PORT, DeviceTarget, Endpoint, ModbusTransport};

/// Registers kept from each probe answer.
pub const MAX_SAMPLE_LEN: usize = 8;

/// Slave scan request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// Gateway host (or serial path)
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub start_slave_id: u8,

    pub end_slave_id: u8,

    /// Per-probe timeout
    pub timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_MODBUS_PORT
}

impl ScanConfig {
    pub fn new(host: impl Into<String>, port: u16, start: u8, end: u8, timeout_ms: u64) -> Self {
        Self {
            host: host.into(),
            port,
            start_slave_id: start,
            end_slave_id: end,
            timeout_ms,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ModbusError::validation("scan host cannot be empty"));
        }
        validate_slave_id(self.start_slave_id)?;
        validate_slave_id(self.end_slave_id)?;
        if self.start_slave_id > self.end_slave_id {
            return Err(ModbusError::validation(format!(
                "start slave id {} is after end slave id {}",
                self.start_slave_id, self.end_slave_id
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ModbusError::validation("scan timeout must be greater than 0"));
        }
        Ok(())
    }

    /// The gateway endpoint. A serial path ignores `port`.
    pub fn endpoint(&self) -> Result<Endpoint> {
        match Endpoint::parse(&self.host)? {
            Endpoint::Tcp { host, .. } => Ok(Endpoint::tcp(host, self.port)),
            serial => Ok(serial),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Number of ids in the range.
    pub fn total(&self) -> u32 {
        u32::from(self.end_slave_id) - u32::from(self.start_slave_id) + 1
    }
}

/// A slave id that answered a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredSlave {
    pub slave_id: u8,
    pub response_time_ms: u64,
    /// First registers of the probe answer; empty when the slave answered
    /// with an exception.
    pub sample_data: Vec<u16>,
}

/// Scan progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    /// Probes finished so far
    pub current: u32,
    pub total: u32,
    /// Slaves found so far
    pub found: u32,
    pub percent: u8,
    pub done: bool,
    pub cancelled: bool,
}

/// Result of a slave scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveScanReport {
    pub slaves: Vec<DiscoveredSlave>,
    pub total_scanned: u32,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Shared cancellation flag for a running scan.
#[derive(Debug, Clone, Default)]
pub struct ScanCancel(Arc<AtomicBool>);

impl ScanCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A scan running in the background.
pub struct ScanHandle<R = SlaveScanReport> {
    pub progress: mpsc::UnboundedReceiver<ScanProgress>,
    pub cancel: ScanCancel,
    task: JoinHandle<Result<R>>,
}

impl<R> ScanHandle<R> {
    pub(crate) fn new(
        progress: mpsc::UnboundedReceiver<ScanProgress>,
        cancel: ScanCancel,
        task: JoinHandle<Result<R>>,
    ) -> Self {
        Self {
            progress,
            cancel,
            task,
        }
    }

    /// Request cancellation. Probes already in flight finish or time out.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the scan to finish.
    pub async fn join(self) -> Result<R> {
        self.task
            .await
            .map_err(|e| ModbusError::protocol(format!("scan task aborted: {}", e)))?
    }
}

/// Sequential unit id prober.
pub struct SlaveScanner {
    transport: Arc<dyn ModbusTransport>,
    settings: DiscoveryConfig,
}

impl SlaveScanner {
    pub fn new(transport: Arc<dyn ModbusTransport>, settings: DiscoveryConfig) -> Self {
        Self { transport, settings }
    }

    /// Start a scan on the runtime and return its handle.
    pub fn spawn(self: Arc<Self>, config: ScanConfig) -> ScanHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = ScanCancel::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { self.scan(&config, &tx, &task_cancel).await });
        ScanHandle::new(rx, cancel, task)
    }

    /// Probe every id in the configured range.
    ///
    /// Fails only when the request is invalid or the gateway cannot be reached
    /// at all. Per-id timeouts and errors just mean "not found".
    pub async fn scan(
        &self,
        config: &ScanConfig,
        progress: &mpsc::UnboundedSender<ScanProgress>,
        cancel: &ScanCancel,
    ) -> Result<SlaveScanReport> {
        config.validate()?;
        let endpoint = config.endpoint()?;
        let timeout = config.timeout();

        self.transport.check_reachable(&endpoint, timeout).await?;

        let started = Instant::now();
        let total = config.total();
        let delay = Duration::from_millis(self.settings.inter_probe_delay_ms);
        let mut slaves = Vec::new();
        let mut scanned = 0u32;
        let mut cancelled = false;

        info!(
            gateway = %endpoint,
            start = config.start_slave_id,
            end = config.end_slave_id,
            "Starting slave scan"
        );

        for slave_id in config.start_slave_id..=config.end_slave_id {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let target = DeviceTarget::new(endpoint.clone(), slave_id, timeout);
            if let Some(slave) = self.probe(&target).await {
                debug!(slave_id, response_ms = slave.response_time_ms, "Slave answered");
                slaves.push(slave);
            }
            scanned += 1;

            // The last probe is reported by the final event
            if scanned < total {
                let _ = progress.send(ScanProgress {
                    current: scanned,
                    total,
                    found: slaves.len() as u32,
                    percent: (scanned * 100 / total) as u8,
                    done: false,
                    cancelled: false,
                });
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let _ = progress.send(ScanProgress {
            current: scanned,
            total,
            found: slaves.len() as u32,
            percent: 100,
            done: true,
            cancelled,
        });

        info!(
            gateway = %endpoint,
            found = slaves.len(),
            scanned,
            cancelled,
            "Slave scan finished"
        );

        Ok(SlaveScanReport {
            slaves,
            total_scanned: scanned,
            cancelled,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn probe(&self, target: &DeviceTarget) -> Option<DiscoveredSlave> {
        let started = Instant::now();
        let result = self
            .transport
            .read_registers(
                target,
                self.settings.probe_register_type,
                self.settings.probe_address,
                self.settings.probe_quantity,
            )
            .await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(mut values) => {
                values.truncate(MAX_SAMPLE_LEN);
                Some(DiscoveredSlave {
                    slave_id: target.unit_id,
                    response_time_ms,
                    sample_data: values,
                })
            }
            Err(e) if e.device_answered() => Some(DiscoveredSlave {
                slave_id: target.unit_id,
                response_time_ms,
                sample_data: Vec::new(),
            }),
            Err(e) => {
                debug!(slave_id = target.unit_id, error = %e, "No answer");
                None
            }
        }
    }
}

/// Keep distinct ids in 1-247, in first-seen order.
pub fn distinct_slave_ids(ids: &[u8]) -> Vec<u8> {
    let mut seen = [false; MAX_SLAVE_ID as usize + 1];
    ids.iter()
        .copied()
        .filter(|id| (1..=MAX_SLAVE_ID).contains(id))
        .filter(|&id| !std::mem::replace(&mut seen[id as usize], true))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{SimDevice, SimulatedBus};

    fn gateway() -> Endpoint {
        Endpoint::tcp("192.168.1.100", 502)
    }

    fn scan_config(start: u8, end: u8) -> ScanConfig {
        ScanConfig::new("192.168.1.100", 502, start, end, 100)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ScanProgress>) -> Vec<ScanProgress> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_scan_config_validation() {
        assert!(scan_config(1, 247).validate().is_ok());
        assert!(scan_config(0, 5).validate().is_err());
        assert!(scan_config(6, 5).validate().is_err());
        assert!(scan_config(1, 248).validate().is_err());
        assert!(ScanConfig::new("gw", 502, 1, 2, 0).validate().is_err());
        assert!(ScanConfig::new(" ", 502, 1, 2, 10).validate().is_err());
    }

    #[test]
    fn test_scan_config_json() {
        let config: ScanConfig = serde_json::from_str(
            r#"{ "host": "10.0.0.2", "startSlaveId": 1, "endSlaveId": 10, "timeoutMs": 250 }"#,
        )
        .unwrap();
        assert_eq!(config.port, 502);
        assert_eq!(config.total(), 10);
        assert_eq!(config.endpoint().unwrap(), Endpoint::tcp("10.0.0.2", 502));
    }

    #[tokio::test]
    async fn test_scan_finds_single_responder() {
        let bus = Arc::new(SimulatedBus::new());
        bus.add_device(&gateway(), 3, SimDevice::default().with_holding(0, &[1, 2, 3, 4]));

        let scanner = SlaveScanner::new(bus.clone(), DiscoveryConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = scanner
            .scan(&scan_config(1, 5), &tx, &ScanCancel::new())
            .await
            .unwrap();

        assert_eq!(report.slaves.len(), 1);
        assert_eq!(report.slaves[0].slave_id, 3);
        assert_eq!(report.slaves[0].sample_data, vec![1, 2, 3, 4]);
        assert_eq!(report.total_scanned, 5);
        assert!(!report.cancelled);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 5);
        assert_eq!(events.iter().filter(|e| e.percent == 100).count(), 1);
        let last = events.last().unwrap();
        assert!(last.done && !last.cancelled);
        assert_eq!(last.found, 1);
    }

    #[tokio::test]
    async fn test_exception_counts_as_present() {
        let bus = Arc::new(SimulatedBus::new());
        // Nothing mapped at the probe address
        bus.add_device(&gateway(), 2, SimDevice::default().with_holding(100, &[9]));

        let scanner = SlaveScanner::new(bus.clone(), DiscoveryConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let report = scanner
            .scan(&scan_config(1, 3), &tx, &ScanCancel::new())
            .await
            .unwrap();

        assert_eq!(report.slaves.len(), 1);
        assert_eq!(report.slaves[0].slave_id, 2);
        assert!(report.slaves[0].sample_data.is_empty());
    }

    #[tokio::test]
    async fn test_gateway_exceptions_are_not_slaves() {
        let bus = Arc::new(SimulatedBus::new());
        bus.add_gateway(&gateway());
        bus.add_device(&gateway(), 3, SimDevice::default().with_holding(0, &[5, 6]));

        let scanner = SlaveScanner::new(bus.clone(), DiscoveryConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = scanner
            .scan(&scan_config(1, 5), &tx, &ScanCancel::new())
            .await
            .unwrap();

        let ids: Vec<u8> = report.slaves.iter().map(|s| s.slave_id).collect();
        assert_eq!(ids, vec![3]);
        assert_eq!(report.total_scanned, 5);
        assert_eq!(drain(&mut rx).last().map(|e| e.found), Some(1));
    }

    #[tokio::test]
    async fn test_sample_truncated() {
        let bus = Arc::new(SimulatedBus::new());
        bus.add_device(&gateway(), 1, SimDevice::default().with_holding(0, &[7; 12]));

        let probe = DiscoveryConfig {
            probe_quantity: 12,
            ..DiscoveryConfig::default()
        };
        let scanner = SlaveScanner::new(bus.clone(), probe);
        let (tx, _rx) = mpsc::unbounded_channel();
        let report = scanner
            .scan(&scan_config(1, 1), &tx, &ScanCancel::new())
            .await
            .unwrap();

        assert_eq!(report.slaves[0].sample_data.len(), MAX_SAMPLE_LEN);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_probe() {
        let cancel = ScanCancel::new();
        let hook_cancel = cancel.clone();
        let bus = Arc::new(SimulatedBus::new().with_request_hook(move |request| {
            if request.unit_id == 2 {
                hook_cancel.cancel();
            }
        }));
        bus.add_endpoint(&gateway());

        let scanner = SlaveScanner::new(bus.clone(), DiscoveryConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = scanner.scan(&scan_config(1, 10), &tx, &cancel).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.total_scanned, 2);
        assert!(bus.requests().iter().all(|r| r.unit_id <= 2));

        let events = drain(&mut rx);
        let finals: Vec<_> = events.iter().filter(|e| e.done).collect();
        assert_eq!(finals.len(), 1);
        assert!(finals[0].cancelled);
        assert_eq!(finals[0].percent, 100);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_fails_scan() {
        let bus = Arc::new(SimulatedBus::new());
        let scanner = SlaveScanner::new(bus.clone(), DiscoveryConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = scanner
            .scan(&scan_config(1, 5), &tx, &ScanCancel::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Connection(_)));
        assert!(bus.requests().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_spawned_scan() {
        let bus = Arc::new(SimulatedBus::new());
        bus.add_device(&gateway(), 4, SimDevice::default().with_holding(0, &[0; 4]));

        let scanner = Arc::new(SlaveScanner::new(bus, DiscoveryConfig::default()));
        let mut handle = scanner.spawn(scan_config(1, 6));

        let mut last = None;
        while let Some(event) = handle.progress.recv().await {
            last = Some(event);
        }
        assert!(last.unwrap().done);

        let report = handle.join().await.unwrap();
        assert_eq!(report.slaves.iter().map(|s| s.slave_id).collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn test_distinct_slave_ids() {
        assert_eq!(distinct_slave_ids(&[3, 0, 3, 248, 5, 247]), vec![3, 5, 247]);
    }
}
