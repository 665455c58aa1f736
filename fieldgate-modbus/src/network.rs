//! IPv4 network sweep for Modbus TCP devices.
//!
//! Every `host:port` of the requested ranges is checked for a listening
//! socket, with at most `concurrency` probes in flight. Endpoints that already
//! belong to an equipment record are counted and skipped; the rest are asked
//! for their device identification and disconnected again. Progress is
//! reported as probes finish, and cancellation stops new probes from starting.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{ModbusError, Result};
use crate::scanner::{ScanCancel, ScanHandle, ScanProgress};
use crate::transport::{DeviceIdentification, DeviceTarget, Endpoint, ModbusTransport};

/// Narrowest CIDR prefix accepted (a /16 is 65536 addresses).
pub const MIN_PREFIX_LEN: u8 = 16;

/// Most addresses a single `a-b` range may cover.
pub const MAX_RANGE_HOSTS: u32 = 1 << (32 - MIN_PREFIX_LEN);

/// An inclusive block of IPv4 hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkRange {
    first: u32,
    last: u32,
}

impl NetworkRange {
    /// Parse `a.b.c.d`, `a.b.c.d/n` (n >= 16) or `a.b.c.d-a.b.c.e`.
    ///
    /// CIDR blocks wider than /31 skip their network and broadcast addresses.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let invalid = |reason: &str| ModbusError::validation(format!("invalid range '{}': {}", input, reason));

        if let Some((addr, prefix)) = input.split_once('/') {
            let addr = parse_ipv4(addr).ok_or_else(|| invalid("bad address"))?;
            let prefix: u8 = prefix.trim().parse().map_err(|_| invalid("bad prefix length"))?;
            if !(MIN_PREFIX_LEN..=32).contains(&prefix) {
                return Err(invalid("prefix length must be between 16 and 32"));
            }

            let mask = u32::MAX.checked_shl(u32::from(32 - prefix)).unwrap_or(0);
            let network = u32::from(addr) & mask;
            let broadcast = network | !mask;
            return Ok(if prefix >= 31 {
                Self {
                    first: network,
                    last: broadcast,
                }
            } else {
                Self {
                    first: network + 1,
                    last: broadcast - 1,
                }
            });
        }

        if let Some((start, end)) = input.split_once('-') {
            let first = parse_ipv4(start).ok_or_else(|| invalid("bad start address"))?;
            let last = parse_ipv4(end).ok_or_else(|| invalid("bad end address"))?;
            let (first, last) = (u32::from(first), u32::from(last));
            if first > last {
                return Err(invalid("start is after end"));
            }
            if last - first >= MAX_RANGE_HOSTS {
                return Err(invalid("range covers more than 65536 addresses"));
            }
            return Ok(Self { first, last });
        }

        let addr = u32::from(parse_ipv4(input).ok_or_else(|| invalid("bad address"))?);
        Ok(Self {
            first: addr,
            last: addr,
        })
    }

    pub fn len(&self) -> usize {
        (self.last - self.first) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        (self.first..=self.last).map(Ipv4Addr::from)
    }
}

impl fmt::Display for NetworkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", Ipv4Addr::from(self.first))
        } else {
            write!(f, "{}-{}", Ipv4Addr::from(self.first), Ipv4Addr::from(self.last))
        }
    }
}

fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    s.trim().parse().ok()
}

/// Network scan request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkScanRequest {
    pub ranges: Vec<String>,

    /// Ports probed on every host; empty means the configured defaults
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl NetworkScanRequest {
    /// Distinct `(host, port)` pairs to probe, in range order.
    pub fn targets(&self, default_ports: &[u16]) -> Result<Vec<(Ipv4Addr, u16)>> {
        if self.ranges.is_empty() {
            return Err(ModbusError::validation("at least one range is required"));
        }
        let ranges = self
            .ranges
            .iter()
            .map(|r| NetworkRange::parse(r))
            .collect::<Result<Vec<_>>>()?;

        let mut ports = if self.ports.is_empty() {
            default_ports.to_vec()
        } else {
            self.ports.clone()
        };
        ports.sort_unstable();
        ports.dedup();
        if ports.is_empty() {
            return Err(ModbusError::validation("at least one port is required"));
        }
        if ports.contains(&0) {
            return Err(ModbusError::validation("port 0 is not valid"));
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for ip in ranges.iter().flat_map(|r| r.hosts()) {
            for &port in &ports {
                if seen.insert((ip, port)) {
                    targets.push((ip, port));
                }
            }
        }
        Ok(targets)
    }
}

/// A Modbus TCP endpoint found by the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredNetworkDevice {
    pub address: String,
    pub port: u16,
    pub suggested_name: String,
    pub device_info: DeviceIdentification,
    /// The device answered identification or a register read
    pub responsive: bool,
}

/// Result of a network sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkScanReport {
    pub devices: Vec<DiscoveredNetworkDevice>,
    /// Reachable endpoints that already belong to an equipment record
    pub existing_devices_found: u32,
    /// `host:port` pairs checked
    pub hosts_probed: u32,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Name offered for a discovered device.
pub fn suggested_name(address: &str, info: &DeviceIdentification) -> String {
    let field = |key: &str| info.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    if let Some(product) = field("product_name") {
        return product.to_string();
    }
    match (field("vendor"), field("product_code")) {
        (Some(vendor), Some(code)) => format!("{} {}", vendor, code),
        (Some(vendor), None) => vendor.to_string(),
        _ => format!("Modbus device {}", address),
    }
}

enum ProbeOutcome {
    Closed,
    Known,
    Found(Ipv4Addr, DiscoveredNetworkDevice),
}

/// Running totals of a sweep.
struct SweepTally {
    total: u32,
    finished: u32,
    existing: u32,
    devices: Vec<(Ipv4Addr, DiscoveredNetworkDevice)>,
}

impl SweepTally {
    fn new(total: u32) -> Self {
        Self {
            total,
            finished: 0,
            existing: 0,
            devices: Vec::new(),
        }
    }

    /// Count a finished probe. The last one is reported by the final event.
    fn record(
        &mut self,
        joined: std::result::Result<ProbeOutcome, JoinError>,
        progress: &mpsc::UnboundedSender<ScanProgress>,
    ) {
        match joined {
            Ok(ProbeOutcome::Found(ip, device)) => self.devices.push((ip, device)),
            Ok(ProbeOutcome::Known) => self.existing += 1,
            Ok(ProbeOutcome::Closed) => {}
            Err(e) => warn!(error = %e, "Network probe task failed"),
        }
        self.finished += 1;
        if self.finished < self.total {
            let _ = progress.send(self.progress(false, false));
        }
    }

    fn progress(&self, done: bool, cancelled: bool) -> ScanProgress {
        let percent = if done {
            100
        } else {
            (u64::from(self.finished) * 100 / u64::from(self.total.max(1))) as u8
        };
        ScanProgress {
            current: self.finished,
            total: self.total,
            found: self.devices.len() as u32,
            percent,
            done,
            cancelled,
        }
    }
}

/// Parallel Modbus TCP sweep.
pub struct NetworkScanner {
    transport: Arc<dyn ModbusTransport>,
    settings: NetworkConfig,
}

impl NetworkScanner {
    pub fn new(transport: Arc<dyn ModbusTransport>, settings: NetworkConfig) -> Self {
        Self { transport, settings }
    }

    /// Start a sweep on the runtime and return its handle.
    ///
    /// The request is checked before anything is spawned.
    pub fn spawn(
        self: Arc<Self>,
        request: &NetworkScanRequest,
        known: HashSet<String>,
    ) -> Result<ScanHandle<NetworkScanReport>> {
        let targets = request.targets(&self.settings.ports)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = ScanCancel::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { self.sweep(targets, &known, &tx, &task_cancel).await });
        Ok(ScanHandle::new(rx, cancel, task))
    }

    /// Sweep the requested ranges.
    ///
    /// `known` holds endpoint keys (see [`Endpoint::key`]) of existing equipment.
    pub async fn scan(
        &self,
        request: &NetworkScanRequest,
        known: &HashSet<String>,
        progress: &mpsc::UnboundedSender<ScanProgress>,
        cancel: &ScanCancel,
    ) -> Result<NetworkScanReport> {
        let targets = request.targets(&self.settings.ports)?;
        self.sweep(targets, known, progress, cancel).await
    }

    async fn sweep(
        &self,
        targets: Vec<(Ipv4Addr, u16)>,
        known: &HashSet<String>,
        progress: &mpsc::UnboundedSender<ScanProgress>,
        cancel: &ScanCancel,
    ) -> Result<NetworkScanReport> {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.settings.timeout_ms);
        let limit = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let known = Arc::new(known.clone());
        let mut tally = SweepTally::new(targets.len() as u32);
        let mut tasks = JoinSet::new();
        let mut cancelled = false;

        info!(
            endpoints = targets.len(),
            concurrency = self.settings.concurrency,
            "Starting network scan"
        );

        for (ip, port) in targets {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            // Report finished probes while waiting for a free slot
            let permit = loop {
                tokio::select! {
                    biased;
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        tally.record(joined, progress);
                    }
                    permit = limit.clone().acquire_owned() => {
                        break permit.map_err(|e| {
                            ModbusError::protocol(format!("scan limiter closed: {}", e))
                        })?;
                    }
                }
            };
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let transport = self.transport.clone();
            let known = known.clone();
            let unit_id = self.settings.unit_id;
            tasks.spawn(async move {
                let outcome = probe_endpoint(transport.as_ref(), ip, port, unit_id, timeout, &known).await;
                drop(permit);
                outcome
            });
        }

        // Probes already started run to completion
        while let Some(joined) = tasks.join_next().await {
            tally.record(joined, progress);
        }
        let _ = progress.send(tally.progress(true, cancelled));

        let SweepTally {
            finished,
            existing,
            mut devices,
            ..
        } = tally;
        devices.sort_by_key(|(ip, device)| (*ip, device.port));
        let devices: Vec<_> = devices.into_iter().map(|(_, d)| d).collect();

        info!(
            found = devices.len(),
            existing,
            probed = finished,
            cancelled,
            "Network scan finished"
        );

        Ok(NetworkScanReport {
            devices,
            existing_devices_found: existing,
            hosts_probed: finished,
            cancelled,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

async fn probe_endpoint(
    transport: &dyn ModbusTransport,
    ip: Ipv4Addr,
    port: u16,
    unit_id: u8,
    timeout: Duration,
    known: &HashSet<String>,
) -> ProbeOutcome {
    let endpoint = Endpoint::tcp(ip.to_string(), port);
    if transport.check_reachable(&endpoint, timeout).await.is_err() {
        return ProbeOutcome::Closed;
    }
    if known.contains(&endpoint.key()) {
        debug!(%endpoint, "Endpoint already configured");
        return ProbeOutcome::Known;
    }

    let target = DeviceTarget::new(endpoint, unit_id, timeout);
    let (device_info, responsive) = match transport.read_device_identification(&target).await {
        Ok(info) => (info, true),
        Err(e) if e.device_answered() => (DeviceIdentification::new(), true),
        Err(e) => {
            debug!(%target, error = %e, "No identification, trying register read");
            let read = transport.read_holding_registers(&target, 0, 1).await;
            let responsive = match read {
                Ok(_) => true,
                Err(e) => e.device_answered(),
            };
            (DeviceIdentification::new(), responsive)
        }
    };
    transport.disconnect(&target.endpoint).await;

    let address = ip.to_string();
    debug!(%address, port, responsive, "Modbus endpoint found");
    ProbeOutcome::Found(
        ip,
        DiscoveredNetworkDevice {
            suggested_name: suggested_name(&address, &device_info),
            address,
            port,
            device_info,
            responsive,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{SimDevice, SimulatedBus};

    fn hosts(range: &str) -> Vec<String> {
        NetworkRange::parse(range)
            .unwrap()
            .hosts()
            .map(|ip| ip.to_string())
            .collect()
    }

    #[test]
    fn test_parse_single_and_range() {
        assert_eq!(hosts("10.0.0.7"), vec!["10.0.0.7"]);
        assert_eq!(hosts("10.0.0.254-10.0.1.1"), vec!["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]);
        assert!(NetworkRange::parse("10.0.0.9-10.0.0.1").is_err());
        assert!(NetworkRange::parse("10.0.0.0-10.2.0.0").is_err());
        assert!(NetworkRange::parse("not-an-ip").is_err());
    }

    #[test]
    fn test_parse_cidr() {
        let range = NetworkRange::parse("192.168.1.77/24").unwrap();
        assert_eq!(range.len(), 254);
        assert_eq!(range.to_string(), "192.168.1.1-192.168.1.254");

        assert_eq!(hosts("10.0.0.4/31"), vec!["10.0.0.4", "10.0.0.5"]);
        assert_eq!(hosts("10.0.0.4/32"), vec!["10.0.0.4"]);
        assert_eq!(NetworkRange::parse("10.1.0.0/16").unwrap().len(), 65534);
        assert!(NetworkRange::parse("10.0.0.0/8").is_err());
        assert!(NetworkRange::parse("10.0.0.0/33").is_err());
    }

    #[test]
    fn test_suggested_name() {
        let mut info = DeviceIdentification::new();
        assert_eq!(suggested_name("10.0.0.5", &info), "Modbus device 10.0.0.5");

        info.insert("vendor".into(), "Acme".into());
        info.insert("product_code".into(), "RM-8".into());
        assert_eq!(suggested_name("10.0.0.5", &info), "Acme RM-8");

        info.insert("product_name".into(), "Relay Module 8".into());
        assert_eq!(suggested_name("10.0.0.5", &info), "Relay Module 8");
    }

    fn request(ranges: &[&str], ports: &[u16]) -> NetworkScanRequest {
        NetworkScanRequest {
            ranges: ranges.iter().map(|r| r.to_string()).collect(),
            ports: ports.to_vec(),
        }
    }

    async fn sweep(
        scanner: &NetworkScanner,
        request: &NetworkScanRequest,
        known: &HashSet<String>,
    ) -> Result<(NetworkScanReport, Vec<ScanProgress>)> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = scanner.scan(request, known, &tx, &ScanCancel::new()).await?;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        Ok((report, events))
    }

    #[test]
    fn test_targets_are_distinct() {
        let targets = request(&["10.0.0.1-10.0.0.2", "10.0.0.2"], &[503, 502, 503])
            .targets(&[502])
            .unwrap();
        let expected: Vec<(Ipv4Addr, u16)> = vec![
            ("10.0.0.1".parse().unwrap(), 502),
            ("10.0.0.1".parse().unwrap(), 503),
            ("10.0.0.2".parse().unwrap(), 502),
            ("10.0.0.2".parse().unwrap(), 503),
        ];
        assert_eq!(targets, expected);

        assert_eq!(request(&["10.0.0.1"], &[]).targets(&[502, 1502]).unwrap().len(), 2);
        assert!(request(&["10.0.0.1"], &[]).targets(&[]).is_err());
    }

    #[tokio::test]
    async fn test_scan_identifies_and_sorts() {
        let bus = Arc::new(SimulatedBus::new());
        bus.add_device(
            &Endpoint::tcp("10.0.0.9", 502),
            1,
            SimDevice::default().with_identification(&[("vendor", "Acme"), ("product_code", "RM-8")]),
        );
        bus.add_device(&Endpoint::tcp("10.0.0.3", 502), 1, SimDevice::default().with_holding(0, &[1]));
        bus.add_device(&Endpoint::tcp("10.0.0.3", 5020), 1, SimDevice::default().with_holding(0, &[1]));
        // Listening, but nothing answers
        bus.add_endpoint(&Endpoint::tcp("10.0.0.4", 502));

        let scanner = NetworkScanner::new(bus.clone(), NetworkConfig::default());
        let (report, events) = sweep(&scanner, &request(&["10.0.0.0/28"], &[502, 5020]), &HashSet::new())
            .await
            .unwrap();

        let found: Vec<_> = report
            .devices
            .iter()
            .map(|d| (d.address.as_str(), d.port, d.responsive))
            .collect();
        assert_eq!(
            found,
            vec![
                ("10.0.0.3", 502, true),
                ("10.0.0.3", 5020, true),
                ("10.0.0.4", 502, false),
                ("10.0.0.9", 502, true),
            ]
        );
        assert_eq!(report.devices[3].suggested_name, "Acme RM-8");
        assert_eq!(report.devices[2].suggested_name, "Modbus device 10.0.0.4");
        assert!(report.devices[0].device_info.is_empty());
        assert_eq!(report.hosts_probed, 28);
        assert!(!report.cancelled);

        assert_eq!(events.len(), 28);
        assert_eq!(events.iter().filter(|e| e.done).count(), 1);
        let last = events.last().unwrap();
        assert!(last.done && last.percent == 100 && last.found == 4);
        assert!(events.windows(2).all(|w| w[0].current < w[1].current));

        // Identification connections are not kept open
        let mut closed = bus.disconnects();
        closed.sort();
        assert_eq!(closed, vec!["10.0.0.3:502", "10.0.0.3:5020", "10.0.0.4:502", "10.0.0.9:502"]);
    }

    #[tokio::test]
    async fn test_gateway_without_unit_is_not_responsive() {
        let bus = Arc::new(SimulatedBus::new());
        bus.add_gateway(&Endpoint::tcp("10.0.0.6", 502));
        bus.add_device(&Endpoint::tcp("10.0.0.7", 502), 1, SimDevice::relay_module(2));

        let scanner = NetworkScanner::new(bus.clone(), NetworkConfig::default());
        let (report, _) = sweep(&scanner, &request(&["10.0.0.6-10.0.0.7"], &[]), &HashSet::new())
            .await
            .unwrap();

        let found: Vec<_> = report
            .devices
            .iter()
            .map(|d| (d.address.as_str(), d.responsive))
            .collect();
        assert_eq!(found, vec![("10.0.0.6", false), ("10.0.0.7", true)]);
    }

    #[tokio::test]
    async fn test_cancel_stops_new_probes() {
        let cancel = ScanCancel::new();
        let hook_cancel = cancel.clone();
        let bus = Arc::new(SimulatedBus::new().with_request_hook(move |request| {
            if request.endpoint == "10.0.0.3:502" {
                hook_cancel.cancel();
            }
        }));
        for host in 1..=20 {
            bus.add_device(&Endpoint::tcp(format!("10.0.0.{}", host), 502), 1, SimDevice::relay_module(2));
        }

        let settings = NetworkConfig {
            concurrency: 1,
            ..NetworkConfig::default()
        };
        let scanner = NetworkScanner::new(bus.clone(), settings);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = scanner
            .scan(&request(&["10.0.0.1-10.0.0.20"], &[502]), &HashSet::new(), &tx, &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.hosts_probed, 3);
        assert_eq!(report.devices.len(), 3);
        let probed: HashSet<String> = bus.requests().into_iter().map(|r| r.endpoint).collect();
        let expected: HashSet<String> = ["10.0.0.1:502", "10.0.0.2:502", "10.0.0.3:502"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(probed, expected);

        drop(tx);
        let mut finals = Vec::new();
        while let Some(event) = rx.recv().await {
            if event.done {
                finals.push(event);
            }
        }
        assert_eq!(finals.len(), 1);
        assert!(finals[0].cancelled);
        assert_eq!(finals[0].percent, 100);
    }

    #[tokio::test]
    async fn test_spawned_sweep() {
        let bus = Arc::new(SimulatedBus::new());
        bus.add_device(&Endpoint::tcp("10.0.0.2", 502), 1, SimDevice::relay_module(2));

        let scanner = Arc::new(NetworkScanner::new(bus, NetworkConfig::default()));
        assert!(scanner.clone().spawn(&request(&["10.0.0.0/8"], &[]), HashSet::new()).is_err());

        let mut handle = scanner
            .spawn(&request(&["10.0.0.1-10.0.0.4"], &[502]), HashSet::new())
            .unwrap();
        let mut events = Vec::new();
        while let Some(event) = handle.progress.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 4);

        let report = handle.join().await.unwrap();
        assert_eq!(report.devices.len(), 1);
        assert_eq!(report.hosts_probed, 4);
    }

    #[tokio::test]
    async fn test_scan_skips_known_equipment() {
        let bus = Arc::new(SimulatedBus::new());
        bus.add_device(&Endpoint::tcp("10.0.0.2", 502), 1, SimDevice::relay_module(4));
        bus.add_device(&Endpoint::tcp("10.0.0.3", 502), 1, SimDevice::relay_module(4));

        let known: HashSet<String> = [Endpoint::tcp("10.0.0.2", 502).key()].into_iter().collect();
        let scanner = NetworkScanner::new(bus.clone(), NetworkConfig::default());
        let (report, _) = sweep(&scanner, &request(&["10.0.0.2-10.0.0.3"], &[]), &known)
            .await
            .unwrap();

        assert_eq!(report.existing_devices_found, 1);
        assert_eq!(report.devices.len(), 1);
        assert_eq!(report.devices[0].address, "10.0.0.3");
        // Relay module rejects identification, which still proves it is there
        assert!(report.devices[0].responsive);
    }

    #[tokio::test]
    async fn test_scan_rejects_bad_request() {
        let scanner = NetworkScanner::new(Arc::new(SimulatedBus::new()), NetworkConfig::default());
        let none = HashSet::new();
        assert!(sweep(&scanner, &request(&[], &[]), &none).await.is_err());
        assert!(sweep(&scanner, &request(&["10.0.0.0/8"], &[]), &none).await.is_err());
        assert!(sweep(&scanner, &request(&["10.0.0.1"], &[0]), &none).await.is_err());
    }
}
