//! In-memory Modbus bus for tests and `--simulate` runs.
//!
//! [`SimulatedBus`] implements [`ModbusTransport`] against simulated devices
//! keyed by `(endpoint, unit id)`. Reading an address a device does not expose
//! answers with an `IllegalDataAddress` exception, like real hardware. Devices
//! can be muted (they apply writes but never reply), endpoints can be taken
//! offline or put behind a TCP gateway, and every request is logged.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_modbus::ExceptionCode;

use crate::error::{ModbusError, Result};
use crate::transport::{DeviceIdentification, DeviceTarget, Endpoint, ModbusTransport};

/// Kind of request seen by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteMultipleCoils,
    WriteSingleRegister,
    Identify,
}

impl RequestKind {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RequestKind::WriteSingleCoil
                | RequestKind::WriteMultipleCoils
                | RequestKind::WriteSingleRegister
        )
    }
}

/// One logged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub endpoint: String,
    pub unit_id: u8,
    pub kind: RequestKind,
    pub address: u16,
    pub quantity: u16,
}

/// Start/end of a request as observed by the bus.
#[derive(Debug, Clone, Copy)]
pub struct RequestSpan {
    pub unit_id: u8,
    pub started: Instant,
    pub finished: Instant,
}

/// A simulated field device.
#[derive(Debug, Clone, Default)]
pub struct SimDevice {
    pub coils: BTreeMap<u16, bool>,
    pub discrete_inputs: BTreeMap<u16, bool>,
    pub holding: BTreeMap<u16, u16>,
    pub input: BTreeMap<u16, u16>,
    pub identification: Option<DeviceIdentification>,
    /// Applies writes but never replies.
    pub mute: bool,
}

impl SimDevice {
    /// A relay module with `channels` coils at `0..channels`, all off.
    pub fn relay_module(channels: u16) -> Self {
        Self {
            coils: (0..channels).map(|a| (a, false)).collect(),
            ..Self::default()
        }
    }

    pub fn with_holding(mut self, address: u16, values: &[u16]) -> Self {
        for (offset, value) in values.iter().enumerate() {
            self.holding.insert(address + offset as u16, *value);
        }
        self
    }

    pub fn with_input(mut self, address: u16, values: &[u16]) -> Self {
        for (offset, value) in values.iter().enumerate() {
            self.input.insert(address + offset as u16, *value);
        }
        self
    }

    pub fn with_identification(mut self, pairs: &[(&str, &str)]) -> Self {
        self.identification = Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    pub fn muted(mut self) -> Self {
        self.mute = true;
        self
    }
}

type RequestHook = Arc<dyn Fn(&LoggedRequest) + Send + Sync>;

#[derive(Default)]
struct BusState {
    devices: HashMap<(String, u8), SimDevice>,
    reachable: HashSet<String>,
    offline: HashSet<String>,
    gateways: HashSet<String>,
    log: Vec<LoggedRequest>,
    disconnects: Vec<String>,
    spans: Vec<RequestSpan>,
    in_flight: HashMap<(String, u8), usize>,
    max_in_flight: HashMap<(String, u8), usize>,
}

/// Simulated Modbus bus.
#[derive(Default)]
pub struct SimulatedBus {
    state: Mutex<BusState>,
    latency: Option<Duration>,
    hook: Option<RequestHook>,
}

fn illegal_address() -> ModbusError {
    ModbusError::Exception(ExceptionCode::IllegalDataAddress)
}

fn read_range<T: Copy>(map: &BTreeMap<u16, T>, address: u16, quantity: u16) -> Result<Vec<T>> {
    (0..quantity)
        .map(|offset| {
            let addr = address
                .checked_add(offset)
                .ok_or_else(|| illegal_address())?;
            map.get(&addr).copied().ok_or_else(|| illegal_address())
        })
        .collect()
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every request by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Call `hook` for every request, before it is answered.
    pub fn with_request_hook(mut self, hook: impl Fn(&LoggedRequest) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Attach a device. Its endpoint becomes reachable.
    pub fn add_device(&self, endpoint: &Endpoint, unit_id: u8, device: SimDevice) {
        let mut state = self.state();
        state.reachable.insert(endpoint.key());
        state.devices.insert((endpoint.key(), unit_id), device);
    }

    /// Make an endpoint accept connections without any device answering.
    pub fn add_endpoint(&self, endpoint: &Endpoint) {
        self.state().reachable.insert(endpoint.key());
    }

    /// Put an endpoint behind a TCP-to-RTU gateway: units that stay silent
    /// are reported with a `GatewayTargetDevice` exception instead of a timeout.
    pub fn add_gateway(&self, endpoint: &Endpoint) {
        let mut state = self.state();
        state.reachable.insert(endpoint.key());
        state.gateways.insert(endpoint.key());
    }

    /// Take an endpoint offline (or back online).
    pub fn set_offline(&self, endpoint: &Endpoint, offline: bool) {
        let mut state = self.state();
        if offline {
            state.offline.insert(endpoint.key());
        } else {
            state.offline.remove(&endpoint.key());
        }
    }

    /// Current coil value of a device.
    pub fn coil(&self, endpoint: &Endpoint, unit_id: u8, address: u16) -> Option<bool> {
        self.state()
            .devices
            .get(&(endpoint.key(), unit_id))
            .and_then(|d| d.coils.get(&address).copied())
    }

    /// Set a coil directly, as if changed at the device.
    pub fn set_coil(&self, endpoint: &Endpoint, unit_id: u8, address: u16, value: bool) {
        if let Some(device) = self.state().devices.get_mut(&(endpoint.key(), unit_id)) {
            device.coils.insert(address, value);
        }
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.state().log.clone()
    }

    pub fn request_count(&self, kind: RequestKind) -> usize {
        self.state().log.iter().filter(|r| r.kind == kind).count()
    }

    /// Endpoint keys passed to `disconnect`, in call order.
    pub fn disconnects(&self) -> Vec<String> {
        self.state().disconnects.clone()
    }

    pub fn spans(&self) -> Vec<RequestSpan> {
        self.state().spans.clone()
    }

    /// Highest number of simultaneous requests observed for one device.
    pub fn max_in_flight(&self, endpoint: &Endpoint, unit_id: u8) -> usize {
        self.state()
            .max_in_flight
            .get(&(endpoint.key(), unit_id))
            .copied()
            .unwrap_or(0)
    }

    async fn handle<T>(
        &self,
        target: &DeviceTarget,
        kind: RequestKind,
        address: u16,
        quantity: u16,
        apply: impl FnOnce(&mut SimDevice) -> Result<T>,
    ) -> Result<T> {
        let key = (target.endpoint.key(), target.unit_id);
        let request = LoggedRequest {
            endpoint: key.0.clone(),
            unit_id: target.unit_id,
            kind,
            address,
            quantity,
        };

        {
            let mut state = self.state();
            state.log.push(request.clone());
            let in_flight = state.in_flight.entry(key.clone()).or_insert(0);
            *in_flight += 1;
            let current = *in_flight;
            let max = state.max_in_flight.entry(key.clone()).or_insert(0);
            *max = (*max).max(current);
        }

        if let Some(hook) = &self.hook {
            hook(&request);
        }

        let started = Instant::now();
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(in_flight) = state.in_flight.get_mut(&key) {
            *in_flight -= 1;
        }
        state.spans.push(RequestSpan {
            unit_id: target.unit_id,
            started,
            finished: Instant::now(),
        });

        if state.offline.contains(&key.0) || !state.reachable.contains(&key.0) {
            return Err(ModbusError::connection(format!(
                "{}: connection refused",
                target.endpoint
            )));
        }

        let behind_gateway = state.gateways.contains(&key.0);
        let no_response = || {
            if behind_gateway {
                return ModbusError::Exception(ExceptionCode::GatewayTargetDevice);
            }
            ModbusError::NoResponse(format!(
                "request to {} timed out after {}ms",
                target,
                target.timeout.as_millis()
            ))
        };

        let Some(device) = state.devices.get_mut(&key) else {
            return Err(no_response());
        };

        let mute = device.mute;
        let result = apply(device);
        if mute {
            return Err(no_response());
        }
        result
    }
}

#[async_trait]
impl ModbusTransport for SimulatedBus {
    async fn read_coils(&self, target: &DeviceTarget, address: u16, quantity: u16) -> Result<Vec<bool>> {
        self.handle(target, RequestKind::ReadCoils, address, quantity, |d| {
            read_range(&d.coils, address, quantity)
        })
        .await
    }

    async fn read_discrete_inputs(
        &self,
        target: &DeviceTarget,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>> {
        self.handle(target, RequestKind::ReadDiscreteInputs, address, quantity, |d| {
            read_range(&d.discrete_inputs, address, quantity)
        })
        .await
    }

    async fn read_holding_registers(
        &self,
        target: &DeviceTarget,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        self.handle(target, RequestKind::ReadHoldingRegisters, address, quantity, |d| {
            read_range(&d.holding, address, quantity)
        })
        .await
    }

    async fn read_input_registers(
        &self,
        target: &DeviceTarget,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        self.handle(target, RequestKind::ReadInputRegisters, address, quantity, |d| {
            read_range(&d.input, address, quantity)
        })
        .await
    }

    async fn write_single_coil(&self, target: &DeviceTarget, address: u16, value: bool) -> Result<()> {
        self.handle(target, RequestKind::WriteSingleCoil, address, 1, |d| {
            match d.coils.get_mut(&address) {
                Some(coil) => {
                    *coil = value;
                    Ok(())
                }
                None => Err(illegal_address()),
            }
        })
        .await
    }

    async fn write_multiple_coils(
        &self,
        target: &DeviceTarget,
        address: u16,
        values: &[bool],
    ) -> Result<()> {
        let quantity = values.len() as u16;
        self.handle(target, RequestKind::WriteMultipleCoils, address, quantity, |d| {
            // All-or-nothing, like a device rejecting the whole frame
            read_range(&d.coils, address, quantity)?;
            for (offset, value) in values.iter().enumerate() {
                d.coils.insert(address + offset as u16, *value);
            }
            Ok(())
        })
        .await
    }

    async fn write_single_register(
        &self,
        target: &DeviceTarget,
        address: u16,
        value: u16,
    ) -> Result<()> {
        self.handle(target, RequestKind::WriteSingleRegister, address, 1, |d| {
            match d.holding.get_mut(&address) {
                Some(register) => {
                    *register = value;
                    Ok(())
                }
                None => Err(illegal_address()),
            }
        })
        .await
    }

    async fn read_device_identification(&self, target: &DeviceTarget) -> Result<DeviceIdentification> {
        self.handle(target, RequestKind::Identify, 0, 0, |d| {
            d.identification
                .clone()
                .ok_or_else(|| ModbusError::Exception(ExceptionCode::IllegalFunction))
        })
        .await
    }

    async fn check_reachable(&self, endpoint: &Endpoint, _timeout: Duration) -> Result<()> {
        let state = self.state();
        if state.reachable.contains(&endpoint.key()) && !state.offline.contains(&endpoint.key()) {
            Ok(())
        } else {
            Err(ModbusError::connection(format!("{}: connection refused", endpoint)))
        }
    }

    async fn disconnect(&self, endpoint: &Endpoint) {
        self.state().disconnects.push(endpoint.key());
    }
}
