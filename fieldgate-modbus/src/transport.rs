//! Modbus transport: coil/register I/O against a `(endpoint, unit id)` target.
//!
//! [`ModbusTransport`] is the capability the control engine and scanners are
//! written against. [`TokioModbusTransport`] implements it over `tokio-modbus`,
//! keeping one connection per endpoint until [`ModbusTransport::disconnect`]
//! drops it, and bounding every call by the target's timeout.

use async_trait::async_trait;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_modbus::client::{Client, Context, Reader, Writer};
use tokio_modbus::ExceptionCode;
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

use crate::config::SerialConfig;
use crate::error::{ModbusError, Result};
use crate::register::RegisterType;

/// Default Modbus TCP port.
pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// Function code of encapsulated interface transport (MEI) requests.
const FC_ENCAPSULATED_INTERFACE: u8 = 0x2B;

/// MEI type for Read Device Identification.
const MEI_READ_DEVICE_ID: u8 = 0x0E;

/// Read device id code: basic stream (vendor, product code, revision).
const READ_DEVICE_ID_BASIC: u8 = 0x01;

/// Read device id code: regular stream (basic plus vendor url, product and model name).
const READ_DEVICE_ID_REGULAR: u8 = 0x02;

/// Continuation requests followed for one identification stream.
const MAX_IDENTIFICATION_PAGES: usize = 8;

/// Where a device is reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Modbus TCP (or RTU-over-TCP gateway)
    Tcp { host: String, port: u16 },
    /// Modbus RTU over a local serial port
    Serial { path: String },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse an equipment address: `host:port`, bare `host` (port 502),
    /// `[v6]:port`, or a serial path (`/dev/ttyUSB0`, `COM3`).
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ModbusError::validation("address cannot be empty"));
        }

        if is_serial_path(address) {
            return Ok(Endpoint::Serial {
                path: address.to_string(),
            });
        }

        if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ModbusError::validation(format!("invalid address '{}'", address)))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(address, port)?,
                None if tail.is_empty() => DEFAULT_MODBUS_PORT,
                None => {
                    return Err(ModbusError::validation(format!(
                        "invalid address '{}'",
                        address
                    )));
                }
            };
            return Ok(Endpoint::tcp(host, port));
        }

        match address.split_once(':') {
            // More than one colon without brackets is a bare IPv6 address
            Some((_, rest)) if rest.contains(':') => Ok(Endpoint::tcp(address, DEFAULT_MODBUS_PORT)),
            Some((host, port)) if !host.is_empty() => {
                Ok(Endpoint::tcp(host, parse_port(address, port)?))
            }
            Some(_) => Err(ModbusError::validation(format!(
                "invalid address '{}'",
                address
            ))),
            None => Ok(Endpoint::tcp(address, DEFAULT_MODBUS_PORT)),
        }
    }

    /// Canonical `host:port` (or serial path) used for address comparison.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host.to_lowercase(), port),
            Endpoint::Serial { path } => f.write_str(path),
        }
    }
}

fn is_serial_path(address: &str) -> bool {
    if address.starts_with('/') {
        return true;
    }
    let upper = address.to_ascii_uppercase();
    upper
        .strip_prefix("COM")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

fn parse_port(address: &str, port: &str) -> Result<u16> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ModbusError::validation(format!("invalid port in address '{}'", address)))
}

/// A single device on an endpoint, with the time budget for each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub endpoint: Endpoint,
    pub unit_id: u8,
    pub timeout: Duration,
}

impl DeviceTarget {
    pub fn new(endpoint: Endpoint, unit_id: u8, timeout: Duration) -> Self {
        Self {
            endpoint,
            unit_id,
            timeout,
        }
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (unit {})", self.endpoint, self.unit_id)
    }
}

/// Device identification strings, keyed by object name (`vendor`, `product_code`, ...).
pub type DeviceIdentification = BTreeMap<String, String>;

/// One Read Device Identification response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentificationPage {
    pub objects: DeviceIdentification,
    /// Object id to ask for next when the device has more to send
    pub next_object_id: Option<u8>,
}

/// Modbus request capability. Every call is bounded by `target.timeout`.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    async fn read_coils(&self, target: &DeviceTarget, address: u16, quantity: u16)
    -> Result<Vec<bool>>;

    async fn read_discrete_inputs(
        &self,
        target: &DeviceTarget,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>>;

    async fn read_holding_registers(
        &self,
        target: &DeviceTarget,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>>;

    async fn read_input_registers(
        &self,
        target: &DeviceTarget,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>>;

    async fn write_single_coil(&self, target: &DeviceTarget, address: u16, value: bool)
    -> Result<()>;

    async fn write_multiple_coils(
        &self,
        target: &DeviceTarget,
        address: u16,
        values: &[bool],
    ) -> Result<()>;

    async fn write_single_register(
        &self,
        target: &DeviceTarget,
        address: u16,
        value: u16,
    ) -> Result<()>;

    /// Read Device Identification (regular objects, or basic ones on devices
    /// that only implement those).
    async fn read_device_identification(&self, target: &DeviceTarget)
    -> Result<DeviceIdentification>;

    /// Check that the endpoint accepts connections.
    async fn check_reachable(&self, endpoint: &Endpoint, timeout: Duration) -> Result<()>;

    /// Close any connection held open for the endpoint.
    async fn disconnect(&self, endpoint: &Endpoint);

    /// Read 16-bit registers of either table.
    async fn read_registers(
        &self,
        target: &DeviceTarget,
        register_type: RegisterType,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        match register_type {
            RegisterType::Holding => self.read_holding_registers(target, address, quantity).await,
            RegisterType::Input => self.read_input_registers(target, address, quantity).await,
            other => Err(ModbusError::validation(format!(
                "{} points are not 16-bit registers",
                other
            ))),
        }
    }
}

enum Op<'a> {
    ReadCoils(u16, u16),
    ReadDiscreteInputs(u16, u16),
    ReadHoldingRegisters(u16, u16),
    ReadInputRegisters(u16, u16),
    WriteSingleCoil(u16, bool),
    WriteMultipleCoils(u16, &'a [bool]),
    WriteSingleRegister(u16, u16),
    /// Read device id code and starting object id
    Identify(u8, u8),
}

enum Reply {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Done,
    Identity(IdentificationPage),
}

type Link = Arc<tokio::sync::Mutex<Option<Context>>>;

/// `tokio-modbus` backed transport with one reusable connection per endpoint.
pub struct TokioModbusTransport {
    serial: SerialConfig,
    links: Mutex<HashMap<Endpoint, Link>>,
}

impl TokioModbusTransport {
    pub fn new(serial: SerialConfig) -> Self {
        Self {
            serial,
            links: Mutex::new(HashMap::new()),
        }
    }

    fn links(&self) -> MutexGuard<'_, HashMap<Endpoint, Link>> {
        match self.links.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn link(&self, endpoint: &Endpoint) -> Link {
        self.links()
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    /// Number of endpoints with a link entry.
    pub fn open_links(&self) -> usize {
        self.links().len()
    }

    /// Read one identification stream, following continuation pages.
    async fn read_identification_stream(
        &self,
        target: &DeviceTarget,
        read_code: u8,
    ) -> Result<DeviceIdentification> {
        let mut objects = DeviceIdentification::new();
        let mut object_id = 0u8;

        for _ in 0..MAX_IDENTIFICATION_PAGES {
            let page = match self.execute(target, Op::Identify(read_code, object_id)).await? {
                Reply::Identity(page) => page,
                _ => return Err(unexpected_reply()),
            };
            objects.extend(page.objects);
            match page.next_object_id {
                Some(next) if next > object_id => object_id = next,
                _ => break,
            }
        }

        Ok(objects)
    }

    /// Connect to the endpoint.
    async fn connect(&self, endpoint: &Endpoint, slave: Slave, timeout: Duration) -> Result<Context> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let addr = tokio::time::timeout(timeout, tokio::net::lookup_host((host.as_str(), *port)))
                    .await
                    .map_err(|_| {
                        ModbusError::connection(format!("resolving {} timed out", endpoint))
                    })?
                    .map_err(|e| ModbusError::connection(format!("invalid address {}: {}", endpoint, e)))?
                    .next()
                    .ok_or_else(|| ModbusError::connection(format!("no address for {}", endpoint)))?;

                let ctx = tokio::time::timeout(timeout, tcp::connect_slave(addr, slave))
                    .await
                    .map_err(|_| {
                        ModbusError::connection(format!(
                            "connecting to {} timed out after {}ms",
                            endpoint,
                            timeout.as_millis()
                        ))
                    })?
                    .map_err(|e| ModbusError::connection(format!("{}: {}", endpoint, e)))?;

                Ok(ctx)
            }
            Endpoint::Serial { path } => {
                let parity = match self.serial.parity.to_lowercase().as_str() {
                    "even" => tokio_serial::Parity::Even,
                    "odd" => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };

                let stop_bits = match self.serial.stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };

                let data_bits = match self.serial.data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(path, self.serial.baud_rate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits)
                    .timeout(timeout);

                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    ModbusError::connection(format!("serial open {} failed: {}", path, e))
                })?;

                Ok(rtu::attach_slave(serial, slave))
            }
        }
    }

    async fn execute(&self, target: &DeviceTarget, op: Op<'_>) -> Result<Reply> {
        let link = self.link(&target.endpoint);
        let mut guard = link.lock().await;
        let slave = Slave(target.unit_id);

        if guard.is_none() {
            debug!(endpoint = %target.endpoint, "Opening Modbus connection");
            *guard = Some(self.connect(&target.endpoint, slave, target.timeout).await?);
        }
        let Some(ctx) = guard.as_mut() else {
            return Err(ModbusError::connection(format!("{} not connected", target.endpoint)));
        };
        ctx.set_slave(slave);

        let result = match tokio::time::timeout(target.timeout, dispatch(ctx, op)).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::NoResponse(format!(
                "request to {} timed out after {}ms",
                target,
                target.timeout.as_millis()
            ))),
        };

        // An exception reply leaves the stream in sync; anything else may not.
        if let Err(e) = &result {
            if !matches!(e, ModbusError::Exception(_)) {
                warn!(target = %target, error = %e, "Dropping Modbus connection");
                *guard = None;
            }
        }

        result
    }
}

impl Default for TokioModbusTransport {
    fn default() -> Self {
        Self::new(SerialConfig::default())
    }
}

fn client_error(err: tokio_modbus::Error) -> ModbusError {
    match err {
        tokio_modbus::Error::Transport(e) => ModbusError::connection(e.to_string()),
        other => ModbusError::protocol(other.to_string()),
    }
}

fn exception_error(code: ExceptionCode) -> ModbusError {
    ModbusError::Exception(code)
}

async fn dispatch(ctx: &mut Context, op: Op<'_>) -> Result<Reply> {
    match op {
        Op::ReadCoils(address, quantity) => ctx
            .read_coils(address, quantity)
            .await
            .map_err(client_error)?
            .map_err(exception_error)
            .map(Reply::Bits),
        Op::ReadDiscreteInputs(address, quantity) => ctx
            .read_discrete_inputs(address, quantity)
            .await
            .map_err(client_error)?
            .map_err(exception_error)
            .map(Reply::Bits),
        Op::ReadHoldingRegisters(address, quantity) => ctx
            .read_holding_registers(address, quantity)
            .await
            .map_err(client_error)?
            .map_err(exception_error)
            .map(Reply::Words),
        Op::ReadInputRegisters(address, quantity) => ctx
            .read_input_registers(address, quantity)
            .await
            .map_err(client_error)?
            .map_err(exception_error)
            .map(Reply::Words),
        Op::WriteSingleCoil(address, value) => ctx
            .write_single_coil(address, value)
            .await
            .map_err(client_error)?
            .map_err(exception_error)
            .map(|_| Reply::Done),
        Op::WriteMultipleCoils(address, values) => ctx
            .write_multiple_coils(address, values)
            .await
            .map_err(client_error)?
            .map_err(exception_error)
            .map(|_| Reply::Done),
        Op::WriteSingleRegister(address, value) => ctx
            .write_single_register(address, value)
            .await
            .map_err(client_error)?
            .map_err(exception_error)
            .map(|_| Reply::Done),
        Op::Identify(read_code, object_id) => {
            let payload = [MEI_READ_DEVICE_ID, read_code, object_id];
            let response = ctx
                .call(tokio_modbus::Request::Custom(
                    FC_ENCAPSULATED_INTERFACE,
                    Cow::Borrowed(&payload[..]),
                ))
                .await
                .map_err(client_error)?
                .map_err(exception_error)?;

            match response {
                tokio_modbus::Response::Custom(code, data) if code == FC_ENCAPSULATED_INTERFACE => {
                    parse_device_identification(&data).map(Reply::Identity)
                }
                other => Err(ModbusError::protocol(format!(
                    "unexpected identification response: {:?}",
                    other
                ))),
            }
        }
    }
}

fn unexpected_reply() -> ModbusError {
    ModbusError::protocol("reply does not match request")
}

fn check_len<T>(mut values: Vec<T>, quantity: u16) -> Result<Vec<T>> {
    if values.len() < quantity as usize {
        return Err(ModbusError::protocol(format!(
            "expected {} values, got {}",
            quantity,
            values.len()
        )));
    }
    values.truncate(quantity as usize);
    Ok(values)
}

#[async_trait]
impl ModbusTransport for TokioModbusTransport {
    async fn read_coils(&self, target: &DeviceTarget, address: u16, quantity: u16) -> Result<Vec<bool>> {
        match self.execute(target, Op::ReadCoils(address, quantity)).await? {
            Reply::Bits(bits) => check_len(bits, quantity),
            _ => Err(unexpected_reply()),
        }
    }

    async fn read_discrete_inputs(
        &self,
        target: &DeviceTarget,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>> {
        match self
            .execute(target, Op::ReadDiscreteInputs(address, quantity))
            .await?
        {
            Reply::Bits(bits) => check_len(bits, quantity),
            _ => Err(unexpected_reply()),
        }
    }

    async fn read_holding_registers(
        &self,
        target: &DeviceTarget,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        match self
            .execute(target, Op::ReadHoldingRegisters(address, quantity))
            .await?
        {
            Reply::Words(words) => check_len(words, quantity),
            _ => Err(unexpected_reply()),
        }
    }

    async fn read_input_registers(
        &self,
        target: &DeviceTarget,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        match self
            .execute(target, Op::ReadInputRegisters(address, quantity))
            .await?
        {
            Reply::Words(words) => check_len(words, quantity),
            _ => Err(unexpected_reply()),
        }
    }

    async fn write_single_coil(&self, target: &DeviceTarget, address: u16, value: bool) -> Result<()> {
        match self.execute(target, Op::WriteSingleCoil(address, value)).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected_reply()),
        }
    }

    async fn write_multiple_coils(
        &self,
        target: &DeviceTarget,
        address: u16,
        values: &[bool],
    ) -> Result<()> {
        match self
            .execute(target, Op::WriteMultipleCoils(address, values))
            .await?
        {
            Reply::Done => Ok(()),
            _ => Err(unexpected_reply()),
        }
    }

    async fn write_single_register(
        &self,
        target: &DeviceTarget,
        address: u16,
        value: u16,
    ) -> Result<()> {
        match self
            .execute(target, Op::WriteSingleRegister(address, value))
            .await?
        {
            Reply::Done => Ok(()),
            _ => Err(unexpected_reply()),
        }
    }

    async fn read_device_identification(&self, target: &DeviceTarget) -> Result<DeviceIdentification> {
        match self
            .read_identification_stream(target, READ_DEVICE_ID_REGULAR)
            .await
        {
            Err(e) if e.device_answered() => {
                debug!(target = %target, error = %e, "Regular identification rejected, reading basic");
                self.read_identification_stream(target, READ_DEVICE_ID_BASIC)
                    .await
            }
            other => other,
        }
    }

    async fn check_reachable(&self, endpoint: &Endpoint, timeout: Duration) -> Result<()> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| {
                        ModbusError::connection(format!(
                            "connecting to {} timed out after {}ms",
                            endpoint,
                            timeout.as_millis()
                        ))
                    })?
                    .map_err(|e| ModbusError::connection(format!("{}: {}", endpoint, e)))?;
                Ok(())
            }
            Endpoint::Serial { .. } => {
                let link = self.link(endpoint);
                let mut guard = link.lock().await;
                if guard.is_none() {
                    *guard = Some(self.connect(endpoint, Slave(1), timeout).await?);
                }
                Ok(())
            }
        }
    }

    async fn disconnect(&self, endpoint: &Endpoint) {
        let link = self.links().remove(endpoint);
        let Some(link) = link else {
            return;
        };
        let mut guard = link.lock().await;
        if let Some(mut ctx) = guard.take() {
            debug!(%endpoint, "Closing Modbus connection");
            if let Err(e) = ctx.disconnect().await {
                debug!(%endpoint, error = %e, "Error while closing Modbus connection");
            }
        }
    }
}

/// Name of a basic/regular device identification object.
fn identification_object_name(id: u8) -> String {
    match id {
        0x00 => "vendor".to_string(),
        0x01 => "product_code".to_string(),
        0x02 => "revision".to_string(),
        0x03 => "vendor_url".to_string(),
        0x04 => "product_name".to_string(),
        0x05 => "model_name".to_string(),
        0x06 => "user_application_name".to_string(),
        other => format!("object_{:02x}", other),
    }
}

/// Parse a Read Device Identification response body (after the function code).
///
/// Layout: MEI type, read code, conformity level, more-follows, next object id,
/// object count, then `(id, len, bytes)` per object.
pub fn parse_device_identification(payload: &[u8]) -> Result<IdentificationPage> {
    if payload.len() < 6 {
        return Err(ModbusError::protocol("device identification payload too short"));
    }
    if payload[0] != MEI_READ_DEVICE_ID {
        return Err(ModbusError::protocol(format!(
            "device identification MEI type mismatch: 0x{:02x}",
            payload[0]
        )));
    }

    let object_count = payload[5] as usize;
    let mut cursor = 6usize;
    let mut objects = DeviceIdentification::new();

    for _ in 0..object_count {
        if payload.len().saturating_sub(cursor) < 2 {
            return Err(ModbusError::protocol("device identification object header truncated"));
        }
        let id = payload[cursor];
        let len = payload[cursor + 1] as usize;
        cursor += 2;

        let end = cursor + len;
        if end > payload.len() {
            return Err(ModbusError::protocol("device identification object data truncated"));
        }

        let value = String::from_utf8_lossy(&payload[cursor..end]).trim().to_string();
        if !value.is_empty() {
            objects.insert(identification_object_name(id), value);
        }
        cursor = end;
    }

    let next_object_id = (payload[3] == 0xFF).then_some(payload[4]);
    Ok(IdentificationPage {
        objects,
        next_object_id,
    })
}
