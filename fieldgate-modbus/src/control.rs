//! Coil control sessions.
//!
//! A [`CoilSession`] owns the live coil state of one device and moves through
//! `Idle -> Reading -> Ready <-> Writing -> Ready`, dropping to `Error` on a
//! failed round-trip (a later read retries). Subscribers receive every
//! transition as an immutable [`CoilSnapshot`].
//!
//! How a device is talked to is decided once, when the session is built:
//! [`NormalTransport`] reads coils from the device and confirms writes by
//! reading them back; [`WriteOnlyTransport`] serves reads from the
//! [`CommandCache`] and trusts every command it sends.

use async_trait::async_trait;
use fieldgate_common::{DeviceStatus, current_timestamp_millis};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, watch};
use tracing::{debug, info, warn};

use crate::config::BusyPolicy;
use crate::equipment::Equipment;
use crate::error::{ModbusError, Result};
use crate::register::RegisterMap;
use crate::transport::{DeviceTarget, ModbusTransport};

/// One controllable coil.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoilChannel {
    pub address: u16,
    pub name: String,
}

/// The controllable coils of a device and the contiguous span covering them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoilChannels {
    channels: Vec<CoilChannel>,
}

impl CoilChannels {
    /// Coils with read/write access, in register map order.
    pub fn from_map(map: &RegisterMap) -> Self {
        Self {
            channels: map
                .controllable()
                .map(|m| CoilChannel {
                    address: m.register,
                    name: m.name.clone(),
                })
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoilChannel> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn position(&self, address: u16) -> Option<usize> {
        self.channels.iter().position(|c| c.address == address)
    }

    /// `(min_address, quantity)` of the contiguous range covering every channel.
    pub fn span(&self) -> Option<(u16, u16)> {
        let min = self.channels.iter().map(|c| c.address).min()?;
        let max = self.channels.iter().map(|c| c.address).max()?;
        Some((min, max - min + 1))
    }

    /// Pick each channel's bit out of a span read starting at the span minimum.
    pub fn states_from_span(&self, bits: &[bool]) -> Result<Vec<bool>> {
        let Some((min, _)) = self.span() else {
            return Ok(Vec::new());
        };
        self.channels
            .iter()
            .map(|c| {
                bits.get((c.address - min) as usize).copied().ok_or_else(|| {
                    ModbusError::protocol(format!(
                        "coil read returned {} bits, channel {} needs offset {}",
                        bits.len(),
                        c.address,
                        c.address - min
                    ))
                })
            })
            .collect()
    }
}

/// State of one controllable coil.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoilState {
    pub address: u16,
    pub name: String,
    pub state: bool,
}

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Reading,
    Ready,
    Writing,
    Error,
}

/// How coil state is obtained for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// The device answers; state is read from it.
    Normal,
    /// The device cannot answer; state is the last command sent.
    WriteOnly,
}

/// What the current states are worth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Nothing read or commanded yet.
    Pending,
    /// States were read from the device.
    Confirmed,
    /// States are what was commanded; the device did not confirm them.
    Unconfirmed,
    /// The last read failed; states are the last known values.
    Unverified,
    /// The last command was not delivered.
    Failed,
}

impl CommandOutcome {
    pub fn description(&self) -> &'static str {
        match self {
            CommandOutcome::Pending => "state not read yet",
            CommandOutcome::Confirmed => "state confirmed by device",
            CommandOutcome::Unconfirmed => "command sent, state unconfirmed",
            CommandOutcome::Unverified => "could not verify current state",
            CommandOutcome::Failed => "command failed",
        }
    }
}

/// Immutable view of a control session.
#[derive(Debug, Clone, Serialize)]
pub struct CoilSnapshot {
    pub equipment_id: String,
    pub mode: ControlMode,
    pub phase: SessionPhase,
    pub states: Vec<CoilState>,
    /// Whether the last round-trip reached the device.
    pub connected: bool,
    /// Epoch millis of the last successful read or write.
    pub last_update_ms: Option<i64>,
    /// Whether `states` were confirmed by the device.
    pub confirmed: bool,
    pub outcome: CommandOutcome,
    pub last_error: Option<String>,
}

impl CoilSnapshot {
    fn initial(equipment_id: &str, mode: ControlMode, channels: &CoilChannels) -> Self {
        Self {
            equipment_id: equipment_id.to_string(),
            mode,
            phase: SessionPhase::Idle,
            states: channels
                .iter()
                .map(|c| CoilState {
                    address: c.address,
                    name: c.name.clone(),
                    state: false,
                })
                .collect(),
            connected: false,
            last_update_ms: None,
            confirmed: false,
            outcome: CommandOutcome::Pending,
            last_error: None,
        }
    }

    /// Status to persist for the equipment record.
    pub fn device_status(&self) -> DeviceStatus {
        match (self.connected, self.outcome) {
            (true, CommandOutcome::Confirmed) => DeviceStatus::Online,
            (true, _) => DeviceStatus::Degraded,
            (false, CommandOutcome::Pending) => DeviceStatus::Unknown,
            (false, _) if self.mode == ControlMode::WriteOnly && self.last_error.is_none() => {
                DeviceStatus::Degraded
            }
            (false, _) => DeviceStatus::Offline,
        }
    }

    pub fn state_of(&self, address: u16) -> Option<bool> {
        self.states
            .iter()
            .find(|s| s.address == address)
            .map(|s| s.state)
    }

    fn set_all(&mut self, values: &[bool]) {
        for (state, value) in self.states.iter_mut().zip(values) {
            state.state = *value;
        }
    }

    fn touch(&mut self) {
        let now = current_timestamp_millis();
        self.last_update_ms = Some(self.last_update_ms.map_or(now, |prev| prev.max(now)));
    }
}

/// How a write was confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteConfirmation {
    /// Channel states read back from the device after the write, in channel order.
    ReadBack(Vec<bool>),
    /// The command was sent; the device did not confirm it.
    Unconfirmed,
}

/// Device-facing half of a control session.
#[async_trait]
pub trait CoilTransport: Send + Sync {
    fn mode(&self) -> ControlMode;

    /// Current state of every channel, in channel order.
    async fn read_states(&self, channels: &CoilChannels) -> Result<Vec<bool>>;

    async fn write_one(
        &self,
        channels: &CoilChannels,
        address: u16,
        value: bool,
    ) -> Result<WriteConfirmation>;

    async fn write_all(&self, channels: &CoilChannels, value: bool) -> Result<WriteConfirmation>;
}

/// Reads coil state from the device and confirms writes by reading back.
pub struct NormalTransport {
    link: Arc<dyn ModbusTransport>,
    target: DeviceTarget,
    verify_writes: bool,
}

impl NormalTransport {
    pub fn new(link: Arc<dyn ModbusTransport>, target: DeviceTarget, verify_writes: bool) -> Self {
        Self {
            link,
            target,
            verify_writes,
        }
    }

    async fn confirm(&self, channels: &CoilChannels) -> WriteConfirmation {
        if !self.verify_writes {
            return WriteConfirmation::Unconfirmed;
        }
        match self.read_states(channels).await {
            Ok(states) => WriteConfirmation::ReadBack(states),
            Err(e) => {
                warn!(target = %self.target, error = %e, "Coil read-back after write failed");
                WriteConfirmation::Unconfirmed
            }
        }
    }
}

#[async_trait]
impl CoilTransport for NormalTransport {
    fn mode(&self) -> ControlMode {
        ControlMode::Normal
    }

    async fn read_states(&self, channels: &CoilChannels) -> Result<Vec<bool>> {
        let Some((start, quantity)) = channels.span() else {
            return Ok(Vec::new());
        };
        let bits = self.link.read_coils(&self.target, start, quantity).await?;
        channels.states_from_span(&bits)
    }

    async fn write_one(
        &self,
        channels: &CoilChannels,
        address: u16,
        value: bool,
    ) -> Result<WriteConfirmation> {
        self.link
            .write_single_coil(&self.target, address, value)
            .await?;
        Ok(self.confirm(channels).await)
    }

    async fn write_all(&self, channels: &CoilChannels, value: bool) -> Result<WriteConfirmation> {
        let Some((start, quantity)) = channels.span() else {
            return Ok(WriteConfirmation::ReadBack(Vec::new()));
        };
        let values = vec![value; quantity as usize];
        self.link
            .write_multiple_coils(&self.target, start, &values)
            .await?;
        Ok(self.confirm(channels).await)
    }
}

/// Last commanded coil states of write-only devices, keyed by equipment id.
///
/// Each update replaces the device's whole state map under the write lock, so
/// a concurrent reader sees either the previous or the new vector.
#[derive(Debug, Clone, Default)]
pub struct CommandCache {
    inner: Arc<RwLock<HashMap<String, Arc<BTreeMap<u16, bool>>>>>,
}

impl CommandCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commanded state of each channel; channels never commanded read `false`.
    pub fn states(&self, equipment_id: &str, channels: &CoilChannels) -> Vec<bool> {
        let cached = match self.inner.read() {
            Ok(guard) => guard.get(equipment_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(equipment_id).cloned(),
        };
        channels
            .iter()
            .map(|c| {
                cached
                    .as_ref()
                    .and_then(|m| m.get(&c.address).copied())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Record commanded values.
    pub fn record(&self, equipment_id: &str, updates: impl IntoIterator<Item = (u16, bool)>) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = guard
            .get(equipment_id)
            .map(|m| m.as_ref().clone())
            .unwrap_or_default();
        next.extend(updates);
        guard.insert(equipment_id.to_string(), Arc::new(next));
    }

    pub fn contains(&self, equipment_id: &str) -> bool {
        match self.inner.read() {
            Ok(guard) => guard.contains_key(equipment_id),
            Err(poisoned) => poisoned.into_inner().contains_key(equipment_id),
        }
    }

    pub fn clear(&self, equipment_id: &str) {
        match self.inner.write() {
            Ok(mut guard) => guard.remove(equipment_id),
            Err(poisoned) => poisoned.into_inner().remove(equipment_id),
        };
    }
}

/// Sends commands blind and remembers them as the device state.
pub struct WriteOnlyTransport {
    link: Arc<dyn ModbusTransport>,
    target: DeviceTarget,
    equipment_id: String,
    cache: CommandCache,
}

impl WriteOnlyTransport {
    pub fn new(
        link: Arc<dyn ModbusTransport>,
        target: DeviceTarget,
        equipment_id: impl Into<String>,
        cache: CommandCache,
    ) -> Self {
        Self {
            link,
            target,
            equipment_id: equipment_id.into(),
            cache,
        }
    }

    /// A request that went out but got no reply was still delivered to the line.
    fn sent(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.sent_without_reply() => {
                debug!(target = %self.target, error = %e, "Write-only command sent without reply");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CoilTransport for WriteOnlyTransport {
    fn mode(&self) -> ControlMode {
        ControlMode::WriteOnly
    }

    async fn read_states(&self, channels: &CoilChannels) -> Result<Vec<bool>> {
        Ok(self.cache.states(&self.equipment_id, channels))
    }

    async fn write_one(
        &self,
        _channels: &CoilChannels,
        address: u16,
        value: bool,
    ) -> Result<WriteConfirmation> {
        let result = self.link.write_single_coil(&self.target, address, value).await;
        self.sent(result)?;
        self.cache.record(&self.equipment_id, [(address, value)]);
        Ok(WriteConfirmation::Unconfirmed)
    }

    async fn write_all(&self, channels: &CoilChannels, value: bool) -> Result<WriteConfirmation> {
        let Some((start, quantity)) = channels.span() else {
            return Ok(WriteConfirmation::Unconfirmed);
        };
        let values = vec![value; quantity as usize];
        let result = self
            .link
            .write_multiple_coils(&self.target, start, &values)
            .await;
        self.sent(result)?;
        self.cache
            .record(&self.equipment_id, channels.iter().map(|c| (c.address, value)));
        Ok(WriteConfirmation::Unconfirmed)
    }
}

/// One-operation-at-a-time gate per equipment id.
#[derive(Debug, Clone, Default)]
pub struct DeviceLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    policy: BusyPolicy,
}

impl DeviceLocks {
    pub fn new(policy: BusyPolicy) -> Self {
        Self {
            locks: Arc::default(),
            policy,
        }
    }

    fn lock_for(&self, equipment_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(equipment_id.to_string())
            .or_default()
            .clone()
    }

    /// Wait for (or, with [`BusyPolicy::Reject`], demand) exclusive access.
    pub async fn acquire(&self, equipment_id: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = self.lock_for(equipment_id);
        match self.policy {
            BusyPolicy::Queue => Ok(lock.lock_owned().await),
            BusyPolicy::Reject => lock
                .try_lock_owned()
                .map_err(|_| ModbusError::Busy(equipment_id.to_string())),
        }
    }
}

/// Per-session settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub timeout: Duration,
    pub verify_writes: bool,
}

/// Live coil control for one device.
pub struct CoilSession {
    equipment_id: String,
    channels: CoilChannels,
    transport: Box<dyn CoilTransport>,
    locks: DeviceLocks,
    state: watch::Sender<CoilSnapshot>,
}

impl CoilSession {
    pub fn new(
        equipment_id: impl Into<String>,
        channels: CoilChannels,
        transport: Box<dyn CoilTransport>,
        locks: DeviceLocks,
    ) -> Self {
        let equipment_id = equipment_id.into();
        let (state, _) = watch::channel(CoilSnapshot::initial(
            &equipment_id,
            transport.mode(),
            &channels,
        ));
        Self {
            equipment_id,
            channels,
            transport,
            locks,
            state,
        }
    }

    /// Build a session for an equipment record, picking the transport variant
    /// from its `write_only` flag.
    pub fn for_equipment(
        equipment: &Equipment,
        link: Arc<dyn ModbusTransport>,
        options: SessionOptions,
        cache: CommandCache,
        locks: DeviceLocks,
    ) -> Result<Self> {
        let target = equipment.target(options.timeout)?;
        let channels = CoilChannels::from_map(&equipment.register_mappings);

        let transport: Box<dyn CoilTransport> = if equipment.write_only {
            Box::new(WriteOnlyTransport::new(link, target, &equipment.id, cache))
        } else {
            Box::new(NormalTransport::new(link, target, options.verify_writes))
        };

        Ok(Self::new(&equipment.id, channels, transport, locks))
    }

    pub fn equipment_id(&self) -> &str {
        &self.equipment_id
    }

    pub fn channels(&self) -> &CoilChannels {
        &self.channels
    }

    pub fn mode(&self) -> ControlMode {
        self.transport.mode()
    }

    pub fn snapshot(&self) -> CoilSnapshot {
        self.state.borrow().clone()
    }

    /// Receive every state transition.
    pub fn subscribe(&self) -> watch::Receiver<CoilSnapshot> {
        self.state.subscribe()
    }

    fn transition(&self, update: impl FnOnce(&mut CoilSnapshot)) {
        self.state.send_modify(update);
    }

    fn fail(&self, error: &ModbusError, outcome: CommandOutcome) {
        self.transition(|s| {
            s.phase = SessionPhase::Error;
            s.connected = false;
            s.confirmed = false;
            s.outcome = outcome;
            s.last_error = Some(error.to_string());
        });
    }

    /// Refresh every channel.
    pub async fn read_all(&self) -> Result<CoilSnapshot> {
        let _guard = self.locks.acquire(&self.equipment_id).await?;
        self.transition(|s| s.phase = SessionPhase::Reading);

        match self.transport.read_states(&self.channels).await {
            Ok(states) => {
                let mode = self.mode();
                self.transition(|s| {
                    s.set_all(&states);
                    s.phase = SessionPhase::Ready;
                    s.last_error = None;
                    match mode {
                        ControlMode::Normal => {
                            s.connected = true;
                            s.confirmed = true;
                            s.outcome = CommandOutcome::Confirmed;
                            s.touch();
                        }
                        ControlMode::WriteOnly => {
                            s.confirmed = false;
                            s.outcome = CommandOutcome::Unconfirmed;
                        }
                    }
                });
                debug!(equipment = %self.equipment_id, channels = states.len(), "Coils read");
                Ok(self.snapshot())
            }
            Err(e) => {
                warn!(equipment = %self.equipment_id, error = %e, "Coil read failed");
                self.fail(&e, CommandOutcome::Unverified);
                Err(e)
            }
        }
    }

    /// Switch one channel.
    pub async fn write_one(&self, address: u16, value: bool) -> Result<CoilSnapshot> {
        let Some(index) = self.channels.position(address) else {
            return Err(ModbusError::validation(format!(
                "coil {} is not a controllable channel of '{}'",
                address, self.equipment_id
            )));
        };

        let _guard = self.locks.acquire(&self.equipment_id).await?;
        self.transition(|s| s.phase = SessionPhase::Writing);

        match self.transport.write_one(&self.channels, address, value).await {
            Ok(confirmation) => {
                self.transition(|s| {
                    s.states[index].state = value;
                    Self::apply_confirmation(s, confirmation);
                });
                info!(equipment = %self.equipment_id, address, value, "Coil written");
                Ok(self.snapshot())
            }
            Err(e) => {
                warn!(equipment = %self.equipment_id, address, error = %e, "Coil write failed");
                self.fail(&e, CommandOutcome::Failed);
                Err(e)
            }
        }
    }

    /// Switch every channel, as one request over the covering range.
    pub async fn write_all(&self, value: bool) -> Result<CoilSnapshot> {
        let _guard = self.locks.acquire(&self.equipment_id).await?;
        self.transition(|s| s.phase = SessionPhase::Writing);

        match self.transport.write_all(&self.channels, value).await {
            Ok(confirmation) => {
                self.transition(|s| {
                    for state in s.states.iter_mut() {
                        state.state = value;
                    }
                    Self::apply_confirmation(s, confirmation);
                });
                info!(equipment = %self.equipment_id, channels = self.channels.len(), value, "All coils written");
                Ok(self.snapshot())
            }
            Err(e) => {
                warn!(equipment = %self.equipment_id, error = %e, "Coil bulk write failed");
                self.fail(&e, CommandOutcome::Failed);
                Err(e)
            }
        }
    }

    fn apply_confirmation(s: &mut CoilSnapshot, confirmation: WriteConfirmation) {
        match confirmation {
            WriteConfirmation::ReadBack(states) => {
                s.set_all(&states);
                s.confirmed = true;
                s.outcome = CommandOutcome::Confirmed;
            }
            WriteConfirmation::Unconfirmed => {
                s.confirmed = false;
                s.outcome = CommandOutcome::Unconfirmed;
            }
        }
        s.phase = SessionPhase::Ready;
        s.connected = true;
        s.last_error = None;
        s.touch();
    }
}
