//! FieldGate Modbus command line.
//!
//! Runs control-layer operations against the devices of a configuration file,
//! or against an in-memory simulation of them with `--simulate`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fieldgate_common::LoggingConfig;
use fieldgate_modbus::config::GatewayConfig;
use fieldgate_modbus::control::CoilSnapshot;
use fieldgate_modbus::equipment::InMemoryEquipmentStore;
use fieldgate_modbus::network::NetworkScanRequest;
use fieldgate_modbus::register::RegisterType;
use fieldgate_modbus::scanner::{ScanConfig, ScanHandle};
use fieldgate_modbus::simulator::{SimDevice, SimulatedBus};
use fieldgate_modbus::transport::{DEFAULT_MODBUS_PORT, ModbusTransport, TokioModbusTransport};
use fieldgate_modbus::{GatewayService, ModbusError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Modbus device control and discovery.
#[derive(Parser, Debug)]
#[command(name = "fieldgate-modbus")]
#[command(about = "Controls and discovers Modbus field devices")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Run against simulated devices built from the configured equipment
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl From<Switch> for bool {
    fn from(switch: Switch) -> Self {
        matches!(switch, Switch::On)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Probe a range of slave ids behind a gateway
    ScanSlaves {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = DEFAULT_MODBUS_PORT)]
        port: u16,
        #[arg(long, default_value_t = 1)]
        start: u8,
        #[arg(long, default_value_t = 247)]
        end: u8,
        /// Per-probe timeout (defaults to discovery.timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Create equipment records for the slaves found
        #[arg(long)]
        create: bool,
        /// Name prefix for created records
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Sweep IPv4 ranges for Modbus TCP devices
    ScanNetwork {
        /// Range to sweep (a.b.c.d, a.b.c.d/n, a.b.c.d-a.b.c.e); repeatable
        #[arg(long = "range", required = true)]
        ranges: Vec<String>,
        /// Port to probe; repeatable
        #[arg(long = "port")]
        ports: Vec<u16>,
    },
    /// Read every controllable coil of an equipment
    ReadCoils { equipment: String },
    /// Switch one coil
    WriteCoil {
        equipment: String,
        address: u16,
        #[arg(value_enum)]
        state: Switch,
    },
    /// Switch every coil
    WriteAll {
        equipment: String,
        #[arg(value_enum)]
        state: Switch,
    },
    /// Read every readable point, calibrated
    ReadPoints { equipment: String },
    /// Set an equipment's calibration
    Calibrate {
        equipment: String,
        #[arg(long, allow_hyphen_values = true)]
        offset: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        scale: Option<String>,
    },
    /// List presets, or print one as a register map
    Preset {
        /// Catalog key (relay_8ch, ...)
        key: Option<String>,
        /// Expand an N-channel relay module instead
        #[arg(long, conflicts_with = "key")]
        channels: Option<u16>,
    },
    /// Export an equipment's register map
    ExportMap {
        equipment: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a register map file and print the normalized map
    ImportMap { file: PathBuf },
}

impl Command {
    /// Equipment id or host the command is aimed at.
    fn target(&self) -> Option<String> {
        match self {
            Command::ScanSlaves { host, .. } => Some(host.clone()),
            Command::ReadCoils { equipment }
            | Command::WriteCoil { equipment, .. }
            | Command::WriteAll { equipment, .. }
            | Command::ReadPoints { equipment }
            | Command::Calibrate { equipment, .. }
            | Command::ExportMap { equipment, .. } => Some(equipment.clone()),
            Command::ScanNetwork { .. } | Command::Preset { .. } | Command::ImportMap { .. } => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => GatewayConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => GatewayConfig::default(),
    };

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    fieldgate_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!(
        equipment = config.equipment.len(),
        simulate = args.simulate,
        "Starting fieldgate-modbus"
    );

    let transport: Arc<dyn ModbusTransport> = if args.simulate {
        Arc::new(simulated_bus(&config))
    } else {
        Arc::new(TokioModbusTransport::new(config.modbus.serial.clone()))
    };
    let store = Arc::new(InMemoryEquipmentStore::with_equipment(config.equipment.clone()));
    let service = GatewayService::new(config, store, transport);

    let target = args.command.target();
    let result = run(&service, args.command).await;
    if let Err(e) = &result {
        if let Some(modbus) = e.downcast_ref::<ModbusError>() {
            let report = modbus.report(target.unwrap_or_else(|| "gateway".to_string()));
            error!(
                error_type = ?report.error_type,
                retryable = report.retryable,
                "{}",
                report.message
            );
        }
    }
    result
}

async fn run(service: &GatewayService, command: Command) -> Result<()> {
    match command {
        Command::ScanSlaves {
            host,
            port,
            start,
            end,
            timeout_ms,
            create,
            prefix,
        } => {
            let timeout_ms = timeout_ms.unwrap_or(service.config().discovery.timeout_ms);
            let handle = service.scan_slave_ids(ScanConfig::new(&host, port, start, end, timeout_ms))?;
            let report = follow_scan(handle).await?;
            print_json(&report)?;

            if create && !report.slaves.is_empty() {
                let ids: Vec<u8> = report.slaves.iter().map(|s| s.slave_id).collect();
                let created = service
                    .create_equipment_from_slaves(&host, port, &ids, prefix.as_deref())
                    .await?;
                info!(created, "Equipment records created");
            }
        }
        Command::ScanNetwork { ranges, ports } => {
            let handle = service
                .scan_network(&NetworkScanRequest { ranges, ports })
                .await?;
            print_json(&follow_scan(handle).await?)?;
        }
        Command::ReadCoils { equipment } => {
            print_snapshot(&service.read_coils(&equipment).await?);
        }
        Command::WriteCoil {
            equipment,
            address,
            state,
        } => {
            print_snapshot(&service.write_coil(&equipment, address, state.into()).await?);
        }
        Command::WriteAll { equipment, state } => {
            print_snapshot(&service.write_all_coils(&equipment, state.into()).await?);
        }
        Command::ReadPoints { equipment } => {
            print_json(&service.read_points(&equipment).await?)?;
        }
        Command::Calibrate {
            equipment,
            offset,
            scale,
        } => {
            let calibration = service
                .apply_calibration(&equipment, &cli_number(offset), &cli_number(scale))
                .await?;
            print_json(&calibration)?;
        }
        Command::Preset { key, channels } => match (key, channels) {
            (_, Some(channels)) => print_json(&service.expand_preset(channels)?)?,
            (Some(key), None) => print_json(&service.load_preset(&key)?)?,
            (None, None) => {
                for preset in service.list_presets() {
                    println!("{:<12} {}", preset.key, preset.label);
                }
            }
        },
        Command::ExportMap { equipment, output } => {
            let export = service.export_register_map(&equipment).await?;
            let json = serde_json::to_string_pretty(&export)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    info!(path = ?path, mappings = export.mappings.len(), "Register map exported");
                }
                None => println!("{}", json),
            }
        }
        Command::ImportMap { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {:?}", file))?;
            let map = service.import_register_map(&content)?;
            info!(mappings = map.len(), "Register map is valid");
            print_json(&map)?;
        }
    }

    Ok(())
}

/// Log a running scan's progress until it finishes. Ctrl-C cancels it.
async fn follow_scan<R>(mut handle: ScanHandle<R>) -> Result<R> {
    let cancel = handle.cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancelling scan");
            cancel.cancel();
        }
    });

    while let Some(progress) = handle.progress.recv().await {
        info!(
            current = progress.current,
            total = progress.total,
            found = progress.found,
            percent = progress.percent,
            "Scan progress"
        );
    }
    watcher.abort();
    Ok(handle.join().await?)
}

/// Calibration arguments take the same coercion path as API input.
fn cli_number(arg: Option<String>) -> serde_json::Value {
    match arg {
        Some(s) => serde_json::Value::String(s),
        None => serde_json::Value::Null,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_snapshot(snapshot: &CoilSnapshot) {
    let updated = snapshot
        .last_update_ms
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());

    println!(
        "{} [{}] {} (updated {})",
        snapshot.equipment_id,
        snapshot.device_status(),
        snapshot.outcome.description(),
        updated
    );
    for coil in &snapshot.states {
        println!(
            "  {:>5}  {:<24} {}",
            coil.address,
            coil.name,
            if coil.state { "ON" } else { "OFF" }
        );
    }
}

/// One simulated device per configured equipment, exposing its mapped points.
fn simulated_bus(config: &GatewayConfig) -> SimulatedBus {
    let bus = SimulatedBus::new();

    for equipment in &config.equipment {
        let endpoint = match equipment.endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(equipment = %equipment.id, error = %e, "Skipping simulated device");
                continue;
            }
        };

        let mut device = SimDevice {
            mute: equipment.write_only,
            ..SimDevice::default()
        };
        for mapping in equipment.register_mappings.iter() {
            let words = mapping.data_type.register_count();
            match mapping.register_type {
                RegisterType::Coil => {
                    device.coils.insert(mapping.register, false);
                }
                RegisterType::Discrete => {
                    device.discrete_inputs.insert(mapping.register, false);
                }
                RegisterType::Holding => {
                    device = device.with_holding(mapping.register, &vec![0; words as usize]);
                }
                RegisterType::Input => {
                    device = device.with_input(mapping.register, &vec![0; words as usize]);
                }
            }
        }
        bus.add_device(&endpoint, equipment.slave_id, device);
    }

    bus
}
