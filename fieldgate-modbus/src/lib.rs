//! Modbus device control and discovery for the FieldGate edge gateway.
//!
//! Operators configure field devices (relay modules, meters, PLCs) as
//! equipment records carrying a register map. This crate reads and switches
//! their coils, reads their registers, and finds new devices on a serial bus
//! behind a gateway or on the local network.
//!
//! - [`register`] / [`preset`] - Register map model, import/export, relay presets
//! - [`control`] - Per-device coil sessions (normal and write-only devices)
//! - [`poll`] / [`calibration`] - Calibrated point reads
//! - [`scanner`] - Slave id discovery behind a gateway
//! - [`network`] - IPv4 sweep for Modbus TCP devices
//! - [`service`] - The [`GatewayService`] facade over all of the above
//! - [`transport`] - Modbus I/O over `tokio-modbus`, and [`simulator`] for tests
//!
//! # Addresses
//!
//! ```text
//! 192.168.1.50:502     TCP device or RTU-over-TCP gateway
//! 192.168.1.50         TCP, port 502
//! /dev/ttyUSB0, COM3   RTU over a local serial port
//! ```

pub mod calibration;
pub mod config;
pub mod control;
pub mod equipment;
pub mod error;
pub mod network;
pub mod poll;
pub mod preset;
pub mod register;
pub mod scanner;
pub mod service;
pub mod simulator;
pub mod transport;

pub use config::GatewayConfig;
pub use error::{ModbusError, Result};
pub use service::GatewayService;
