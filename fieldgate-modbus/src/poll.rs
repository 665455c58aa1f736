//! One-shot reads of every readable point in a register map.

use serde::Serialize;
use tracing::{debug, trace};

use crate::calibration::Calibration;
use crate::error::{ModbusError, Result};
use crate::register::{DataType, RegisterMap, RegisterMapping, RegisterType};
use crate::transport::{DeviceTarget, ModbusTransport};

/// Value of one register map point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointReading {
    pub name: String,
    pub register: u16,
    #[serde(rename = "type")]
    pub register_type: RegisterType,
    pub data_type: DataType,
    /// Decoded device value
    pub raw: Option<f64>,
    /// `raw` after calibration (bit points are not calibrated)
    pub value: Option<f64>,
    /// Exception returned by the device for this point
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decode the registers of one value, big-endian word order.
pub fn decode_registers(data_type: DataType, words: &[u16]) -> Result<f64> {
    let needed = data_type.register_count() as usize;
    if words.len() < needed {
        return Err(ModbusError::protocol(format!(
            "{} needs {} registers, got {}",
            data_type,
            needed,
            words.len()
        )));
    }

    let pair = || ((words[0] as u32) << 16) | (words[1] as u32);
    let value = match data_type {
        DataType::Bool => f64::from(u8::from(words[0] != 0)),
        DataType::Uint16 => words[0] as f64,
        DataType::Int16 => words[0] as i16 as f64,
        DataType::Uint32 => pair() as f64,
        DataType::Int32 => pair() as i32 as f64,
        DataType::Float32 => f32::from_bits(pair()) as f64,
    };
    Ok(value)
}

async fn read_raw(
    transport: &dyn ModbusTransport,
    target: &DeviceTarget,
    mapping: &RegisterMapping,
) -> Result<f64> {
    match mapping.register_type {
        RegisterType::Coil | RegisterType::Discrete => {
            let bits = if mapping.register_type == RegisterType::Coil {
                transport.read_coils(target, mapping.register, 1).await?
            } else {
                transport
                    .read_discrete_inputs(target, mapping.register, 1)
                    .await?
            };
            let bit = bits
                .first()
                .copied()
                .ok_or_else(|| ModbusError::protocol("empty bit read"))?;
            Ok(f64::from(u8::from(bit)))
        }
        register_type => {
            let words = transport
                .read_registers(
                    target,
                    register_type,
                    mapping.register,
                    mapping.data_type.register_count(),
                )
                .await?;
            decode_registers(mapping.data_type, &words)
        }
    }
}

/// Read every readable point of `map`, applying `calibration` to register values.
///
/// A point the device rejects with an exception is reported with its error;
/// any other failure aborts the read.
pub async fn read_points(
    transport: &dyn ModbusTransport,
    target: &DeviceTarget,
    map: &RegisterMap,
    calibration: Calibration,
) -> Result<Vec<PointReading>> {
    let mut readings = Vec::new();

    for mapping in map.readable() {
        let (raw, error) = match read_raw(transport, target, mapping).await {
            Ok(raw) => (Some(raw), None),
            Err(e) if e.device_answered() => {
                debug!(point = %mapping.name, error = %e, "Point rejected by device");
                (None, Some(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        let value = raw.map(|raw| {
            if mapping.register_type.is_bit() {
                raw
            } else {
                calibration.apply(raw)
            }
        });
        trace!(point = %mapping.name, ?raw, ?value, "Point read");

        readings.push(PointReading {
            name: mapping.name.clone(),
            register: mapping.register,
            register_type: mapping.register_type,
            data_type: mapping.data_type,
            raw,
            value,
            error,
        });
    }

    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::Access;
    use crate::simulator::{SimDevice, SimulatedBus};
    use crate::transport::Endpoint;
    use std::time::Duration;

    #[test]
    fn test_decode_registers() {
        assert_eq!(decode_registers(DataType::Uint16, &[65535]).unwrap(), 65535.0);
        assert_eq!(decode_registers(DataType::Int16, &[65535]).unwrap(), -1.0);
        assert_eq!(decode_registers(DataType::Uint32, &[1, 2]).unwrap(), 65538.0);
        assert_eq!(decode_registers(DataType::Int32, &[0xFFFF, 0xFFFE]).unwrap(), -2.0);
        assert_eq!(decode_registers(DataType::Float32, &[0x4148, 0x0000]).unwrap(), 12.5);
        assert_eq!(decode_registers(DataType::Bool, &[3]).unwrap(), 1.0);
        assert!(decode_registers(DataType::Float32, &[0x4148]).is_err());
    }

    fn mapping(name: &str, register: u16, register_type: RegisterType, data_type: DataType) -> RegisterMapping {
        RegisterMapping::new(name, register, register_type, data_type, Access::Read).unwrap()
    }

    #[tokio::test]
    async fn test_read_points_with_calibration() {
        let endpoint = Endpoint::tcp("10.0.0.30", 502);
        let bus = SimulatedBus::new();
        bus.add_device(
            &endpoint,
            1,
            SimDevice::relay_module(2)
                .with_holding(0, &[10])
                .with_input(4, &[0x4148, 0x0000]),
        );
        bus.set_coil(&endpoint, 1, 1, true);

        let map = RegisterMap::from_mappings([
            mapping("Temperature", 0, RegisterType::Holding, DataType::Uint16),
            mapping("Flow", 4, RegisterType::Input, DataType::Float32),
            mapping("Pump", 1, RegisterType::Coil, DataType::Bool),
            mapping("Missing", 9, RegisterType::Holding, DataType::Uint16),
        ])
        .unwrap();
        let target = DeviceTarget::new(endpoint, 1, Duration::from_millis(100));

        let readings = read_points(&bus, &target, &map, Calibration::new(3.0, 2.0))
            .await
            .unwrap();

        assert_eq!(readings.len(), 4);
        assert_eq!((readings[0].raw, readings[0].value), (Some(10.0), Some(23.0)));
        assert_eq!(readings[1].value, Some(28.0));
        assert_eq!(readings[2].value, Some(1.0));
        assert!(readings[3].raw.is_none());
        assert!(readings[3].error.is_some());
    }

    #[tokio::test]
    async fn test_read_points_aborts_on_connection_error() {
        let bus = SimulatedBus::new();
        let map = RegisterMap::from_mappings([mapping("T", 0, RegisterType::Holding, DataType::Uint16)]).unwrap();
        let target = DeviceTarget::new(Endpoint::tcp("10.0.0.31", 502), 1, Duration::from_millis(100));

        let err = read_points(&bus, &target, &map, Calibration::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Connection(_)));
    }
}
