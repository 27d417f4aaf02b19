//! Operator commands
//!
//! Validates a command against the catalog, then writes all of its fields in
//! one batch through the device's session. Validation never touches the
//! transport, and a disconnected session fails fast with `NotConnected`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::{PlcError, Result, ValidationError, WriteError};
use crate::session::DeviceSession;
use crate::value::{DeviceId, PlcValue};

/// Target coordinates for a crane; at least one field is required
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionCommand {
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub z: Option<i64>,
    pub aisle: Option<i64>,
}

/// Aisle/x/y/side of an order endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationTarget {
    pub aisle: i64,
    pub x: i64,
    pub y: i64,
    pub side: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCommand {
    /// Order type code, required
    pub kind: Option<i64>,
    pub origin: Option<LocationTarget>,
    pub destination: Option<LocationTarget>,
    pub registration: Option<i64>,
}

/// What a successful command wrote
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteReceipt {
    pub device: DeviceId,
    /// Absolute address and value, in write order
    pub values: Vec<(String, PlcValue)>,
    pub verified: bool,
}

/// Command entry point shared by every caller
#[derive(Debug)]
pub struct CommandService {
    catalog: Arc<Catalog>,
    sessions: HashMap<DeviceId, Arc<DeviceSession>>,
    verify_writes: bool,
}

impl CommandService {
    pub fn new(
        catalog: Arc<Catalog>,
        sessions: HashMap<DeviceId, Arc<DeviceSession>>,
        verify_writes: bool,
    ) -> Self {
        Self {
            catalog,
            sessions,
            verify_writes,
        }
    }

    /// Write target coordinates of a crane
    pub async fn write_position(
        &self,
        device: &str,
        command: &PositionCommand,
    ) -> Result<WriteReceipt> {
        let fields: Vec<(String, i64)> = [
            ("COORD_X", command.x),
            ("COORD_Y", command.y),
            ("COORD_Z", command.z),
            ("PASILLO", command.aisle),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.map(|v| (field.to_string(), v)))
        .collect();

        self.execute(device, "write_position", fields).await
    }

    /// Write a new order: type, optional origin/destination and registration
    pub async fn write_order(&self, device: &str, command: &OrderCommand) -> Result<WriteReceipt> {
        let kind = command
            .kind
            .ok_or(ValidationError::MissingField("kind"))?;

        let mut fields = vec![("ORDEN.TIPO".to_string(), kind)];
        for (prefix, location) in [("ORIGEN", command.origin), ("DESTINO", command.destination)] {
            if let Some(loc) = location {
                fields.push((format!("{}.PASILLO", prefix), loc.aisle));
                fields.push((format!("{}.X", prefix), loc.x));
                fields.push((format!("{}.Y", prefix), loc.y));
                fields.push((format!("{}.Z", prefix), loc.side));
            }
        }
        if let Some(registration) = command.registration {
            fields.push(("ORDEN.MATRICULA".to_string(), registration));
        }

        self.execute(device, "write_order", fields).await
    }

    /// Switch the operating mode (0 automatic, 1 semi-automatic, 2 manual)
    pub async fn set_mode(&self, device: &str, mode: i64) -> Result<WriteReceipt> {
        self.execute(device, "set_mode", vec![("MODO".to_string(), mode)])
            .await
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    async fn execute(
        &self,
        device: &str,
        command: &str,
        fields: Vec<(String, i64)>,
    ) -> Result<WriteReceipt> {
        let values = self.validate(device, &fields)?;

        let session = self
            .sessions
            .get(device)
            .ok_or_else(|| PlcError::unavailable(device, "device is not monitored"))?;
        if !session.is_connected() {
            debug!("{} {} rejected: session not connected", device, command);
            return Err(WriteError::NotConnected.into());
        }

        session.write_batch(&values).await?;
        info!("{} {} wrote {} values", device, command, values.len());

        let verified = if self.verify_writes {
            self.verify(session, &values).await?;
            true
        } else {
            false
        };

        Ok(WriteReceipt {
            device: DeviceId::from(device),
            values,
            verified,
        })
    }

    /// Map fields to addresses, rejecting anything the PLC would not accept
    fn validate(&self, device: &str, fields: &[(String, i64)]) -> Result<Vec<(String, PlcValue)>> {
        if fields.is_empty() {
            return Err(ValidationError::Empty.into());
        }
        let device_spec = self.catalog.device(device)?;

        fields
            .iter()
            .map(|(field, value)| -> Result<(String, PlcValue)> {
                let spec = self
                    .catalog
                    .lookup(&device_spec.symbol(field))
                    .map_err(|_| ValidationError::UnsupportedField {
                        device: device.to_string(),
                        field: field.clone(),
                    })?;

                let max = spec.kind.max_value();
                if !(0..=max).contains(value) {
                    return Err(ValidationError::OutOfRange {
                        field: field.clone(),
                        value: *value,
                        max,
                    }
                    .into());
                }
                if spec.decode.is_some() && spec.label(*value).is_none() {
                    return Err(ValidationError::UnknownCode {
                        field: field.clone(),
                        code: *value,
                    }
                    .into());
                }
                Ok((spec.address.clone(), spec.kind.coerce(*value)))
            })
            .collect()
    }

    /// Read the written addresses back and compare
    async fn verify(&self, session: &DeviceSession, values: &[(String, PlcValue)]) -> Result<()> {
        let addresses: Vec<String> = values.iter().map(|(a, _)| a.clone()).collect();
        let snapshot = session.read_batch(&addresses).await?;

        for (address, expected) in values {
            let actual = snapshot.get(address);
            if actual.map(|v| v.as_i64()) != Some(expected.as_i64()) {
                let actual = actual.map_or_else(|| "null".to_string(), |v| v.to_string());
                warn!(
                    "Readback mismatch at {}: wrote {}, read {}",
                    address, expected, actual
                );
                return Err(WriteError::VerificationFailed {
                    address: address.clone(),
                    expected: expected.to_string(),
                    actual,
                }
                .into());
            }
        }
        Ok(())
    }
}
