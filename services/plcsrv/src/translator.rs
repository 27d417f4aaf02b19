//! Domain translator
//!
//! Turns a raw address -> value snapshot into a typed record for one device.
//! Pure: no I/O, no state. Missing addresses read as `false`/`0`, unknown
//! enum codes as `UNKNOWN`, and a field missing from the catalog never fails
//! the translation.

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, DeviceKind, DeviceSpec};
use crate::error::CatalogError;
use crate::value::{EnumValue, PlcValue, RawSnapshot};

// ============================================================================
// Records
// ============================================================================

/// Derived crane status shown on the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CraneStatus {
    Error,
    Moving,
    Active,
    Inactive,
}

impl CraneStatus {
    /// Fault wins, then occupancy, then automatic mode
    pub fn derive(fault: bool, occupied: bool, mode_code: i64) -> Self {
        if fault {
            CraneStatus::Error
        } else if occupied {
            CraneStatus::Moving
        } else if mode_code == 0 {
            CraneStatus::Active
        } else {
            CraneStatus::Inactive
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CranePosition {
    pub x: u16,
    pub y: u16,
    pub z: u16,
    pub aisle: u8,
    /// Registration of the load on board
    pub registration: u16,
}

/// Aisle/x/y plus the side of the aisle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub aisle: u8,
    pub x: u8,
    pub y: u8,
    pub side: EnumValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CraneOrder {
    pub kind: EnumValue,
    pub origin: Location,
    pub destination: Location,
    pub registration: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCompletion {
    pub state: EnumValue,
    pub result: EnumValue,
    pub destination: Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CraneRecord {
    pub mode: EnumValue,
    pub occupied: bool,
    pub fault: bool,
    pub status: CraneStatus,
    pub position: CranePosition,
    pub current_order: CraneOrder,
    pub completion: OrderCompletion,
}

/// Cart operating mode, from three mutually exclusive bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CartMode {
    Auto,
    Semi,
    Manual,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartRecord {
    pub connected: bool,
    pub fault: bool,
    pub mode: CartMode,
    pub door_open: bool,
    pub data_ok: bool,
    pub input_registration: u16,
    pub output_registration: u16,
    pub target_aisle: u8,
    pub work_cycle: u8,
    pub current_aisle: u8,
    pub cart_state: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub occupancy: EnumValue,
    pub state: EnumValue,
    pub situation: EnumValue,
    pub position: u8,
}

/// Typed snapshot of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainRecord {
    StackerCrane(CraneRecord),
    TransferCart(CartRecord),
    Bridge(BridgeRecord),
}

impl DomainRecord {
    pub fn as_crane(&self) -> Option<&CraneRecord> {
        match self {
            DomainRecord::StackerCrane(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_cart(&self) -> Option<&CartRecord> {
        match self {
            DomainRecord::TransferCart(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_bridge(&self) -> Option<&BridgeRecord> {
        match self {
            DomainRecord::Bridge(r) => Some(r),
            _ => None,
        }
    }
}

// ============================================================================
// Translation
// ============================================================================

/// Reads device fields out of a snapshot through the catalog
struct FieldReader<'a> {
    catalog: &'a Catalog,
    device: &'a DeviceSpec,
    snapshot: &'a RawSnapshot,
}

impl FieldReader<'_> {
    /// Raw value of a field, or its kind's default when absent
    ///
    /// Absent fields are logged the first time they are seen.
    fn raw(&self, field: &str) -> PlcValue {
        let symbol = self.device.symbol(field);
        match self.catalog.lookup(&symbol) {
            Ok(spec) => self.snapshot.get(&spec.address).unwrap_or_else(|| {
                self.catalog.warn_missing_field(&symbol, Some(&spec.address));
                spec.kind.default_value()
            }),
            Err(_) => {
                self.catalog.warn_missing_field(&symbol, None);
                PlcValue::Int(0)
            },
        }
    }

    fn flag(&self, field: &str) -> bool {
        self.raw(field).as_bool()
    }

    fn byte(&self, field: &str) -> u8 {
        self.raw(field).as_i64().clamp(0, i64::from(u8::MAX)) as u8
    }

    fn word(&self, field: &str) -> u16 {
        self.raw(field).as_i64().clamp(0, i64::from(u16::MAX)) as u16
    }

    fn enumerated(&self, field: &str) -> EnumValue {
        self.catalog
            .enum_value(&self.device.symbol(field), self.raw(field))
    }

    fn location(&self, prefix: &str) -> Location {
        Location {
            aisle: self.byte(&format!("{}.PASILLO", prefix)),
            x: self.byte(&format!("{}.X", prefix)),
            y: self.byte(&format!("{}.Y", prefix)),
            side: self.enumerated(&format!("{}.Z", prefix)),
        }
    }
}

/// Translate a snapshot into the record of `device`
///
/// Fails only when the device itself is not in the catalog.
pub fn translate(
    catalog: &Catalog,
    device: &str,
    snapshot: &RawSnapshot,
) -> Result<DomainRecord, CatalogError> {
    let spec = catalog.device(device)?;
    let reader = FieldReader {
        catalog,
        device: spec,
        snapshot,
    };

    Ok(match spec.kind {
        DeviceKind::StackerCrane => DomainRecord::StackerCrane(crane(&reader)),
        DeviceKind::TransferCart => DomainRecord::TransferCart(cart(&reader)),
        DeviceKind::Bridge => DomainRecord::Bridge(bridge(&reader)),
    })
}

fn crane(r: &FieldReader<'_>) -> CraneRecord {
    let mode = r.enumerated("MODO");
    let occupied = r.flag("OCUPACION");
    let fault = r.flag("AVERIA");

    CraneRecord {
        status: CraneStatus::derive(fault, occupied, mode.code),
        mode,
        occupied,
        fault,
        position: CranePosition {
            x: r.word("COORD_X"),
            y: r.word("COORD_Y"),
            z: r.word("COORD_Z"),
            aisle: r.byte("PASILLO"),
            registration: r.word("MATRICULA"),
        },
        current_order: CraneOrder {
            kind: r.enumerated("ORDEN.TIPO"),
            origin: r.location("ORIGEN"),
            destination: r.location("DESTINO"),
            registration: r.word("ORDEN.MATRICULA"),
        },
        completion: OrderCompletion {
            state: r.enumerated("FIN_ORDEN.ESTADO"),
            result: r.enumerated("FIN_ORDEN.RESULTADO"),
            destination: r.location("FIN_ORDEN.DESTINO"),
        },
    }
}

fn cart(r: &FieldReader<'_>) -> CartRecord {
    let mode = match (r.flag("ST_AUTO"), r.flag("ST_SEMI"), r.flag("ST_MANUAL")) {
        (true, false, false) => CartMode::Auto,
        (false, true, false) => CartMode::Semi,
        (false, false, true) => CartMode::Manual,
        _ => CartMode::Unknown,
    };

    CartRecord {
        connected: r.flag("ST_CONECTADO"),
        fault: r.flag("ST_DEFECTO"),
        mode,
        door_open: r.flag("ST_PUERTA"),
        data_ok: r.flag("ST_DATOS"),
        input_registration: r.word("MAT_ENTRADA"),
        output_registration: r.word("MAT_SALIDA"),
        target_aisle: r.byte("PAS_DESTINO"),
        work_cycle: r.byte("CICLO_TRABAJO"),
        current_aisle: r.byte("PAS_ACTUAL"),
        cart_state: r.byte("ST_CARRO"),
    }
}

fn bridge(r: &FieldReader<'_>) -> BridgeRecord {
    BridgeRecord {
        occupancy: r.enumerated("OCUPACION"),
        state: r.enumerated("ESTADO"),
        situation: r.enumerated("SITUACION"),
        position: r.byte("POSICION"),
    }
}
