//! Built-in address tables for the S7-400 at the warehouse line
//!
//! Offsets follow the PLC program's DB layout: DB101 (TLV1), DB102 (TLV2),
//! DB112 (transfer cart) and DB110 (bridge).

use super::AddressKind::{Bit, Byte, Word};
use super::{AddressKind, AddressSpec, DeviceKind, DeviceSpec, EnumTable};
use crate::value::DeviceId;

// ============================================================================
// Enumerated value tables
// ============================================================================

pub const MODE: EnumTable = &[(0, "AUTOMÁTICO"), (1, "SEMIAUTOMÁTICO"), (2, "MANUAL")];

pub const ORDER_KIND: EnumTable = &[
    (0, "SIN ORDEN"),
    (1, "DEPÓSITO"),
    (2, "EXTRACCIÓN"),
    (3, "CAMBIO PASILLO"),
    (4, "TRASVASE"),
    (5, "TEST"),
];

pub const COMPLETION_STATE: EnumTable = &[(0, "SIN ORDEN"), (1, "EN CURSO"), (2, "FIN DE ORDEN")];

/// TLV1's PLC program knows one more completion state than TLV2's
pub const COMPLETION_STATE_TLV1: EnumTable = &[
    (0, "SIN ORDEN"),
    (1, "EN CURSO"),
    (2, "FIN DE ORDEN"),
    (4, "ESTADO ESPECIAL"),
];

pub const COMPLETION_RESULT: EnumTable = &[
    (0, "OK DEPÓSITO"),
    (2, "OK EXTRACCIÓN"),
    (3, "ERROR DEPÓSITO"),
    (4, "ERROR EXTRACCIÓN"),
    (5, "OK TRASVASE"),
    (6, "ABORTADO"),
];

pub const SIDE: EnumTable = &[(1, "IZQUIERDA"), (2, "DERECHA")];

pub const BRIDGE_OCCUPANCY: EnumTable = &[(0, "LIBRE"), (1, "OCUPADO")];
pub const BRIDGE_STATE: EnumTable = &[(0, "OK"), (1, "AVERÍA")];
pub const BRIDGE_SITUATION: EnumTable = &[(0, "PARADO"), (1, "EN MOVIMIENTO")];

// ============================================================================
// Symbol definitions
// ============================================================================

/// One row of a device table, before it is bound to a DB number
struct Row {
    field: &'static str,
    offset: &'static str,
    kind: AddressKind,
    description: &'static str,
    default: i64,
    decode: Option<EnumTable>,
}

const fn row(
    field: &'static str,
    offset: &'static str,
    kind: AddressKind,
    description: &'static str,
    default: i64,
) -> Row {
    Row {
        field,
        offset,
        kind,
        description,
        default,
        decode: None,
    }
}

const fn enum_row(
    field: &'static str,
    offset: &'static str,
    description: &'static str,
    default: i64,
    table: EnumTable,
) -> Row {
    Row {
        field,
        offset,
        kind: AddressKind::Byte,
        description,
        default,
        decode: Some(table),
    }
}

/// Stacker crane layout shared by both cranes
///
/// TLV1 packs occupancy and fault into bits of byte 0, TLV2 uses whole bytes.
fn crane_rows(flags: [(&'static str, AddressKind); 2], completion: EnumTable) -> Vec<Row> {
    let [(occupied_at, flag_kind), (fault_at, _)] = flags;
    vec![
        enum_row("MODO", "B0", "Operating mode", 1, MODE),
        row("OCUPACION", occupied_at, flag_kind, "Occupied (load on board)", 0),
        row("AVERIA", fault_at, flag_kind, "Fault active", 0),
        row("COORD_X", "W10", Word, "Current X coordinate", 0),
        row("COORD_Y", "W12", Word, "Current Y coordinate", 0),
        row("COORD_Z", "W14", Word, "Current Z coordinate", 0),
        row("MATRICULA", "W16", Word, "Registration of the load on board", 12345),
        row("PASILLO", "B18", Byte, "Current aisle", 1),
        enum_row("ORDEN.TIPO", "B20", "Current order type", 2, ORDER_KIND),
        row("ORIGEN.PASILLO", "B22", Byte, "Order origin aisle", 1),
        row("ORIGEN.X", "B23", Byte, "Order origin X", 10),
        row("ORIGEN.Y", "B24", Byte, "Order origin Y", 20),
        enum_row("ORIGEN.Z", "B25", "Order origin side", 1, SIDE),
        row("DESTINO.PASILLO", "B27", Byte, "Order destination aisle", 2),
        row("DESTINO.X", "B28", Byte, "Order destination X", 15),
        row("DESTINO.Y", "B29", Byte, "Order destination Y", 25),
        enum_row("DESTINO.Z", "B30", "Order destination side", 2, SIDE),
        row("ORDEN.MATRICULA", "W32", Word, "Order registration", 54321),
        enum_row("FIN_ORDEN.ESTADO", "B40", "Order completion state", 2, completion),
        enum_row(
            "FIN_ORDEN.RESULTADO",
            "B41",
            "Order completion result",
            2,
            COMPLETION_RESULT,
        ),
        row("FIN_ORDEN.DESTINO.PASILLO", "B42", Byte, "Completed order aisle", 2),
        row("FIN_ORDEN.DESTINO.X", "B43", Byte, "Completed order X", 15),
        row("FIN_ORDEN.DESTINO.Y", "B44", Byte, "Completed order Y", 25),
        enum_row("FIN_ORDEN.DESTINO.Z", "B45", "Completed order side", 2, SIDE),
    ]
}

fn cart_rows() -> Vec<Row> {
    vec![
        row("ST_CONECTADO", "X130.0", Bit, "Cart connected", 1),
        row("ST_DEFECTO", "X130.1", Bit, "Cart fault", 0),
        row("ST_AUTO", "X130.2", Bit, "Automatic mode", 1),
        row("ST_SEMI", "X130.3", Bit, "Semi-automatic mode", 0),
        row("ST_MANUAL", "X130.4", Bit, "Manual mode", 0),
        row("ST_PUERTA", "X130.5", Bit, "Door open", 0),
        row("ST_DATOS", "X130.6", Bit, "Data valid", 1),
        row("MAT_ENTRADA", "W132", Word, "Inbound registration", 0),
        row("MAT_SALIDA", "W134", Word, "Outbound registration", 0),
        row("PAS_DESTINO", "B136", Byte, "Target aisle", 1),
        row("CICLO_TRABAJO", "B137", Byte, "Work cycle", 0),
        row("PAS_ACTUAL", "B140", Byte, "Current aisle", 1),
        row("ST_CARRO", "B141", Byte, "Cart state", 0),
    ]
}

fn bridge_rows() -> Vec<Row> {
    vec![
        enum_row("OCUPACION", "B30", "Bridge occupancy", 0, BRIDGE_OCCUPANCY),
        enum_row("ESTADO", "B31", "Bridge health", 0, BRIDGE_STATE),
        enum_row("SITUACION", "B32", "Bridge motion", 0, BRIDGE_SITUATION),
        row("POSICION", "B33", Byte, "Bridge position", 1),
    ]
}

fn bind(device: &DeviceSpec, rows: Vec<Row>) -> Vec<AddressSpec> {
    rows.into_iter()
        .map(|r| AddressSpec {
            symbol: device.symbol(r.field),
            address: format!("DB{},{}", device.db, r.offset),
            kind: r.kind,
            device: device.id.clone(),
            description: r.description.to_string(),
            default: r.kind.coerce(r.default),
            decode: r.decode,
        })
        .collect()
}

fn device(id: &str, kind: DeviceKind, prefix: &str, db: u16, description: &str) -> DeviceSpec {
    DeviceSpec {
        id: DeviceId::from(id),
        kind,
        prefix: prefix.to_string(),
        db,
        description: description.to_string(),
    }
}

/// Devices and address specs of the line, in polling order
pub fn builtin() -> (Vec<DeviceSpec>, Vec<AddressSpec>) {
    let tlv1 = device("tlv1", DeviceKind::StackerCrane, "TLV1", 101, "Stacker crane 1");
    let tlv2 = device("tlv2", DeviceKind::StackerCrane, "TLV2", 102, "Stacker crane 2");
    let ct = device("ct", DeviceKind::TransferCart, "CT", 112, "Transfer cart");
    let pt = device("pt", DeviceKind::Bridge, "PT", 110, "Transfer bridge");

    let mut specs = bind(
        &tlv1,
        crane_rows([("X0.0", Bit), ("X0.1", Bit)], COMPLETION_STATE_TLV1),
    );
    specs.extend(bind(
        &tlv2,
        crane_rows([("B1", Byte), ("B2", Byte)], COMPLETION_STATE),
    ));
    specs.extend(bind(&ct, cart_rows()));
    specs.extend(bind(&pt, bridge_rows()));

    (vec![tlv1, tlv2, ct, pt], specs)
}
