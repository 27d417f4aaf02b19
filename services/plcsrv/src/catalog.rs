//! Address catalog
//!
//! Static table mapping symbolic names (`TLV1.MODO`) to absolute PLC
//! addresses (`DB101,B0`), their kind, and the enum tables used to decode
//! coded bytes. Built once at startup and shared behind an `Arc`.

pub mod tables;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

use crate::error::CatalogError;
use crate::value::{DeviceId, EnumValue, PlcValue, RawSnapshot};

/// Label returned for codes missing from an enum table
pub const UNKNOWN_LABEL: &str = "UNKNOWN";

/// Finite `code -> label` table defined by the PLC program
pub type EnumTable = &'static [(i64, &'static str)];

/// Width of a PLC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Bit,
    Byte,
    Word,
}

impl AddressKind {
    /// Value used when an address is missing from a snapshot
    pub fn default_value(self) -> PlcValue {
        match self {
            AddressKind::Bit => PlcValue::Bool(false),
            AddressKind::Byte | AddressKind::Word => PlcValue::Int(0),
        }
    }

    /// Largest value the address can hold
    pub fn max_value(self) -> i64 {
        match self {
            AddressKind::Bit => 1,
            AddressKind::Byte => i64::from(u8::MAX),
            AddressKind::Word => i64::from(u16::MAX),
        }
    }

    /// Represent an integer the way the driver expects for this kind
    pub fn coerce(self, value: i64) -> PlcValue {
        match self {
            AddressKind::Bit => PlcValue::Bool(value != 0),
            AddressKind::Byte | AddressKind::Word => PlcValue::Int(value),
        }
    }
}

/// What sort of machine a device is; selects the translator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    StackerCrane,
    TransferCart,
    Bridge,
}

/// A logical device living in one data block of the PLC
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSpec {
    pub id: DeviceId,
    pub kind: DeviceKind,
    /// Symbol prefix, e.g. `TLV1`
    pub prefix: String,
    /// Data block number, e.g. `101`
    pub db: u16,
    pub description: String,
}

impl DeviceSpec {
    /// Fully qualified symbol for a field: `TLV1` + `MODO` -> `TLV1.MODO`
    pub fn symbol(&self, field: &str) -> String {
        format!("{}.{}", self.prefix, field)
    }

    /// Address prefix of the device's data block: `DB101,`
    pub fn address_prefix(&self) -> String {
        format!("DB{},", self.db)
    }
}

/// One addressable PLC value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    pub symbol: String,
    pub address: String,
    pub kind: AddressKind,
    pub device: DeviceId,
    pub description: String,
    /// Seed value for the simulated PLC
    pub default: PlcValue,
    pub decode: Option<EnumTable>,
}

impl AddressSpec {
    /// Label for `code`, if the spec has a table and the table has the code
    pub fn label(&self, code: i64) -> Option<&'static str> {
        self.decode
            .and_then(|table| table.iter().find(|(c, _)| *c == code).map(|(_, l)| *l))
    }
}

/// Immutable symbol table
#[derive(Debug)]
pub struct Catalog {
    devices: Vec<DeviceSpec>,
    specs: Vec<AddressSpec>,
    by_symbol: HashMap<String, usize>,
    by_address: HashMap<String, usize>,
    /// Addresses and symbols already warned about
    warned: Mutex<HashSet<String>>,
}

impl Catalog {
    /// Build a catalog, enforcing unique symbols and unique addresses per device
    pub fn new(devices: Vec<DeviceSpec>, specs: Vec<AddressSpec>) -> Result<Self, CatalogError> {
        let mut by_symbol = HashMap::with_capacity(specs.len());
        let mut by_address = HashMap::with_capacity(specs.len());
        let mut per_device: HashSet<(&DeviceId, &str)> = HashSet::new();

        for (idx, spec) in specs.iter().enumerate() {
            if !devices.iter().any(|d| d.id == spec.device) {
                return Err(CatalogError::UnknownDevice(spec.device.to_string()));
            }
            if by_symbol.insert(spec.symbol.clone(), idx).is_some() {
                return Err(CatalogError::DuplicateSymbol(spec.symbol.clone()));
            }
            if !per_device.insert((&spec.device, spec.address.as_str())) {
                return Err(CatalogError::DuplicateAddress {
                    device: spec.device.to_string(),
                    address: spec.address.clone(),
                });
            }
            by_address.entry(spec.address.clone()).or_insert(idx);
        }

        Ok(Self {
            devices,
            specs,
            by_symbol,
            by_address,
            warned: Mutex::new(HashSet::new()),
        })
    }

    /// Catalog of the warehouse line (TLV1, TLV2, transfer cart, bridge)
    pub fn builtin() -> Result<Self, CatalogError> {
        let (devices, specs) = tables::builtin();
        Self::new(devices, specs)
    }

    pub fn lookup(&self, symbol: &str) -> Result<&AddressSpec, CatalogError> {
        self.by_symbol
            .get(symbol)
            .map(|&idx| &self.specs[idx])
            .ok_or_else(|| CatalogError::UnknownSymbol(symbol.to_string()))
    }

    pub fn device(&self, id: &str) -> Result<&DeviceSpec, CatalogError> {
        self.devices
            .iter()
            .find(|d| d.id.as_str() == id)
            .ok_or_else(|| CatalogError::UnknownDevice(id.to_string()))
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceSpec> {
        self.devices.iter()
    }

    /// Specs of one device in definition order
    pub fn specs_for_device<'a>(&'a self, device: &'a str) -> impl Iterator<Item = &'a AddressSpec> {
        self.specs.iter().filter(move |s| s.device.as_str() == device)
    }

    /// Absolute addresses of one device in definition order
    ///
    /// Unknown devices yield an empty list.
    pub fn addresses_for_device(&self, device: &str) -> Vec<String> {
        self.specs_for_device(device)
            .map(|s| s.address.clone())
            .collect()
    }

    /// Spec of a device field, e.g. (`tlv1`, `COORD_X`)
    pub fn field(&self, device: &str, field: &str) -> Result<&AddressSpec, CatalogError> {
        let spec = self.device(device)?;
        self.lookup(&spec.symbol(field))
    }

    /// Human readable label for a coded value
    ///
    /// Returns [`UNKNOWN_LABEL`] when the symbol has no table or the table
    /// has no entry for the code. Booleans decode as 0/1.
    pub fn decode_enum(&self, symbol: &str, raw: PlcValue) -> String {
        self.lookup(symbol)
            .ok()
            .and_then(|spec| spec.label(raw.as_i64()))
            .unwrap_or(UNKNOWN_LABEL)
            .to_string()
    }

    /// Code plus label
    pub fn enum_value(&self, symbol: &str, raw: PlcValue) -> EnumValue {
        EnumValue {
            code: raw.as_i64(),
            label: self.decode_enum(symbol, raw),
        }
    }

    pub fn symbol_for_address(&self, address: &str) -> Option<&AddressSpec> {
        self.by_address.get(address).map(|&idx| &self.specs[idx])
    }

    /// Device owning an address, dispatched on the `DB<n>,` prefix only
    pub fn device_for_address(&self, address: &str) -> Option<&DeviceSpec> {
        let (db_part, _) = address.split_once(',')?;
        let db: u16 = db_part.strip_prefix("DB")?.parse().ok()?;
        self.devices.iter().find(|d| d.db == db)
    }

    /// Re-key a snapshot by symbol
    ///
    /// Addresses without a symbol keep their raw address as key. Each such
    /// address is logged once per catalog.
    pub fn to_symbolic_keys(&self, snapshot: &RawSnapshot) -> BTreeMap<String, PlcValue> {
        snapshot
            .iter()
            .map(|(address, value)| match self.symbol_for_address(address) {
                Some(spec) => (spec.symbol.clone(), value),
                None => {
                    self.warn_unknown_address(address);
                    (address.to_string(), value)
                },
            })
            .collect()
    }

    /// Re-key symbolic values by absolute address
    pub fn to_absolute_keys<'a, I>(&self, values: I) -> Result<Vec<(String, PlcValue)>, CatalogError>
    where
        I: IntoIterator<Item = (&'a str, PlcValue)>,
    {
        values
            .into_iter()
            .map(|(symbol, value)| {
                self.lookup(symbol)
                    .map(|spec| (spec.address.clone(), value))
            })
            .collect()
    }

    /// Seed values for a simulated device
    pub fn simulated_values(&self, device: &str) -> Vec<(String, PlcValue)> {
        self.specs_for_device(device)
            .map(|s| (s.address.clone(), s.default))
            .collect()
    }

    fn warn_unknown_address(&self, address: &str) {
        if self.first_warning(address) {
            warn!("No symbol for address {}, keeping raw key", address);
        }
    }

    /// Report a field a snapshot did not carry, once per symbol
    pub(crate) fn warn_missing_field(&self, symbol: &str, address: Option<&str>) {
        if !self.first_warning(symbol) {
            return;
        }
        match address {
            Some(address) => warn!(
                "{} ({}) missing from snapshot, using its default",
                symbol, address
            ),
            None => warn!("{} is not in the catalog, using 0", symbol),
        }
    }

    fn first_warning(&self, key: &str) -> bool {
        self.warned.lock().insert(key.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::builtin().unwrap()
    }

    #[test]
    fn test_lookup_round_trip_for_every_spec() {
        let catalog = catalog();
        for device in catalog.devices() {
            for spec in catalog.specs_for_device(device.id.as_str()) {
                let found = catalog.lookup(&spec.symbol).unwrap();
                assert_eq!(found.address, spec.address, "symbol {}", spec.symbol);
                assert_eq!(
                    catalog.symbol_for_address(&spec.address).unwrap().symbol,
                    spec.symbol
                );
            }
        }
    }

    #[test]
    fn test_builtin_layout() {
        let catalog = catalog();
        assert_eq!(catalog.lookup("TLV1.MODO").unwrap().address, "DB101,B0");
        assert_eq!(catalog.lookup("TLV1.OCUPACION").unwrap().kind, AddressKind::Bit);
        assert_eq!(catalog.lookup("TLV2.OCUPACION").unwrap().address, "DB102,B1");
        assert_eq!(catalog.lookup("TLV2.AVERIA").unwrap().kind, AddressKind::Byte);
        assert_eq!(catalog.lookup("CT.ST_PUERTA").unwrap().address, "DB112,X130.5");
        assert_eq!(catalog.lookup("PT.POSICION").unwrap().address, "DB110,B33");
    }

    #[test]
    fn test_unknown_symbol() {
        let err = catalog().lookup("TLV9.MODO").unwrap_err();
        assert_eq!(err, CatalogError::UnknownSymbol("TLV9.MODO".into()));
    }

    #[test]
    fn test_addresses_keep_definition_order() {
        let addresses = catalog().addresses_for_device("tlv1");
        assert_eq!(addresses.len(), 24);
        assert_eq!(addresses[0], "DB101,B0");
        assert_eq!(addresses[1], "DB101,X0.0");
        assert_eq!(addresses[23], "DB101,B45");
        assert!(catalog().addresses_for_device("nope").is_empty());
    }

    #[test]
    fn test_decode_enum() {
        let catalog = catalog();
        assert_eq!(catalog.decode_enum("TLV1.MODO", PlcValue::Int(1)), "SEMIAUTOMÁTICO");
        assert_eq!(
            catalog.decode_enum("TLV1.FIN_ORDEN.ESTADO", PlcValue::Int(4)),
            "ESTADO ESPECIAL"
        );
        assert_eq!(catalog.decode_enum("TLV2.FIN_ORDEN.ESTADO", PlcValue::Int(4)), UNKNOWN_LABEL);
        assert_eq!(catalog.decode_enum("PT.OCUPACION", PlcValue::Bool(true)), "OCUPADO");
    }

    #[test]
    fn test_decode_enum_unknown_codes_never_fail() {
        let catalog = catalog();
        for code in [-1, 3, 7, 99, 255, 65535] {
            assert_eq!(catalog.decode_enum("TLV1.MODO", PlcValue::Int(code)), UNKNOWN_LABEL);
        }
        assert_eq!(catalog.decode_enum("TLV1.COORD_X", PlcValue::Int(1)), UNKNOWN_LABEL);
        assert_eq!(catalog.decode_enum("NOT.A.SYMBOL", PlcValue::Int(0)), UNKNOWN_LABEL);
    }

    #[test]
    fn test_device_for_address_uses_db_prefix() {
        let catalog = catalog();
        assert_eq!(catalog.device_for_address("DB102,W10").unwrap().id.as_str(), "tlv2");
        assert_eq!(catalog.device_for_address("DB110,B99").unwrap().id.as_str(), "pt");
        assert!(catalog.device_for_address("DB999,B0").is_none());
        assert!(catalog.device_for_address("garbage").is_none());
    }

    #[test]
    fn test_symbolic_keys_fall_back_to_raw_address() {
        let catalog = catalog();
        let snapshot: RawSnapshot = vec![
            ("DB101,B0", PlcValue::Int(2)),
            ("DB101,B99", PlcValue::Int(7)),
        ]
        .into_iter()
        .collect();

        let symbolic = catalog.to_symbolic_keys(&snapshot);
        assert_eq!(symbolic.get("TLV1.MODO"), Some(&PlcValue::Int(2)));
        assert_eq!(symbolic.get("DB101,B99"), Some(&PlcValue::Int(7)));
    }

    #[test]
    fn test_absolute_keys() {
        let catalog = catalog();
        let absolute = catalog
            .to_absolute_keys(vec![("TLV1.COORD_X", PlcValue::Int(15))])
            .unwrap();
        assert_eq!(absolute, vec![("DB101,W10".to_string(), PlcValue::Int(15))]);
        assert!(catalog
            .to_absolute_keys(vec![("TLV1.NOPE", PlcValue::Int(1))])
            .is_err());
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let (devices, mut specs) = tables::builtin();
        let dup = specs[0].clone();
        specs.push(dup);
        assert!(matches!(
            Catalog::new(devices, specs),
            Err(CatalogError::DuplicateSymbol(_))
        ));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let (devices, mut specs) = tables::builtin();
        let mut dup = specs[0].clone();
        dup.symbol = "TLV1.ALIAS".to_string();
        specs.push(dup);
        assert!(matches!(
            Catalog::new(devices, specs),
            Err(CatalogError::DuplicateAddress { .. })
        ));
    }

    #[test]
    fn test_simulated_values_match_kinds() {
        let catalog = catalog();
        let values = catalog.simulated_values("tlv1");
        assert!(values.contains(&("DB101,X0.0".to_string(), PlcValue::Bool(false))));
        assert!(values.contains(&("DB101,W16".to_string(), PlcValue::Int(12345))));
    }
}
