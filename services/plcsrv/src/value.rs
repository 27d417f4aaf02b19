//! Value types shared by every layer: device ids, raw PLC values, snapshots

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

/// Logical device identifier (`tlv1`, `tlv2`, `ct`, `pt`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A single raw value as the driver returns it
///
/// Bits come back as booleans, bytes and words as integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlcValue {
    Bool(bool),
    Int(i64),
}

impl PlcValue {
    /// Non-zero integers read as `true`, so byte-coded flags work too
    pub fn as_bool(&self) -> bool {
        match *self {
            PlcValue::Bool(b) => b,
            PlcValue::Int(i) => i != 0,
        }
    }

    /// Booleans read as 0/1
    pub fn as_i64(&self) -> i64 {
        match *self {
            PlcValue::Bool(b) => i64::from(b),
            PlcValue::Int(i) => i,
        }
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlcValue::Bool(b) => write!(f, "{}", b),
            PlcValue::Int(i) => write!(f, "{}", i),
        }
    }
}

impl From<bool> for PlcValue {
    fn from(b: bool) -> Self {
        PlcValue::Bool(b)
    }
}

impl From<u8> for PlcValue {
    fn from(v: u8) -> Self {
        PlcValue::Int(i64::from(v))
    }
}

impl From<u16> for PlcValue {
    fn from(v: u16) -> Self {
        PlcValue::Int(i64::from(v))
    }
}

impl From<i64> for PlcValue {
    fn from(v: i64) -> Self {
        PlcValue::Int(v)
    }
}

/// Address -> value map from one batched read
///
/// Addresses the driver reported as null are not stored, so "absent" and
/// "null" look the same to the translator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawSnapshot {
    values: BTreeMap<String, PlcValue>,
}

impl RawSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from driver output, dropping null entries
    pub fn from_reads<I>(reads: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<PlcValue>)>,
    {
        let values = reads
            .into_iter()
            .filter_map(|(address, value)| value.map(|v| (address, v)))
            .collect();
        Self { values }
    }

    pub fn get(&self, address: &str) -> Option<PlcValue> {
        self.values.get(address).copied()
    }

    pub fn insert(&mut self, address: impl Into<String>, value: impl Into<PlcValue>) {
        self.values.insert(address.into(), value.into());
    }

    /// At least one value present
    pub fn is_valid(&self) -> bool {
        !self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, PlcValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<S: Into<String>> FromIterator<(S, PlcValue)> for RawSnapshot {
    fn from_iter<T: IntoIterator<Item = (S, PlcValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// A decoded enumerated field: the raw code plus its label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValue {
    pub code: i64,
    pub label: String,
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_null_reads_are_dropped() {
        let snapshot = RawSnapshot::from_reads(vec![
            ("DB101,B0".to_string(), Some(PlcValue::Int(1))),
            ("DB101,W10".to_string(), None),
        ]);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.is_valid());
        assert_eq!(snapshot.get("DB101,W10"), None);
    }

    #[test]
    fn test_all_null_snapshot_is_invalid() {
        let snapshot = RawSnapshot::from_reads(vec![("DB101,B0".to_string(), None)]);
        assert!(!snapshot.is_valid());
    }

    #[test]
    fn test_value_coercions() {
        assert!(PlcValue::Int(3).as_bool());
        assert!(!PlcValue::Int(0).as_bool());
        assert_eq!(PlcValue::Bool(true).as_i64(), 1);
    }

    #[test]
    fn test_untagged_json() {
        let snapshot: RawSnapshot = vec![
            ("DB101,X0.0", PlcValue::Bool(true)),
            ("DB101,B0", PlcValue::Int(2)),
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(json, r#"{"values":{"DB101,B0":2,"DB101,X0.0":true}}"#);
    }
}
