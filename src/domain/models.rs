use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Transport filter handed to the adapter when discovery starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    #[default]
    Le,
    Bredr,
    Auto,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Le => "le",
            Self::Bredr => "bredr",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GATT write delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write with response
    Request,
    /// Write without response
    Command,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Command => "command",
        }
    }
}

/// Discovery filter applied before every discovery start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub transport: ScanMode,
    pub duplicate_data: bool,
}

/// Lifecycle of one adapter supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DongleState {
    Uninitialized,
    Discovering,
    Dead,
    Destroying,
    Destroyed,
}

/// Owned mirror of a D-Bus value as it arrives from the management daemon.
///
/// Signals are converted into this shape at the bus edge so that everything
/// downstream can be exercised without a running daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum BusValue {
    Bool(bool),
    Byte(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    ObjectPath(String),
    /// `ay`
    Bytes(Vec<u8>),
    Array(Vec<BusValue>),
    Struct(Vec<BusValue>),
    Dict(Vec<(BusValue, BusValue)>),
    Variant(Box<BusValue>),
    /// Anything without an owned mirror (file descriptors, signatures)
    Unsupported(String),
}

impl BusValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::ObjectPath(s) => Some(s),
            Self::Variant(inner) => inner.as_str(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Variant(inner) => inner.as_bool(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Byte(v) => Some(*v as i64),
            Self::I16(v) => Some(*v as i64),
            Self::U16(v) => Some(*v as i64),
            Self::I32(v) => Some(*v as i64),
            Self::U32(v) => Some(*v as i64),
            Self::I64(v) => Some(*v),
            Self::U64(v) => i64::try_from(*v).ok(),
            Self::Variant(inner) => inner.as_i64(),
            _ => None,
        }
    }

    /// Interpret a byte buffer, or a non-empty array of bytes, as a buffer
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(data) => Some(data.clone()),
            Self::Array(items) if !items.is_empty() => items
                .iter()
                .map(|item| match item {
                    Self::Byte(b) => Some(*b),
                    _ => None,
                })
                .collect(),
            Self::Variant(inner) => inner.as_bytes(),
            _ => None,
        }
    }

    /// Strip any number of variant wrappers
    pub fn unwrap_variant(&self) -> &BusValue {
        match self {
            Self::Variant(inner) => inner.unwrap_variant(),
            other => other,
        }
    }

    #[cfg(test)]
    pub fn bytes(data: &[u8]) -> Self {
        Self::Bytes(data.to_vec())
    }

    pub fn variant(value: BusValue) -> Self {
        Self::Variant(Box::new(value))
    }
}

/// One signal observed on the bus, scoped by object path
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub path: String,
    /// `[interfaceName, propertyBag, ...]`
    pub body: BusValue,
}

/// Manufacturer specific advertisement payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    pub company_id: u16,
    pub data: Vec<u8>,
}

/// Service data advertisement payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
    pub uuid: String,
    pub data: Vec<u8>,
}

/// A decoded property after flattening
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Manufacturer(ManufacturerData),
    Service(ServiceData),
    List(Vec<PropValue>),
    Raw(BusValue),
}

/// Flat key/value view of a device property-change event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceProperties {
    values: HashMap<String, PropValue>,
}

impl DeviceProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: PropValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(PropValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(PropValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn rssi(&self) -> Option<i64> {
        self.int("RSSI")
    }

    pub fn tx_power(&self) -> Option<i64> {
        self.int("TxPower")
    }

    pub fn connected(&self) -> Option<bool> {
        self.bool("Connected")
    }

    pub fn manufacturer_data(&self) -> Option<&ManufacturerData> {
        match self.values.get("ManufacturerData") {
            Some(PropValue::Manufacturer(md)) => Some(md),
            _ => None,
        }
    }

    pub fn service_data(&self) -> Option<&ServiceData> {
        match self.values.get("ServiceData") {
            Some(PropValue::Service(sd)) => Some(sd),
            _ => None,
        }
    }
}

/// A characteristic value change routed to devices.
///
/// `handle` is the `serviceXXXX/charYYYY` tail of the characteristic path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicNotification {
    pub handle: String,
    pub value: Vec<u8>,
}

/// Control payload after opportunistic JSON decoding
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPayload {
    Json(serde_json::Value),
    Raw(String),
}

impl ControlPayload {
    pub fn parse(payload: &str) -> Self {
        match serde_json::from_str(payload) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Raw(payload.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Json(value) => value.as_f64(),
            Self::Raw(text) => text.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(serde_json::Value::String(s)) => Some(s),
            Self::Json(_) => None,
            Self::Raw(text) => Some(text.trim()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Json(value) => value.as_bool(),
            Self::Raw(text) => text.trim().parse().ok(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => value.get(name),
            Self::Raw(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_payload_falls_back_to_raw() {
        assert_eq!(
            ControlPayload::parse("{\"mode\":\"boil\"}").field("mode"),
            Some(&serde_json::json!("boil"))
        );
        assert_eq!(
            ControlPayload::parse("heat"),
            ControlPayload::Raw("heat".to_string())
        );
        assert_eq!(ControlPayload::parse("21.5").as_f64(), Some(21.5));
    }

    #[test]
    fn test_bus_value_bytes() {
        let value = BusValue::variant(BusValue::bytes(&[1, 2, 3]));
        assert_eq!(value.as_bytes(), Some(vec![1, 2, 3]));
        assert_eq!(BusValue::Array(vec![BusValue::Str("x".into())]).as_bytes(), None);
        assert_eq!(BusValue::Array(vec![BusValue::Byte(7)]).as_bytes(), Some(vec![7]));

        // Only a typed buffer can be empty
        assert_eq!(BusValue::bytes(&[]).as_bytes(), Some(vec![]));
        assert_eq!(BusValue::Array(vec![]).as_bytes(), None);
    }
}
