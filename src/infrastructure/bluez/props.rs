//! Property payload decoding
//!
//! PropertiesChanged bodies arrive as `[interface, bag, ...]` where the bag is a
//! dict (or an array of `(key, value)` tuples, depending on how the daemon and
//! the bus library wrap it) of variant-wrapped values. This module is the only
//! place that knows about those shapes.

use crate::domain::models::{
    BusMessage, BusValue, CharacteristicNotification, DeviceProperties, ManufacturerData,
    PropValue, ServiceData,
};
use crate::infrastructure::bluez::{
    ADAPTER_INTERFACE, DEVICE_INTERFACE, GATT_CHARACTERISTIC_INTERFACE,
};
use tracing::{debug, warn};

/// A bus signal classified for one adapter
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Advertisement or property change of a device (`dev_XX_XX_...`)
    Device {
        device: String,
        properties: DeviceProperties,
    },
    /// New value of a subscribed characteristic
    Characteristic {
        device: String,
        notification: CharacteristicNotification,
    },
    /// Property change of the adapter itself
    Adapter { properties: DeviceProperties },
}

impl BusEvent {
    /// The adapter reported `Powered = false`
    pub fn is_power_loss(&self) -> bool {
        match self {
            Self::Adapter { properties } => properties.bool("Powered") == Some(false),
            _ => false,
        }
    }
}

/// Classify a message for the adapter at `adapter_path`.
///
/// Returns `None` for messages outside the adapter or of no interest.
pub fn classify(message: &BusMessage, adapter_path: &str) -> Option<BusEvent> {
    let relative = if message.path == adapter_path {
        ""
    } else {
        message.path.strip_prefix(adapter_path)?.strip_prefix('/')?
    };

    let items = match &message.body {
        BusValue::Array(items) | BusValue::Struct(items) => items,
        other => {
            debug!("Ignoring signal on {} with body {:?}", message.path, other);
            return None;
        }
    };

    let interface = items.first().and_then(BusValue::as_str)?;
    let bag = items.get(1);

    match interface {
        DEVICE_INTERFACE => {
            let device = message.path.rsplit('/').next()?.to_string();
            let properties = match bag {
                Some(bag) => decode_properties(bag),
                None => {
                    warn!("Device signal on {} without property bag", message.path);
                    DeviceProperties::new()
                }
            };
            Some(BusEvent::Device { device, properties })
        }
        GATT_CHARACTERISTIC_INTERFACE => {
            let segments: Vec<&str> = relative.split('/').collect();
            if segments.len() < 3 {
                warn!("Malformed characteristic path {}", message.path);
                return None;
            }
            let properties = decode_properties(bag?);
            match properties.get("Value") {
                Some(PropValue::Bytes(value)) => Some(BusEvent::Characteristic {
                    device: segments[0].to_string(),
                    notification: CharacteristicNotification {
                        handle: format!("{}/{}", segments[1], segments[2]),
                        value: value.clone(),
                    },
                }),
                _ => None,
            }
        }
        ADAPTER_INTERFACE if relative.is_empty() => Some(BusEvent::Adapter {
            properties: bag.map(decode_properties).unwrap_or_default(),
        }),
        other => {
            debug!("Ignoring {} signal on {}", other, message.path);
            None
        }
    }
}

/// Flatten a property bag into a key/value map.
///
/// Malformed entries are logged and skipped; this never fails.
pub fn decode_properties(bag: &BusValue) -> DeviceProperties {
    let mut properties = DeviceProperties::new();

    match bag.unwrap_variant() {
        BusValue::Dict(entries) => {
            for (key, value) in entries {
                match key.as_str() {
                    Some(key) => insert_property(&mut properties, key, value),
                    None => warn!("Skipping property with non-string key {:?}", key),
                }
            }
        }
        BusValue::Array(entries) => {
            for entry in entries {
                match entry {
                    BusValue::Struct(pair) | BusValue::Array(pair) if pair.len() == 2 => {
                        match pair[0].as_str() {
                            Some(key) => insert_property(&mut properties, key, &pair[1]),
                            None => warn!("Skipping property with non-string key {:?}", pair[0]),
                        }
                    }
                    other => warn!("Skipping non-tuple property entry {:?}", other),
                }
            }
        }
        other => warn!("Property bag is not a collection: {:?}", other),
    }

    properties
}

fn insert_property(properties: &mut DeviceProperties, key: &str, value: &BusValue) {
    let decoded = match key {
        "ManufacturerData" => decode_manufacturer_data(value).map(PropValue::Manufacturer),
        "ServiceData" => decode_service_data(value).map(PropValue::Service),
        _ => Some(to_prop_value(value)),
    };

    match decoded {
        Some(decoded) => properties.insert(key, decoded),
        None => warn!("Treating malformed {} as absent: {:?}", key, value),
    }
}

fn to_prop_value(value: &BusValue) -> PropValue {
    match value.unwrap_variant() {
        BusValue::Bool(b) => PropValue::Bool(*b),
        BusValue::F64(f) => PropValue::Float(*f),
        BusValue::Str(s) | BusValue::ObjectPath(s) => PropValue::Str(s.clone()),
        BusValue::Bytes(data) => PropValue::Bytes(data.clone()),
        array @ BusValue::Array(items) => {
            if let Some(bytes) = array.as_bytes() {
                PropValue::Bytes(bytes)
            } else if items.len() == 1 {
                to_prop_value(&items[0])
            } else {
                PropValue::List(items.iter().map(to_prop_value).collect())
            }
        }
        other => match other.as_i64() {
            Some(int) => PropValue::Int(int),
            None => PropValue::Raw(other.clone()),
        },
    }
}

/// First entry of an `a{qv}` (or array of `(q, v)` tuples)
fn decode_manufacturer_data(value: &BusValue) -> Option<ManufacturerData> {
    let (key, data) = first_entry(value)?;
    let company_id = u16::try_from(key.as_i64()?).ok()?;
    Some(ManufacturerData {
        company_id,
        data: data.as_bytes()?,
    })
}

/// First entry of an `a{sv}` (or array of `(s, v)` tuples)
fn decode_service_data(value: &BusValue) -> Option<ServiceData> {
    let (key, data) = first_entry(value)?;
    Some(ServiceData {
        uuid: key.as_str()?.to_lowercase(),
        data: data.as_bytes()?,
    })
}

fn first_entry(value: &BusValue) -> Option<(&BusValue, &BusValue)> {
    match value.unwrap_variant() {
        BusValue::Dict(entries) => entries.first().map(|(k, v)| (k, v)),
        BusValue::Array(entries) => match entries.first()? {
            BusValue::Struct(pair) | BusValue::Array(pair) if pair.len() == 2 => {
                Some((&pair[0], &pair[1]))
            }
            _ => None,
        },
        _ => None,
    }
}
