use crate::domain::error::{BridgeError, BusError};
use crate::infrastructure::bluez::{BluetoothBus, GATT_CHARACTERISTIC_INTERFACE};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Location of one remote characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    /// Full object path, used for reads, writes and notify sessions
    pub path: String,
    /// `serviceXXXX/charYYYY`, matched against incoming notifications
    pub handle: String,
}

/// Characteristic UUID to object path mapping of one connected device
#[derive(Debug, Clone, Default)]
pub struct GattMap {
    characteristics: HashMap<String, CharacteristicRef>,
}

impl GattMap {
    /// Build the map from `(path, uuid)` pairs below `device_path`
    pub fn from_entries(device_path: &str, entries: Vec<(String, String)>) -> Self {
        let prefix = format!("{}/", device_path);
        let mut characteristics = HashMap::new();

        for (path, uuid) in entries {
            let Some(handle) = path.strip_prefix(&prefix) else {
                continue;
            };
            // Descriptors live one level deeper and are not characteristics
            if handle.split('/').count() != 2 {
                continue;
            }
            characteristics.insert(
                uuid.to_lowercase(),
                CharacteristicRef {
                    handle: handle.to_string(),
                    path: path.clone(),
                },
            );
        }

        Self { characteristics }
    }

    /// Walk the GATT tree of a connected, resolved device.
    ///
    /// Services are the `serviceXXXX` children of the device node and
    /// characteristics the `charYYYY` children of each service; the UUID of
    /// every characteristic is read from the bus.
    pub async fn discover(bus: &dyn BluetoothBus, device_path: &str) -> Result<Self, BusError> {
        let mut entries = Vec::new();

        for service in bus.introspect(device_path).await? {
            if !service.starts_with("service") {
                continue;
            }
            let service_path = format!("{}/{}", device_path, service);

            for characteristic in bus.introspect(&service_path).await? {
                if !characteristic.starts_with("char") {
                    continue;
                }
                let path = format!("{}/{}", service_path, characteristic);
                let uuid = bus
                    .get_property(&path, GATT_CHARACTERISTIC_INTERFACE, "UUID")
                    .await?;
                match uuid.as_str() {
                    Some(uuid) => entries.push((path, uuid.to_string())),
                    None => warn!("Characteristic {} has no UUID: {:?}", path, uuid),
                }
            }
        }

        let map = Self::from_entries(device_path, entries);
        if map.is_empty() {
            warn!("No characteristics found below {}", device_path);
        } else {
            debug!(
                "Found {} characteristics below {}",
                map.characteristics.len(),
                device_path
            );
        }
        Ok(map)
    }

    pub fn get(&self, uuid: &str) -> Option<&CharacteristicRef> {
        self.characteristics.get(&uuid.to_lowercase())
    }

    pub fn require(&self, uuid: &str) -> Result<&CharacteristicRef, BridgeError> {
        self.get(uuid)
            .ok_or_else(|| BridgeError::MissingCharacteristic(uuid.to_string()))
    }

    /// UUID of the characteristic behind a notification handle
    pub fn uuid_for_handle(&self, handle: &str) -> Option<&str> {
        self.characteristics
            .iter()
            .find(|(_, characteristic)| characteristic.handle == handle)
            .map(|(uuid, _)| uuid.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.characteristics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_skips_descriptors_and_foreign_paths() {
        let device = "/org/bluez/hci0/dev_AA_BB";
        let map = GattMap::from_entries(
            device,
            vec![
                (
                    format!("{}/service0021/char0035", device),
                    "EBE0CCC1-7A0A-4B0C-8A1A-6FF2997DA3A6".to_string(),
                ),
                (
                    format!("{}/service0021/char0035/desc0037", device),
                    "00002902-0000-1000-8000-00805f9b34fb".to_string(),
                ),
                (
                    "/org/bluez/hci0/dev_CC_DD/service0001/char0002".to_string(),
                    "00002a19-0000-1000-8000-00805f9b34fb".to_string(),
                ),
            ],
        );

        let characteristic = map.get("ebe0ccc1-7a0a-4b0c-8a1a-6ff2997da3a6").unwrap();
        assert_eq!(characteristic.handle, "service0021/char0035");
        assert!(map.get("00002902-0000-1000-8000-00805f9b34fb").is_none());
        assert!(map.get("00002a19-0000-1000-8000-00805f9b34fb").is_none());
        assert_eq!(
            map.uuid_for_handle("service0021/char0035"),
            Some("ebe0ccc1-7a0a-4b0c-8a1a-6ff2997da3a6")
        );
        assert!(matches!(
            map.require("missing"),
            Err(BridgeError::MissingCharacteristic(_))
        ));
    }
}
