//! Devices Module
//!
//! One [`Device`] per configured peripheral. The adapter fans every decoded
//! bus event out to all of its devices; each device decides from the device
//! node name whether the event is its own.
//!
//! ## Modules
//!
//! - [`context`] - Identity, injected dependencies and the connect protocol
//! - [`topics`] - Per-device topic set with change suppression
//! - [`polling`] - Self-rescheduling poll timer
//! - one module per device protocol

pub mod battery_powered;
pub mod body_scale;
pub mod context;
pub mod eqiva;
pub mod mi_kettle;
pub mod mi_lywsd03mmc;
pub mod miflora;
pub mod oralb;
pub mod polling;
pub mod room_presence;
pub mod topics;

use crate::domain::error::Result;
use crate::domain::models::{CharacteristicNotification, DeviceProperties};
use crate::domain::settings::ComponentConfig;
use async_trait::async_trait;
use context::DeviceContext;
use std::sync::Arc;

/// Capability interface of a device protocol handler.
///
/// Event hooks must return quickly; multi-step radio sequences are spawned.
#[async_trait]
pub trait Device: Send + Sync {
    /// One-time registration (discovery documents, command subscriptions, first poll)
    async fn initialize(&self) -> Result<()>;

    /// Changed advertisement/property data of device node `device`
    async fn on_advertisement(&self, device: &str, properties: &DeviceProperties);

    /// New value of a subscribed characteristic of device node `device`
    async fn on_notification(&self, _device: &str, _notification: &CharacteristicNotification) {}

    /// A message on any subscribed topic
    async fn on_control_message(&self, _topic: &str, _payload: &str) {}

    /// Cancel timers and release the radio. Never fails; problems are logged.
    async fn destroy(&self);
}

pub type SharedDevice = Arc<dyn Device>;

/// Builds a device from its config entry and context
pub type DeviceConstructor = fn(&ComponentConfig, DeviceContext) -> Result<SharedDevice>;

/// Registry of device types by their `type` string
pub fn constructor_for(kind: &str) -> Option<DeviceConstructor> {
    let constructor: DeviceConstructor = match kind {
        "MiLYWSD03MMCDevice" => mi_lywsd03mmc::MiLywsd03MmcDevice::create,
        "RoomPresenceBeaconDevice" => room_presence::RoomPresenceBeaconDevice::create,
        "OralBToothbrushDevice" => oralb::OralBToothbrushDevice::create,
        "MiBodyScaleDevice" => body_scale::MiBodyScaleDevice::create,
        "BatteryPoweredDevice" => battery_powered::BatteryPoweredDevice::create,
        "MiFloraDevice" => miflora::MiFloraDevice::create,
        "EqivaThermostatDevice" => eqiva::EqivaThermostatDevice::create,
        "MiKettleDevice" => mi_kettle::MiKettleDevice::create,
        _ => return None,
    };
    Some(constructor)
}

/// Parse a variant's option struct, mapping serde failures to a config error
pub(crate) fn parse_options<T: serde::de::DeserializeOwned>(
    config: &ComponentConfig,
) -> Result<T> {
    config.options().map_err(|e| {
        crate::domain::error::BridgeError::InvalidConfig(format!("{}: {}", config.kind, e))
    })
}

/// Little helper for the many `ReadUInt16LE` style decodes
pub(crate) fn u16_le(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*data.get(offset)?, *data.get(offset + 1)?]))
}

pub(crate) fn u16_be(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]))
}

pub(crate) fn u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_knows_every_type() {
        for kind in [
            "MiLYWSD03MMCDevice",
            "RoomPresenceBeaconDevice",
            "OralBToothbrushDevice",
            "MiBodyScaleDevice",
            "BatteryPoweredDevice",
            "MiFloraDevice",
            "EqivaThermostatDevice",
            "MiKettleDevice",
        ] {
            assert!(constructor_for(kind).is_some(), "{}", kind);
        }
        assert!(constructor_for("GlanceClockDevice").is_none());
    }

    #[test]
    fn test_byte_helpers() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05];
        assert_eq!(u16_le(&data, 0), Some(0x0201));
        assert_eq!(u16_be(&data, 0), Some(0x0102));
        assert_eq!(u32_le(&data, 1), Some(0x05040302));
        assert_eq!(u16_le(&data, 4), None);
        assert_eq!(u32_le(&data, 2), None);
    }
}
