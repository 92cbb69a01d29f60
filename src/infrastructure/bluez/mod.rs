//! BlueZ Module
//!
//! Everything that talks to the Bluetooth management daemon goes through the
//! [`BluetoothBus`] trait. One instance is created at process start and handed
//! down to the fleet, every adapter supervisor and every device.
//!
//! ## Modules
//!
//! - [`props`] - Flattening of property-change payloads into [`DeviceProperties`]
//! - [`gatt`] - GATT tree walk that maps characteristic UUIDs to object paths
//! - [`dbus`] - zbus backed implementation of the bus
//! - [`application`] - Locally hosted GATT applications exported on the bus
//!
//! [`DeviceProperties`]: crate::domain::models::DeviceProperties

pub mod application;
pub mod dbus;
pub mod gatt;
pub mod props;

use crate::domain::error::BusError;
use crate::domain::models::{BusMessage, BusValue, DiscoveryFilter, WriteMode};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use application::{GattApplication, GattCharacteristicDef, GattServiceDef};
pub use dbus::DbusBluetoothBus;
pub use gatt::GattMap;

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const BLUEZ_ROOT: &str = "/org/bluez";
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const BATTERY_INTERFACE: &str = "org.bluez.Battery1";
pub const GATT_CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub const GATT_MANAGER_INTERFACE: &str = "org.bluez.GattManager1";

/// Stream of signals scoped to one adapter, delivered in arrival order.
///
/// Dropping the subscription unsubscribes.
pub type BusSubscription = mpsc::Receiver<BusMessage>;

/// Operations offered by the Bluetooth management daemon
#[async_trait]
pub trait BluetoothBus: Send + Sync {
    // Adapter

    async fn stop_discovery(&self, adapter_path: &str) -> Result<(), BusError>;

    async fn set_discovery_filter(
        &self,
        adapter_path: &str,
        filter: &DiscoveryFilter,
    ) -> Result<(), BusError>;

    async fn start_discovery(&self, adapter_path: &str) -> Result<(), BusError>;

    /// Whether the adapter interface currently exists on the bus
    async fn adapter_present(&self, adapter_path: &str) -> bool;

    async fn register_application(
        &self,
        adapter_path: &str,
        application: &GattApplication,
    ) -> Result<(), BusError>;

    /// Unregister from the adapter and take the application off the bus
    async fn unregister_application(
        &self,
        adapter_path: &str,
        application: &GattApplication,
    ) -> Result<(), BusError>;

    /// Subscribe to every property-change signal below `adapter_path`
    async fn subscribe(&self, adapter_path: &str) -> Result<BusSubscription, BusError>;

    // Device

    /// Whether the daemon knows the device (it is gone when out of range)
    async fn device_present(&self, device_path: &str) -> bool;

    async fn connect(&self, device_path: &str) -> Result<(), BusError>;

    async fn disconnect(&self, device_path: &str) -> Result<(), BusError>;

    async fn get_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<BusValue, BusError>;

    /// Names of the child nodes of an object path, from its introspection XML
    async fn introspect(&self, path: &str) -> Result<Vec<String>, BusError>;

    // Characteristic

    async fn read_value(&self, characteristic_path: &str) -> Result<Vec<u8>, BusError>;

    async fn write_value(
        &self,
        characteristic_path: &str,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BusError>;

    async fn start_notify(&self, characteristic_path: &str) -> Result<(), BusError>;

    async fn stop_notify(&self, characteristic_path: &str) -> Result<(), BusError>;
}

pub type SharedBus = Arc<dyn BluetoothBus>;

/// `/org/bluez/hci0`
pub fn adapter_path(hci_device: &str) -> String {
    format!("{}/{}", BLUEZ_ROOT, hci_device)
}

/// `AA:BB:CC:DD:EE:FF` -> `dev_AA_BB_CC_DD_EE_FF`
pub fn device_node_name(mac: &str) -> String {
    let upper: Vec<String> = mac.split(':').map(|part| part.to_uppercase()).collect();
    format!("dev_{}", upper.join("_"))
}

/// Read a boolean property, treating anything else as an unexpected reply
pub async fn get_bool_property(
    bus: &dyn BluetoothBus,
    path: &str,
    interface: &str,
    name: &str,
) -> Result<bool, BusError> {
    let value = bus.get_property(path, interface, name).await?;
    value.as_bool().ok_or_else(|| BusError::UnexpectedReply {
        path: path.to_string(),
        detail: format!("{}.{} is not a boolean: {:?}", interface, name, value),
    })
}
