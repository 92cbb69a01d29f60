//! Current Time Service (0x1805)
//!
//! Lets peripherals that sync their clock over BLE read the host's local time.

use crate::devices::context::DeviceDeps;
use crate::devices::parse_options;
use crate::domain::error::Result;
use crate::domain::settings::ComponentConfig;
use crate::infrastructure::bluez::{
    adapter_path, GattApplication, GattCharacteristicDef, GattServiceDef, SharedBus,
};
use crate::services::{Service, SharedService};
use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

pub const CURRENT_TIME_SERVICE_UUID: &str = "00001805-0000-1000-8000-00805f9b34fb";
pub const CURRENT_TIME_UUID: &str = "00002a2b-0000-1000-8000-00805f9b34fb";

fn default_service_name() -> String {
    "de.hypfer.cybele".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Options {
    #[serde(default = "default_service_name")]
    service_name: String,
}

/// Exact time 256 value: year, month, day, hours, minutes, seconds, day of
/// week (Sunday = 0), fractions of a second in 1/256 units, adjust reason
pub fn encode_current_time<T: Datelike + Timelike>(now: &T) -> Vec<u8> {
    let millis = (now.nanosecond() / 1_000_000).min(999);
    let year = now.year() as i16;

    let mut value = Vec::with_capacity(10);
    value.extend_from_slice(&year.to_le_bytes());
    value.extend_from_slice(&[
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
        now.weekday().num_days_from_sunday() as u8,
        (millis / 256) as u8,
        0,
    ]);
    value
}

pub struct CurrentTimeService {
    name: String,
    bus: SharedBus,
    adapter_path: String,
    application: GattApplication,
}

impl CurrentTimeService {
    pub fn create(config: &ComponentConfig, deps: &DeviceDeps) -> Result<SharedService> {
        let options: Options = parse_options(config)?;
        let path = format!(
            "{}/{}",
            GattApplication::path_for_name(&options.service_name),
            deps.hci_device
        );

        let characteristic = GattCharacteristicDef {
            name: "CURRENTTIME".to_string(),
            uuid: CURRENT_TIME_UUID.to_string(),
            flags: vec!["read".to_string()],
            reader: Arc::new(|| encode_current_time(&chrono::Local::now())),
        };

        Ok(Arc::new(Self {
            name: format!("CurrentTimeService on {}", deps.hci_device),
            bus: deps.bus.clone(),
            adapter_path: adapter_path(&deps.hci_device),
            application: GattApplication {
                bus_name: options.service_name,
                path,
                services: vec![GattServiceDef {
                    uuid: CURRENT_TIME_SERVICE_UUID.to_string(),
                    primary: true,
                    characteristics: vec![characteristic],
                }],
            },
        }))
    }
}

#[async_trait]
impl Service for CurrentTimeService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        self.bus
            .register_application(&self.adapter_path, &self.application)
            .await?;
        info!("Successfully registered {}", self.name);
        Ok(())
    }

    async fn destroy(&self) {
        if let Err(e) = self
            .bus
            .unregister_application(&self.adapter_path, &self.application)
            .await
        {
            error!("Failed to unregister {}: {}", self.name, e);
        }
    }
}
