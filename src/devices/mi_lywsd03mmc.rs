//! Xiaomi LYWSD03MMC thermometer running the ATC custom firmware
//!
//! Passive: readings are broadcast as environmental sensing service data.

use crate::devices::context::DeviceContext;
use crate::devices::topics::{DiscoveryEntry, TopicHandler};
use crate::devices::{u16_be, Device, SharedDevice};
use crate::domain::error::Result;
use crate::domain::models::DeviceProperties;
use crate::domain::settings::ComponentConfig;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

pub const ENVIRONMENTAL_SENSING_UUID: &str = "0000181a-0000-1000-8000-00805f9b34fb";
const TOPIC_PREFIX: &str = "MiLYWSD03MMC";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub tempc: f64,
    pub hum: u8,
    pub batt: u8,
    pub volt: f64,
}

/// `[mac(6)] [temp BE u16 /10] [hum] [batt] [mV BE u16] ...`
pub fn parse_service_data(data: &[u8]) -> Option<Reading> {
    Some(Reading {
        tempc: f64::from(u16_be(data, 6)?) / 10.0,
        hum: *data.get(8)?,
        batt: *data.get(9)?,
        volt: f64::from(u16_be(data, 10)?) / 1000.0,
    })
}

pub struct MiLywsd03MmcDevice {
    ctx: DeviceContext,
    topics: TopicHandler,
}

impl MiLywsd03MmcDevice {
    pub fn create(_config: &ComponentConfig, ctx: DeviceContext) -> Result<SharedDevice> {
        let topics = TopicHandler::new(&ctx, TOPIC_PREFIX);
        Ok(Arc::new(Self { ctx, topics }))
    }

    fn discovery(&self) -> Vec<DiscoveryEntry> {
        let id = &self.ctx.id;
        let name = &self.ctx.friendly_name;
        let sensors = [
            ("tem", "Temperature", "temperature", "°C", "tempc", "temp"),
            ("hum", "Humidity", "humidity", "%", "hum", "hum"),
            ("bat", "Battery percent", "battery", "%", "batt", "bat"),
            ("batv", "Battery Volt", "voltage", "V", "volt", "batv"),
        ];

        sensors
            .iter()
            .map(|(suffix, label, class, unit, field, unique)| DiscoveryEntry {
                topic: self
                    .topics
                    .discovery_topic("sensor", &format!("{}/{}_{}", TOPIC_PREFIX, id, suffix)),
                payload: json!({
                    "state_topic": self.topics.state_topic(),
                    "name": format!("{} {}", name, label),
                    "unique_id": format!("cybele_{}_{}", unique, id),
                    "platform": "mqtt",
                    "unit_of_measurement": unit,
                    "device_class": class,
                    "value_template": format!("{{{{ value_json.{} }}}}", field),
                }),
            })
            .collect()
    }
}

#[async_trait]
impl Device for MiLywsd03MmcDevice {
    async fn initialize(&self) -> Result<()> {
        self.topics.initialize(&self.discovery()).await
    }

    async fn on_advertisement(&self, device: &str, properties: &DeviceProperties) {
        if !self.ctx.owns(device) {
            return;
        }
        let Some(service_data) = properties.service_data() else {
            return;
        };
        if service_data.uuid != ENVIRONMENTAL_SENSING_UUID {
            return;
        }

        match parse_service_data(&service_data.data) {
            Some(reading) => {
                if let Err(e) = self.topics.publish_state(&reading).await {
                    warn!("Failed to publish state of {}: {}", self.ctx.friendly_name, e);
                }
            }
            None => warn!(
                "Short service data from {}: {:?}",
                self.ctx.friendly_name, service_data.data
            ),
        }
    }

    async fn destroy(&self) {}
}
