//! Xiaomi MiFlora plant sensor
//!
//! Polling: connect, switch to live mode, read battery/firmware, let the
//! connection LED settle and read the sensor block.

use crate::devices::context::{ConnectPolicy, DeviceContext};
use crate::devices::polling::{PollScheduler, PollingOptions};
use crate::devices::topics::{DiscoveryEntry, TopicHandler};
use crate::devices::{parse_options, u16_le, u32_le, Device, SharedDevice};
use crate::domain::error::{BridgeError, Result};
use crate::domain::models::{DeviceProperties, WriteMode};
use crate::domain::settings::ComponentConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEVICE_MODE_UUID: &str = "00001a00-0000-1000-8000-00805f9b34fb";
pub const SENSOR_DATA_UUID: &str = "00001a01-0000-1000-8000-00805f9b34fb";
pub const FIRMWARE_UUID: &str = "00001a02-0000-1000-8000-00805f9b34fb";

pub const LIVE_MODE_COMMAND: [u8; 2] = [0xa0, 0x1f];
const TOPIC_PREFIX: &str = "miflora";

/// The blinking LED after connecting skews the first readings
const SETTLE_DELAY: Duration = Duration::from_secs(5);

fn default_connect_attempts() -> u32 {
    5
}

fn default_max_delay_after_connect() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Options {
    #[serde(flatten)]
    polling: PollingOptions,
    #[serde(default = "default_connect_attempts")]
    connect_attempts: u32,
    #[serde(default = "default_max_delay_after_connect")]
    max_delay_after_connect: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub battery: u8,
    pub version: String,
}

pub fn parse_firmware(data: &[u8]) -> Option<FirmwareInfo> {
    if data.len() != 7 {
        return None;
    }
    Some(FirmwareInfo {
        battery: data[0],
        version: String::from_utf8_lossy(&data[2..]).into_owned(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub temperature: f64,
    pub illuminance: u32,
    pub moisture: u8,
    pub conductivity: u16,
}

/// Returns `None` for the garbage blocks some units emit (temperature >= 200)
pub fn parse_sensor_data(data: &[u8]) -> Option<SensorReading> {
    if data.len() != 16 {
        return None;
    }
    let temperature = f64::from(u16_le(data, 0)?) / 10.0;
    if temperature >= 200.0 {
        return None;
    }
    Some(SensorReading {
        temperature,
        illuminance: u32_le(data, 3)?,
        moisture: data[7],
        conductivity: u16_le(data, 8)?,
    })
}

#[derive(Debug, Serialize)]
struct State {
    battery: u8,
    temperature: f64,
    illuminance: u32,
    moisture: u8,
    conductivity: u16,
}

#[derive(Debug, Serialize)]
struct Attributes<'a> {
    firmware: &'a str,
}

struct Inner {
    ctx: DeviceContext,
    topics: TopicHandler,
    scheduler: PollScheduler,
    policy: ConnectPolicy,
}

impl Inner {
    fn queue_polling(self: &Arc<Self>) {
        let inner = self.clone();
        self.scheduler.schedule(move || async move {
            if let Err(e) = inner.poll().await {
                warn!("Polling {} failed: {}", inner.ctx.friendly_name, e);
            }
            inner.queue_polling();
        });
    }

    async fn poll(&self) -> Result<()> {
        let gatt = match self.ctx.connect(&self.policy).await {
            Ok(gatt) => gatt,
            Err(BridgeError::DeviceUnavailable(_)) => {
                debug!("{} is out of range", self.ctx.friendly_name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.ctx
            .write(gatt.require(DEVICE_MODE_UUID)?, &LIVE_MODE_COMMAND, WriteMode::Request)
            .await?;

        let firmware_raw = self.ctx.read(gatt.require(FIRMWARE_UUID)?).await?;
        let firmware = parse_firmware(&firmware_raw).ok_or_else(|| {
            BridgeError::Protocol(format!("invalid firmware block {:?}", firmware_raw))
        })?;

        tokio::time::sleep(SETTLE_DELAY).await;

        let data = self.ctx.read(gatt.require(SENSOR_DATA_UUID)?).await?;
        let Some(reading) = parse_sensor_data(&data) else {
            info!(
                "Got invalid sensor data from {}: {:?}",
                self.ctx.friendly_name, data
            );
            return Ok(());
        };

        let state = State {
            battery: firmware.battery,
            temperature: reading.temperature,
            illuminance: reading.illuminance,
            moisture: reading.moisture,
            conductivity: reading.conductivity,
        };
        self.topics.publish_state(&state).await?;
        self.topics
            .publish_attributes(&Attributes {
                firmware: &firmware.version,
            })
            .await?;
        Ok(())
    }
}

pub struct MiFloraDevice {
    inner: Arc<Inner>,
}

impl MiFloraDevice {
    pub fn create(config: &ComponentConfig, ctx: DeviceContext) -> Result<SharedDevice> {
        let options: Options = parse_options(config)?;
        let topics = TopicHandler::new(&ctx, TOPIC_PREFIX);
        Ok(Arc::new(Self {
            inner: Arc::new(Inner {
                ctx,
                topics,
                scheduler: options.polling.scheduler(),
                policy: ConnectPolicy::new(
                    options.connect_attempts,
                    1000,
                    options.max_delay_after_connect,
                ),
            }),
        }))
    }

    fn discovery(&self) -> Vec<DiscoveryEntry> {
        let ctx = &self.inner.ctx;
        let topics = &self.inner.topics;
        let sensors = [
            ("battery", "Battery", Some("battery"), "%"),
            ("temperature", "Temperature", Some("temperature"), "°C"),
            ("illuminance", "Illuminance", Some("illuminance"), "lux"),
            ("moisture", "Moisture", Some("humidity"), "%"),
            ("conductivity", "Conductivity", None, "µS/cm"),
        ];

        sensors
            .iter()
            .map(|(field, label, class, unit)| {
                let mut payload = json!({
                    "state_topic": topics.state_topic(),
                    "json_attributes_topic": topics.attributes_topic(),
                    "name": format!("{} {}", ctx.friendly_name, label),
                    "unique_id": format!("cybele_miflora_{}_{}", ctx.id, field),
                    "unit_of_measurement": unit,
                    "value_template": format!("{{{{ value_json.{} }}}}", field),
                });
                if let Some(class) = class {
                    payload["device_class"] = json!(class);
                }
                DiscoveryEntry {
                    topic: topics.discovery_topic(
                        "sensor",
                        &format!("miflora_{}/{}_{}", ctx.id, ctx.id, field),
                    ),
                    payload,
                }
            })
            .collect()
    }
}

#[async_trait]
impl Device for MiFloraDevice {
    async fn initialize(&self) -> Result<()> {
        self.inner.topics.initialize(&self.discovery()).await?;
        self.inner.queue_polling();
        Ok(())
    }

    async fn on_advertisement(&self, _device: &str, _properties: &DeviceProperties) {}

    async fn destroy(&self) {
        self.inner.scheduler.destroy();
    }
}
