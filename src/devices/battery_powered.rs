//! Any peripheral exposing the standard battery service
//!
//! Polls `org.bluez.Battery1.Percentage`, which the daemon only populates
//! while connected.

use crate::devices::context::{ConnectPolicy, DeviceContext};
use crate::devices::polling::{PollScheduler, PollingOptions};
use crate::devices::topics::{DiscoveryEntry, TopicHandler};
use crate::devices::{parse_options, Device, SharedDevice};
use crate::domain::error::{BridgeError, Result};
use crate::domain::models::DeviceProperties;
use crate::domain::settings::ComponentConfig;
use crate::infrastructure::bluez::BATTERY_INTERFACE;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TOPIC_PREFIX: &str = "battery_powered_ble_device";

fn default_max_delay_after_connect() -> u64 {
    5000
}

fn default_connect_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Options {
    #[serde(flatten)]
    polling: PollingOptions,
    #[serde(default)]
    disconnect_after_fetch: bool,
    #[serde(default = "default_max_delay_after_connect")]
    max_delay_after_connect: u64,
    #[serde(default = "default_connect_attempts")]
    connect_attempts: u32,
}

struct Inner {
    ctx: DeviceContext,
    topics: TopicHandler,
    scheduler: PollScheduler,
    policy: ConnectPolicy,
    disconnect_after_fetch: bool,
}

impl Inner {
    fn queue_polling(self: &Arc<Self>) {
        let inner = self.clone();
        self.scheduler.schedule(move || async move {
            if let Err(e) = inner.poll().await {
                warn!("Polling battery of {} failed: {}", inner.ctx.friendly_name, e);
            }
            inner.queue_polling();
        });
    }

    async fn poll(&self) -> Result<()> {
        match self.ctx.connect(&self.policy).await {
            Ok(_) => {}
            Err(BridgeError::DeviceUnavailable(_)) => {
                debug!("{} is out of range", self.ctx.friendly_name);
                return Ok(());
            }
            Err(e) => {
                self.finish().await;
                return Err(e);
            }
        }

        let result = self.fetch().await;
        self.finish().await;
        result
    }

    async fn fetch(&self) -> Result<()> {
        let percentage = self
            .ctx
            .bus
            .get_property(&self.ctx.device_path, BATTERY_INTERFACE, "Percentage")
            .await?
            .as_i64()
            .ok_or_else(|| BridgeError::Protocol("Percentage is not a number".to_string()))?;

        info!("Battery of {} at {}%", self.ctx.friendly_name, percentage);
        self.topics.publish_raw_state(percentage.to_string()).await?;
        Ok(())
    }

    async fn finish(&self) {
        if self.disconnect_after_fetch {
            self.ctx.disconnect_quietly().await;
        }
    }
}

pub struct BatteryPoweredDevice {
    inner: Arc<Inner>,
}

impl BatteryPoweredDevice {
    pub fn create(config: &ComponentConfig, ctx: DeviceContext) -> Result<SharedDevice> {
        Ok(Arc::new(Self::new(config, ctx)?))
    }

    fn new(config: &ComponentConfig, ctx: DeviceContext) -> Result<Self> {
        let options: Options = parse_options(config)?;
        let topics = TopicHandler::new(&ctx, TOPIC_PREFIX);
        Ok(Self {
            inner: Arc::new(Inner {
                ctx,
                topics,
                scheduler: options.polling.scheduler(),
                policy: ConnectPolicy::new(
                    options.connect_attempts,
                    1000,
                    options.max_delay_after_connect,
                ),
                disconnect_after_fetch: options.disconnect_after_fetch,
            }),
        })
    }
}

#[async_trait]
impl Device for BatteryPoweredDevice {
    async fn initialize(&self) -> Result<()> {
        let ctx = &self.inner.ctx;
        let topics = &self.inner.topics;
        let discovery = DiscoveryEntry {
            topic: topics.discovery_topic("sensor", &format!("bat_{}", ctx.id)),
            payload: json!({
                "state_topic": topics.state_topic(),
                "name": format!("{} Battery", ctx.friendly_name),
                "unique_id": format!("cybele_bat_{}", ctx.id),
                "platform": "mqtt",
                "unit_of_measurement": "%",
                "device_class": "battery",
            }),
        };
        topics.initialize(&[discovery]).await?;
        self.inner.queue_polling();
        Ok(())
    }

    async fn on_advertisement(&self, _device: &str, _properties: &DeviceProperties) {}

    async fn destroy(&self) {
        self.inner.scheduler.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::BusValue;
    use crate::infrastructure::bluez::DEVICE_INTERFACE;
    use crate::testing::{device_context, FakeBus, FakeTransport};
    use std::time::Duration;

    fn config(disconnect_after_fetch: bool) -> ComponentConfig {
        ComponentConfig {
            kind: "BatteryPoweredDevice".into(),
            fields: json!({
                "pollingInterval": 600000,
                "pollOnStartup": true,
                "disconnectAfterFetch": disconnect_after_fetch,
            })
            .as_object()
            .unwrap()
            .clone(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_publishes_percentage_and_disconnects() {
        let bus = Arc::new(FakeBus::new());
        let transport = Arc::new(FakeTransport::new());
        let ctx = device_context(bus.clone(), transport.clone(), "Remote", "E0:E5:CF:00:00:01");
        let path = ctx.device_path.clone();
        bus.add_device(&path);
        bus.set_property(&path, DEVICE_INTERFACE, "ServicesResolved", BusValue::Bool(true));
        bus.set_property(&path, BATTERY_INTERFACE, "Percentage", BusValue::Byte(87));

        let device = BatteryPoweredDevice::create(&config(true), ctx).unwrap();
        device.initialize().await.unwrap();
        assert_eq!(
            transport.published_to("homeassistant/sensor/bat_e0e5cf000001/config").len(),
            1
        );

        tokio::time::sleep(Duration::from_millis(1100)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let state = transport.published_to("cybele/battery_powered_ble_device/e0e5cf000001/state");
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].payload, "87");
        assert_eq!(bus.calls_to("Connect").len(), 1);
        assert_eq!(bus.calls_to("Disconnect").len(), 1);

        device.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_device_is_skipped_and_polling_continues() {
        let bus = Arc::new(FakeBus::new());
        let transport = Arc::new(FakeTransport::new());
        let ctx = device_context(bus.clone(), transport.clone(), "Remote", "E0:E5:CF:00:00:01");

        let device = BatteryPoweredDevice::new(&config(false), ctx).unwrap();
        device.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(bus.calls_to("Connect").is_empty());
        assert!(bus.calls_to("Disconnect").is_empty());
        assert!(device.inner.scheduler.has_pending());
        device.destroy().await;
        assert!(!device.inner.scheduler.has_pending());
    }
}
