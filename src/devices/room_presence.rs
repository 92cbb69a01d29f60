//! Room presence beacon
//!
//! Every RSSI update is forwarded (not retained) to `room_presence/<room>`
//! with an estimated distance, for room-assistant style consumers.

use crate::devices::context::DeviceContext;
use crate::devices::{parse_options, Device, SharedDevice};
use crate::domain::error::Result;
use crate::domain::models::DeviceProperties;
use crate::domain::settings::ComponentConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Assumed 1 m RSSI when the beacon does not advertise a TX power
pub const DEFAULT_TX_POWER: i64 = -59;

#[derive(Debug, Clone, Deserialize)]
struct Options {
    room: String,
}

#[derive(Debug, Serialize)]
struct PresenceReport<'a> {
    id: &'a str,
    name: &'a str,
    rssi: i64,
    uuid: &'a str,
    distance: f64,
}

/// Log-distance estimate used by room-assistant
pub fn calculate_distance(rssi: i64, tx_power: Option<i64>) -> f64 {
    let tx_power = tx_power.unwrap_or(DEFAULT_TX_POWER);
    if rssi == 0 {
        return -1.0;
    }

    let ratio = rssi as f64 / tx_power as f64;
    if ratio < 1.0 {
        ratio.powi(10)
    } else {
        0.89976 * ratio.powf(7.7095) + 0.111
    }
}

pub struct RoomPresenceBeaconDevice {
    ctx: DeviceContext,
    topic: String,
}

impl RoomPresenceBeaconDevice {
    pub fn create(config: &ComponentConfig, ctx: DeviceContext) -> Result<SharedDevice> {
        let options: Options = parse_options(config)?;
        Ok(Arc::new(Self {
            ctx,
            topic: format!("room_presence/{}", options.room),
        }))
    }
}

#[async_trait]
impl Device for RoomPresenceBeaconDevice {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn on_advertisement(&self, device: &str, properties: &DeviceProperties) {
        if !self.ctx.owns(device) {
            return;
        }
        let Some(rssi) = properties.rssi() else {
            return;
        };

        let report = PresenceReport {
            id: &self.ctx.id,
            name: &self.ctx.friendly_name,
            rssi,
            uuid: &self.ctx.id,
            distance: calculate_distance(rssi, properties.tx_power()),
        };

        let payload = match serde_json::to_string(&report) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode presence of {}: {}", self.ctx.friendly_name, e);
                return;
            }
        };
        if let Err(e) = self.ctx.transport.publish(&self.topic, payload, false).await {
            warn!("Failed to publish presence of {}: {}", self.ctx.friendly_name, e);
        }
    }

    async fn destroy(&self) {}
}
