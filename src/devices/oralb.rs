//! Oral-B smart toothbrush
//!
//! Passive: brushing state is broadcast in the manufacturer data.

use crate::devices::context::DeviceContext;
use crate::devices::topics::{DiscoveryEntry, TopicHandler};
use crate::devices::{Device, SharedDevice};
use crate::domain::error::Result;
use crate::domain::models::DeviceProperties;
use crate::domain::settings::ComponentConfig;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::warn;

const TOPIC_PREFIX: &str = "toothbrush";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrushData {
    pub state: u8,
    pub pressure: u8,
    /// Seconds of the running session
    pub time: u32,
    pub mode: u8,
    pub sector: u8,
}

pub fn parse_manufacturer_data(data: &[u8]) -> Option<BrushData> {
    if data.len() < 9 {
        return None;
    }
    Some(BrushData {
        state: data[3],
        pressure: data[4],
        time: u32::from(data[5]) * 60 + u32::from(data[6]),
        mode: data[7],
        sector: data[8],
    })
}

pub fn state_name(state: u8) -> &'static str {
    match state {
        1 => "initializing",
        2 => "idle",
        3 => "running",
        4 => "charging",
        5 => "setup",
        6 => "flight_menu",
        113 => "final_test",
        114 => "pcb_test",
        115 => "sleeping",
        116 => "transport",
        _ => "unknown",
    }
}

pub fn mode_name(mode: u8) -> &'static str {
    match mode {
        0 => "off",
        1 => "daily_clean",
        2 => "sensitive",
        3 => "massage",
        4 => "whitening",
        5 => "deep_clean",
        6 => "tongue_cleaning",
        7 => "turbo",
        _ => "unknown",
    }
}

pub fn sector_name(sector: u8) -> &'static str {
    match sector {
        1 => "sector_1",
        2 => "sector_2",
        3 => "sector_3",
        4 => "sector_4",
        5 => "sector_5",
        6 => "sector_6",
        7 => "sector_7",
        8 => "sector_8",
        15 => "unknown_1",
        31 => "unknown_2",
        23 => "unknown_3",
        47 => "unknown_4",
        55 => "unknown_5",
        254 => "last_sector",
        _ => "no_sector",
    }
}

#[derive(Debug, Serialize)]
struct Attributes {
    rssi: Option<i64>,
    pressure: u8,
    time: u32,
    mode: &'static str,
    sector: &'static str,
}

pub struct OralBToothbrushDevice {
    ctx: DeviceContext,
    topics: TopicHandler,
    present: Mutex<Option<bool>>,
}

impl OralBToothbrushDevice {
    pub fn create(_config: &ComponentConfig, ctx: DeviceContext) -> Result<SharedDevice> {
        let topics = TopicHandler::new(&ctx, TOPIC_PREFIX);
        Ok(Arc::new(Self {
            ctx,
            topics,
            present: Mutex::new(None),
        }))
    }

    async fn set_presence(&self, present: bool) {
        let changed = match self.present.lock() {
            Ok(mut last) => last.replace(present) != Some(present),
            Err(_) => true,
        };
        if changed {
            self.topics.update_presence(present).await;
        }
    }
}

#[async_trait]
impl Device for OralBToothbrushDevice {
    async fn initialize(&self) -> Result<()> {
        let id = &self.ctx.id;
        let discovery = DiscoveryEntry {
            topic: self
                .topics
                .discovery_topic("sensor", &format!("toothbrush_{}", id)),
            payload: json!({
                "state_topic": self.topics.state_topic(),
                "json_attributes_topic": self.topics.attributes_topic(),
                "name": self.ctx.friendly_name,
                "unique_id": format!("cybele_toothbrush_{}", id),
                "platform": "mqtt",
                "availability_topic": self.topics.presence_topic(),
                "icon": "mdi:tooth-outline",
            }),
        };
        self.topics.initialize(&[discovery]).await
    }

    async fn on_advertisement(&self, device: &str, properties: &DeviceProperties) {
        if !self.ctx.owns(device) {
            return;
        }
        let Some(manufacturer_data) = properties.manufacturer_data() else {
            return;
        };
        let Some(brush) = parse_manufacturer_data(&manufacturer_data.data) else {
            warn!(
                "Short manufacturer data from {}: {:?}",
                self.ctx.friendly_name, manufacturer_data.data
            );
            return;
        };

        self.set_presence(brush.state > 0).await;

        if let Err(e) = self
            .topics
            .publish_raw_state(state_name(brush.state).to_string())
            .await
        {
            warn!("Failed to publish state of {}: {}", self.ctx.friendly_name, e);
        }

        let attributes = Attributes {
            rssi: properties.rssi(),
            pressure: brush.pressure,
            time: brush.time,
            mode: mode_name(brush.mode),
            sector: sector_name(brush.sector),
        };
        if let Err(e) = self.topics.publish_attributes(&attributes).await {
            warn!(
                "Failed to publish attributes of {}: {}",
                self.ctx.friendly_name, e
            );
        }
    }

    async fn destroy(&self) {}
}
