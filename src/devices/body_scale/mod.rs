//! Xiaomi body composition scale
//!
//! Passive: finished measurements are broadcast as body composition service
//! data. Body metrics are derived from the configured user profile.
//!
//! ## Modules
//!
//! - [`metrics`] - Body composition formulas

pub mod metrics;

use crate::devices::context::DeviceContext;
use crate::devices::topics::{DiscoveryEntry, TopicHandler};
use crate::devices::{parse_options, u16_le, Device, SharedDevice};
use crate::domain::error::{BridgeError, Result};
use crate::domain::models::DeviceProperties;
use crate::domain::settings::ComponentConfig;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use metrics::{BodyComposition, BodyMetrics, Sex};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const BODY_COMPOSITION_UUID: &str = "0000181b-0000-1000-8000-00805f9b34fb";
const TOPIC_PREFIX: &str = "body_scale";
const MIN_PUBLISH_INTERVAL: Duration = Duration::from_secs(10);
const SECONDS_PER_YEAR: f64 = 31_556_926.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Options {
    user_birthday: String,
    user_height: f64,
    user_sex: Sex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    Kg,
    Lbs,
    Jin,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub unit: WeightUnit,
    pub stabilized: bool,
    pub load_removed: bool,
    pub impedance_measured: bool,
    pub weight: f64,
    pub impedance: u16,
}

impl Measurement {
    /// A measurement is final once the reading settled and the user stepped off
    pub fn is_final(&self) -> bool {
        self.stabilized && self.load_removed
    }
}

pub fn parse_service_data(data: &[u8]) -> Option<Measurement> {
    if data.len() < 4 {
        return None;
    }
    let unit = if data[0] & (1 << 4) != 0 {
        WeightUnit::Jin
    } else {
        match data[0] & 0x0f {
            0x03 => WeightUnit::Lbs,
            0x02 => WeightUnit::Kg,
            _ => WeightUnit::Unknown,
        }
    };

    Some(Measurement {
        unit,
        stabilized: data[1] & (1 << 5) != 0,
        load_removed: data[1] & (1 << 7) != 0,
        impedance_measured: data[1] & (1 << 1) != 0,
        weight: f64::from(u16_le(data, data.len() - 2)?) / 100.0 / 2.0,
        impedance: u16_le(data, data.len() - 4)?,
    })
}

/// Accepts a plain date or a full RFC 3339 timestamp
fn parse_birthday(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .ok_or_else(|| BridgeError::InvalidConfig(format!("invalid userBirthday {:?}", value)))
}

#[derive(Debug, Serialize)]
struct Attributes {
    impedance: u16,
    unit: WeightUnit,
    #[serde(flatten)]
    composition: BodyComposition,
}

pub struct MiBodyScaleDevice {
    ctx: DeviceContext,
    topics: TopicHandler,
    birthday: DateTime<Utc>,
    height: f64,
    sex: Sex,
    last_publish: Mutex<Option<Instant>>,
}

impl MiBodyScaleDevice {
    pub fn create(config: &ComponentConfig, ctx: DeviceContext) -> Result<SharedDevice> {
        let options: Options = parse_options(config)?;
        let birthday = parse_birthday(&options.user_birthday)?;
        // Validate the static part of the profile up front
        BodyMetrics::new(options.user_height, 0.0, options.user_sex)?;

        let topics = TopicHandler::new(&ctx, TOPIC_PREFIX);
        Ok(Arc::new(Self {
            ctx,
            topics,
            birthday,
            height: options.user_height,
            sex: options.user_sex,
            last_publish: Mutex::new(None),
        }))
    }

    fn age(&self) -> f64 {
        (Utc::now() - self.birthday).num_seconds() as f64 / SECONDS_PER_YEAR
    }

    /// Claim the publish slot unless the last publish is too recent
    fn claim_publish_slot(&self) -> bool {
        let mut last = match self.last_publish.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        if let Some(previous) = *last {
            if now.duration_since(previous) < MIN_PUBLISH_INTERVAL {
                return false;
            }
        }
        *last = Some(now);
        true
    }
}

#[async_trait]
impl Device for MiBodyScaleDevice {
    async fn initialize(&self) -> Result<()> {
        let id = &self.ctx.id;
        let discovery = DiscoveryEntry {
            topic: self
                .topics
                .discovery_topic("sensor", &format!("body_scale_{}", id)),
            payload: json!({
                "state_topic": self.topics.state_topic(),
                "json_attributes_topic": self.topics.attributes_topic(),
                "name": self.ctx.friendly_name,
                "unique_id": format!("cybele_body_scale_{}", id),
                "platform": "mqtt",
                "unit_of_measurement": "kg",
                "icon": "mdi:scale-bathroom",
            }),
        };
        self.topics.initialize(&[discovery]).await
    }

    async fn on_advertisement(&self, device: &str, properties: &DeviceProperties) {
        if !self.ctx.owns(device) {
            return;
        }
        let Some(service_data) = properties.service_data() else {
            return;
        };
        if service_data.uuid != BODY_COMPOSITION_UUID {
            return;
        }
        let Some(measurement) = parse_service_data(&service_data.data) else {
            warn!(
                "Short service data from {}: {:?}",
                self.ctx.friendly_name, service_data.data
            );
            return;
        };
        if !measurement.is_final() {
            debug!("Measurement of {} not final yet", self.ctx.friendly_name);
            return;
        }

        let metrics = match BodyMetrics::new(self.height, self.age(), self.sex) {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("Cannot compute body metrics for {}: {}", self.ctx.friendly_name, e);
                return;
            }
        };
        if !self.claim_publish_slot() {
            return;
        }

        let attributes = Attributes {
            impedance: measurement.impedance,
            unit: measurement.unit,
            composition: metrics.composition(measurement.weight, f64::from(measurement.impedance)),
        };

        if let Err(e) = self
            .topics
            .publish_raw_state(format!("{:.2}", measurement.weight))
            .await
        {
            warn!("Failed to publish weight of {}: {}", self.ctx.friendly_name, e);
        }
        if let Err(e) = self.topics.publish_attributes(&attributes).await {
            warn!(
                "Failed to publish attributes of {}: {}",
                self.ctx.friendly_name, e
            );
        }
    }

    async fn destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{PropValue, ServiceData};
    use crate::testing::{device_context, FakeBus, FakeTransport};

    // 75 kg, impedance 480, stabilized and load removed
    const FINAL_FRAME: [u8; 13] = [
        0x02, 0xa6, 0xe4, 0x07, 0x05, 0x11, 0x08, 0x1e, 0x00, 0xe0, 0x01, 0x98, 0x3a,
    ];

    fn properties(data: &[u8]) -> DeviceProperties {
        let mut properties = DeviceProperties::new();
        properties.insert(
            "ServiceData",
            PropValue::Service(ServiceData {
                uuid: BODY_COMPOSITION_UUID.to_string(),
                data: data.to_vec(),
            }),
        );
        properties
    }

    fn config() -> ComponentConfig {
        ComponentConfig {
            kind: "MiBodyScaleDevice".into(),
            fields: json!({
                "userBirthday": "1990-04-01",
                "userHeight": 180,
                "userSex": "M",
            })
            .as_object()
            .unwrap()
            .clone(),
        }
    }

    #[test]
    fn test_parse_service_data() {
        let measurement = parse_service_data(&FINAL_FRAME).unwrap();
        assert_eq!(measurement.unit, WeightUnit::Kg);
        assert!(measurement.is_final());
        assert!(measurement.impedance_measured);
        assert_eq!(measurement.weight, 75.0);
        assert_eq!(measurement.impedance, 480);

        let mut settling = FINAL_FRAME;
        settling[1] = 0x02;
        assert!(!parse_service_data(&settling).unwrap().is_final());
        assert!(parse_service_data(&FINAL_FRAME[..3]).is_none());
    }

    #[test]
    fn test_birthday_formats() {
        assert!(parse_birthday("1990-04-01").is_ok());
        assert!(parse_birthday("1990-04-01T12:00:00+02:00").is_ok());
        assert!(parse_birthday("April 1st").is_err());
    }

    #[test]
    fn test_invalid_profile_is_a_config_error() {
        let mut config = config();
        config.fields.insert("userHeight".into(), json!(250));
        let ctx = device_context(
            Arc::new(FakeBus::new()),
            Arc::new(FakeTransport::new()),
            "Scale",
            "C8:47:8C:00:00:01",
        );
        assert!(matches!(
            MiBodyScaleDevice::create(&config, ctx),
            Err(BridgeError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_measurement_published_at_most_every_ten_seconds() {
        let transport = Arc::new(FakeTransport::new());
        let ctx = device_context(
            Arc::new(FakeBus::new()),
            transport.clone(),
            "Scale",
            "C8:47:8C:00:00:01",
        );
        let device = MiBodyScaleDevice::create(&config(), ctx).unwrap();
        let node = "dev_C8_47_8C_00_00_01";

        device.on_advertisement(node, &properties(&FINAL_FRAME)).await;
        let mut heavier = FINAL_FRAME;
        heavier[11] = 0x00;
        heavier[12] = 0x3c;
        device.on_advertisement(node, &properties(&heavier)).await;

        let state_topic = "cybele/body_scale/c8478c000001/state";
        assert_eq!(transport.published_to(state_topic).len(), 1);
        assert_eq!(transport.published_to(state_topic)[0].payload, "75.00");

        tokio::time::advance(Duration::from_secs(11)).await;
        device.on_advertisement(node, &properties(&heavier)).await;
        let published = transport.published_to(state_topic);
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].payload, "76.80");

        let attributes: serde_json::Value = serde_json::from_str(
            &transport.published_to("cybele/body_scale/c8478c000001/attributes")[0].payload,
        )
        .unwrap();
        assert_eq!(attributes["impedance"], 480);
        assert_eq!(attributes["unit"], "kg");
        assert!(attributes["body_type"].is_string());
        assert!(attributes["ideal_weight_kg"].is_number());
    }
}
