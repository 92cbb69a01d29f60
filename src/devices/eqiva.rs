//! eQ-3 Eqiva Bluetooth radiator thermostat
//!
//! Every command is written to the request characteristic; the thermostat
//! answers with a status frame on the response characteristic. Polling sends
//! the status/time-sync command. The thermostat drops the connection by itself
//! after two minutes of inactivity.

use crate::devices::context::{ConnectPolicy, DeviceContext};
use crate::devices::polling::{PollScheduler, PollingOptions};
use crate::devices::topics::{DiscoveryEntry, TopicHandler};
use crate::devices::{parse_options, Device, SharedDevice};
use crate::domain::error::{BridgeError, Result};
use crate::domain::models::{
    CharacteristicNotification, ControlPayload, DeviceProperties, WriteMode,
};
use crate::domain::settings::ComponentConfig;
use crate::infrastructure::bluez::{get_bool_property, GattMap, GATT_CHARACTERISTIC_INTERFACE};
use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const REQUEST_UUID: &str = "3fa4585a-ce4a-3bad-db4b-b8df8179ea09";
pub const RESPONSE_UUID: &str = "d0e8434d-cd29-0996-af41-6c90f4e0eb2a";

const TOPIC_PREFIX: &str = "eqiva_thermostat";

pub const MIN_TEMPERATURE: f64 = 4.5;
pub const MAX_TEMPERATURE: f64 = 30.0;
pub const MAX_OFFSET: f64 = 3.5;

fn default_connect_attempts() -> u32 {
    10
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermostatMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThermostatStatus {
    pub mode: ThermostatMode,
    pub vacation: bool,
    pub boost: bool,
    pub dst: bool,
    pub window_open: bool,
    pub locked: bool,
    pub low_bat: bool,
    pub valve: i8,
    pub temperature: f64,
}

impl ThermostatStatus {
    /// Home Assistant climate mode
    pub fn ha_mode(&self) -> &'static str {
        match self.mode {
            ThermostatMode::Auto => "auto",
            ThermostatMode::Manual if self.temperature <= MIN_TEMPERATURE => "off",
            ThermostatMode::Manual => "heat",
        }
    }
}

/// `[02 01] [flags] [valve %] [?] [target temp * 2] ...`
pub fn parse_status(data: &[u8]) -> Option<ThermostatStatus> {
    if data.len() < 6 {
        return None;
    }
    let flags = data[2];
    let flag = |bit: u8| flags & (1 << bit) != 0;

    Some(ThermostatStatus {
        mode: if flag(0) {
            ThermostatMode::Manual
        } else {
            ThermostatMode::Auto
        },
        vacation: flag(1),
        boost: flag(2),
        dst: flag(3),
        window_open: flag(4),
        locked: flag(5),
        low_bat: flag(7),
        valve: data[3] as i8,
        temperature: f64::from(data[5] as i8) / 2.0,
    })
}

/// Status request doubling as clock sync
pub fn status_command<T: Datelike + Timelike>(now: &T) -> [u8; 7] {
    [
        0x03,
        (now.year().rem_euclid(100)) as u8,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    ]
}

pub fn target_temperature_command(temperature: f64) -> Result<[u8; 2]> {
    if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&temperature) {
        return Err(BridgeError::InvalidCommand(format!(
            "temperature {} outside {}..={}",
            temperature, MIN_TEMPERATURE, MAX_TEMPERATURE
        )));
    }
    Ok([0x41, (temperature * 2.0).floor() as u8])
}

/// `heat` is the Home Assistant name of the manual mode
pub fn mode_command(mode: &str) -> Result<[u8; 2]> {
    match mode {
        "auto" => Ok([0x40, 0x00]),
        "heat" | "manual" => Ok([0x40, 0x28]),
        other => Err(BridgeError::InvalidCommand(format!("mode {:?}", other))),
    }
}

pub fn boost_command(boost: bool) -> [u8; 2] {
    [0x45, u8::from(boost)]
}

pub fn offset_command(offset: f64) -> Result<[u8; 2]> {
    if !(-MAX_OFFSET..=MAX_OFFSET).contains(&offset) {
        return Err(BridgeError::InvalidCommand(format!(
            "offset {} outside -{}..={}",
            offset, MAX_OFFSET, MAX_OFFSET
        )));
    }
    Ok([0x13, ((offset + MAX_OFFSET) * 2.0).floor() as u8])
}

/// Map a command topic and its payload to the bytes to write
pub fn encode_command(command: &str, payload: &ControlPayload) -> Result<Vec<u8>> {
    let invalid = || BridgeError::InvalidCommand(format!("{}: {:?}", command, payload));
    let bytes = match command {
        "set_temperature" => target_temperature_command(payload.as_f64().ok_or_else(invalid)?)?,
        "set_mode" => mode_command(payload.as_str().ok_or_else(invalid)?)?,
        "set_boost" => boost_command(payload.as_bool().ok_or_else(invalid)?),
        "set_offset" => offset_command(payload.as_f64().ok_or_else(invalid)?)?,
        _ => return Err(invalid()),
    };
    Ok(bytes.to_vec())
}

#[derive(Debug, Serialize)]
struct State {
    temperature: f64,
    mode: &'static str,
}

struct Inner {
    ctx: DeviceContext,
    topics: TopicHandler,
    scheduler: PollScheduler,
    policy: ConnectPolicy,
    gatt: Mutex<Option<GattMap>>,
}

impl Inner {
    fn queue_polling(self: &Arc<Self>) {
        let inner = self.clone();
        self.scheduler.schedule(move || async move {
            let command = status_command(&chrono::Local::now());
            if let Err(e) = inner.send_command(&command).await {
                warn!("Polling {} failed: {}", inner.ctx.friendly_name, e);
            }
            inner.queue_polling();
        });
    }

    fn cached_gatt(&self) -> Option<GattMap> {
        self.gatt.lock().ok().and_then(|gatt| gatt.clone())
    }

    /// Connect if needed and make sure status notifications are enabled
    async fn connect_and_subscribe(&self) -> Result<GattMap> {
        let gatt = match self.cached_gatt() {
            Some(gatt) if self.ctx.is_connected().await => gatt,
            _ => {
                let gatt = self.ctx.connect(&self.policy).await?;
                if let Ok(mut cached) = self.gatt.lock() {
                    *cached = Some(gatt.clone());
                }
                gatt
            }
        };

        let response = gatt.require(RESPONSE_UUID)?;
        let notifying = get_bool_property(
            self.ctx.bus.as_ref(),
            &response.path,
            GATT_CHARACTERISTIC_INTERFACE,
            "Notifying",
        )
        .await
        .unwrap_or(false);
        if !notifying {
            self.ctx.start_notify(response).await?;
        }
        Ok(gatt)
    }

    async fn send_command(&self, command: &[u8]) -> Result<()> {
        let gatt = self.connect_and_subscribe().await?;
        debug!("Sending {:02x?} to {}", command, self.ctx.friendly_name);
        self.ctx
            .write(gatt.require(REQUEST_UUID)?, command, WriteMode::Request)
            .await
    }

    async fn update_state(&self, status: &ThermostatStatus) {
        let state = State {
            temperature: status.temperature,
            mode: status.ha_mode(),
        };
        if let Err(e) = self.topics.publish_state(&state).await {
            warn!("Failed to publish state of {}: {}", self.ctx.friendly_name, e);
        }
        if let Err(e) = self.topics.publish_attributes(status).await {
            warn!(
                "Failed to publish attributes of {}: {}",
                self.ctx.friendly_name, e
            );
        }
    }

    async fn unsubscribe_and_disconnect(&self) {
        if let Some(response) = self
            .cached_gatt()
            .and_then(|gatt| gatt.get(RESPONSE_UUID).cloned())
        {
            let stop = self
                .ctx
                .gate
                .exclusive(async { Ok(self.ctx.bus.stop_notify(&response.path).await?) })
                .await;
            match stop {
                Ok(()) => {}
                Err(BridgeError::Bus(e)) if e.is_no_notify_session() => {}
                Err(e) => warn!(
                    "Failed to stop notifications of {}: {}",
                    self.ctx.friendly_name, e
                ),
            }
        }
        if self.ctx.is_connected().await {
            self.ctx.disconnect_quietly().await;
        }
    }
}

pub struct EqivaThermostatDevice {
    inner: Arc<Inner>,
}

impl EqivaThermostatDevice {
    pub fn create(config: &ComponentConfig, ctx: DeviceContext) -> Result<SharedDevice> {
        let options: Options = parse_options(config)?;
        let mut topics = TopicHandler::new(&ctx, TOPIC_PREFIX);
        for command in ["set_temperature", "set_mode", "set_boost", "set_offset"] {
            topics.register_command(command);
        }

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
                gatt: Mutex::new(None),
            }),
        }))
    }

    fn discovery(&self) -> DiscoveryEntry {
        let ctx = &self.inner.ctx;
        let topics = &self.inner.topics;
        DiscoveryEntry {
            topic: topics.discovery_topic("climate", &format!("{}_{}", TOPIC_PREFIX, ctx.id)),
            payload: json!({
                "json_attributes_topic": topics.attributes_topic(),
                "name": ctx.friendly_name,
                "unique_id": format!("cybele_eqiva_thermostat_{}", ctx.id),
                "platform": "mqtt",

                "precision": 0.5,
                "modes": ["auto", "heat"],
                "min_temp": MIN_TEMPERATURE,
                "max_temp": MAX_TEMPERATURE,
                "temp_step": 0.5,

                "current_temperature_topic": topics.state_topic(),
                "current_temperature_template": "{{ value_json.temperature }}",

                "temperature_command_topic": topics.topic("set_temperature"),
                "temperature_state_topic": topics.state_topic(),
                "temperature_state_template": "{{ value_json.temperature }}",

                "mode_state_topic": topics.state_topic(),
                "mode_state_template": "{{ value_json.mode }}",
                "mode_command_topic": topics.topic("set_mode"),
            }),
        }
    }
}

#[async_trait]
impl Device for EqivaThermostatDevice {
    async fn initialize(&self) -> Result<()> {
        self.inner.topics.initialize(&[self.discovery()]).await?;
        self.inner.queue_polling();
        Ok(())
    }

    async fn on_advertisement(&self, _device: &str, _properties: &DeviceProperties) {}

    async fn on_notification(&self, device: &str, notification: &CharacteristicNotification) {
        if !self.inner.ctx.owns(device) {
            return;
        }
        let is_response = self
            .inner
            .cached_gatt()
            .and_then(|gatt| gatt.uuid_for_handle(&notification.handle).map(str::to_string))
            .map(|uuid| uuid == RESPONSE_UUID)
            .unwrap_or(false);
        if !is_response {
            return;
        }

        match parse_status(&notification.value) {
            Some(status) => {
                debug!("Status of {}: {:?}", self.inner.ctx.friendly_name, status);
                self.inner.update_state(&status).await;
                // A fresh status makes the pending poll redundant
                self.inner.queue_polling();
            }
            None => warn!(
                "Short status frame from {}: {:02x?}",
                self.inner.ctx.friendly_name, notification.value
            ),
        }
    }

    async fn on_control_message(&self, topic: &str, payload: &str) {
        let Some((command, payload)) = self.inner.topics.handle_message(topic, payload) else {
            return;
        };
        let bytes = match encode_command(&command, &payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Ignoring {} for {}: {}", command, self.inner.ctx.friendly_name, e);
                return;
            }
        };

        info!("{} for {}", command, self.inner.ctx.friendly_name);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.send_command(&bytes).await {
                warn!("{} for {} failed: {}", command, inner.ctx.friendly_name, e);
            }
        });
    }

    async fn destroy(&self) {
        self.inner.scheduler.destroy();
        self.inner.unsubscribe_and_disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::BusValue;
    use crate::infrastructure::bluez::DEVICE_INTERFACE;
    use crate::testing::{device_context, BusCall, FakeBus, FakeTransport};
    use chrono::NaiveDate;
    use std::time::Duration;

    #[test]
    fn test_parse_status() {
        let status = parse_status(&[0x02, 0x01, 0x09, 0x1e, 0x04, 0x2b]).unwrap();
        assert_eq!(status.mode, ThermostatMode::Manual);
        assert!(status.dst);
        assert!(!status.boost);
        assert_eq!(status.valve, 30);
        assert_eq!(status.temperature, 21.5);
        assert_eq!(status.ha_mode(), "heat");

        let off = parse_status(&[0x02, 0x01, 0x01, 0x00, 0x04, 0x09]).unwrap();
        assert_eq!(off.ha_mode(), "off");
        let auto = parse_status(&[0x02, 0x01, 0x80, 0x00, 0x04, 0x28]).unwrap();
        assert_eq!(auto.ha_mode(), "auto");
        assert!(auto.low_bat);
        assert!(parse_status(&[0x02, 0x01]).is_none());
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!(target_temperature_command(21.5).unwrap(), [0x41, 43]);
        assert!(target_temperature_command(30.5).is_err());
        assert_eq!(mode_command("auto").unwrap(), [0x40, 0x00]);
        assert_eq!(mode_command("heat").unwrap(), [0x40, 0x28]);
        assert!(mode_command("cool").is_err());
        assert_eq!(boost_command(true), [0x45, 0x01]);
        assert_eq!(offset_command(-3.5).unwrap(), [0x13, 0]);
        assert_eq!(offset_command(1.0).unwrap(), [0x13, 9]);
        assert!(offset_command(4.0).is_err());

        let now = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(17, 5, 42)
            .unwrap();
        assert_eq!(status_command(&now), [0x03, 24, 3, 9, 17, 5, 42]);
    }

    #[test]
    fn test_payload_forms() {
        assert_eq!(
            encode_command("set_temperature", &ControlPayload::parse("19")).unwrap(),
            vec![0x41, 38]
        );
        assert_eq!(
            encode_command("set_mode", &ControlPayload::parse("heat")).unwrap(),
            vec![0x40, 0x28]
        );
        assert!(encode_command("set_boost", &ControlPayload::parse("{\"on\": true}")).is_err());
    }

    fn thermostat(bus: Arc<FakeBus>, transport: Arc<FakeTransport>) -> (SharedDevice, String) {
        let ctx = device_context(bus.clone(), transport, "Living room", "00:1A:22:0C:00:01");
        let path = ctx.device_path.clone();
        bus.add_device(&path);
        bus.set_property(&path, DEVICE_INTERFACE, "ServicesResolved", BusValue::Bool(true));
        bus.add_characteristic(&path, "service0400/char0410", REQUEST_UUID);
        bus.add_characteristic(&path, "service0400/char0420", RESPONSE_UUID);

        let config = ComponentConfig {
            kind: "EqivaThermostatDevice".into(),
            fields: json!({ "pollingInterval": 300000 })
                .as_object()
                .unwrap()
                .clone(),
        };
        (EqivaThermostatDevice::create(&config, ctx).unwrap(), path)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_round_trip() {
        let bus = Arc::new(FakeBus::new());
        let transport = Arc::new(FakeTransport::new());
        let (device, path) = thermostat(bus.clone(), transport.clone());
        device.initialize().await.unwrap();
        assert_eq!(transport.subscribed().len(), 4);

        device
            .on_control_message("cybele/eqiva_thermostat/001a220c0001/set_temperature", "22")
            .await;
        settle().await;

        let writes: Vec<BusCall> = bus.calls_to("WriteValue");
        assert_eq!(
            writes,
            vec![BusCall::WriteValue(
                format!("{}/service0400/char0410", path),
                vec![0x41, 44],
                WriteMode::Request,
            )]
        );
        assert_eq!(bus.calls_to("StartNotify").len(), 1);

        // Raw text is handed to the handler as well
        device
            .on_control_message("cybele/eqiva_thermostat/001a220c0001/set_mode", "heat")
            .await;
        device
            .on_control_message("cybele/eqiva_thermostat/001a220c0001/set_mode", "{not json")
            .await;
        settle().await;
        assert_eq!(bus.calls_to("WriteValue").len(), 2);

        device.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_notification_publishes_state() {
        let bus = Arc::new(FakeBus::new());
        let transport = Arc::new(FakeTransport::new());
        let (device, _) = thermostat(bus.clone(), transport.clone());
        device.initialize().await.unwrap();

        // Polling maps the GATT tree
        tokio::time::sleep(Duration::from_secs(301)).await;
        settle().await;
        let sync = &bus.calls_to("WriteValue")[0];
        assert!(matches!(sync, BusCall::WriteValue(_, bytes, _) if bytes[0] == 0x03));

        let frame = CharacteristicNotification {
            handle: "service0400/char0420".into(),
            value: vec![0x02, 0x01, 0x08, 0x00, 0x04, 0x2a],
        };
        device.on_notification("dev_00_1A_22_0C_00_01", &frame).await;
        device.on_notification("dev_00_1A_22_0C_00_01", &frame).await;

        let state = transport.published_to("cybele/eqiva_thermostat/001a220c0001/state");
        assert_eq!(state.len(), 1);
        let state: serde_json::Value = serde_json::from_str(&state[0].payload).unwrap();
        assert_eq!(state["temperature"], 21.0);
        assert_eq!(state["mode"], "auto");

        let attributes: serde_json::Value = serde_json::from_str(
            &transport.published_to("cybele/eqiva_thermostat/001a220c0001/attributes")[0].payload,
        )
        .unwrap();
        assert_eq!(attributes["dst"], true);
        assert_eq!(attributes["valve"], 0);

        device.destroy().await;
        assert_eq!(bus.calls_to("StopNotify").len(), 1);
    }
}
