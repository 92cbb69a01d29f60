//! Xiaomi Mi Smart Kettle
//!
//! The kettle only talks to authenticated peers. A connect is triggered by
//! RSSI-only advertisement updates while disconnected and is followed by the
//! four stage token exchange:
//!
//! 1. write the init key to the auth-init characteristic
//! 2. subscribe to the auth characteristic and send the token encrypted with
//!    the first key mix
//! 3. the kettle answers on the auth characteristic; the decrypted answer must
//!    equal the token, then the second key is written
//! 4. read the verify characteristic
//!
//! Afterwards status notifications are enabled and the keep-warm settings read.
//!
//! ## Modules
//!
//! - [`cipher`] - Key mixes and stream cipher

pub mod cipher;

use crate::core::gate::ExclusivityGate;
use crate::devices::context::{ConnectPolicy, DeviceContext};
use crate::devices::topics::{DiscoveryEntry, TopicHandler};
use crate::devices::{parse_options, u16_le, Device, SharedDevice};
use crate::domain::error::{BridgeError, Result};
use crate::domain::models::{
    CharacteristicNotification, ControlPayload, DeviceProperties, WriteMode,
};
use crate::domain::settings::ComponentConfig;
use crate::infrastructure::bluez::GattMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const AUTH_INIT_UUID: &str = "00000010-0000-1000-8000-00805f9b34fb";
pub const AUTH_UUID: &str = "00000001-0000-1000-8000-00805f9b34fb";
pub const VERIFY_UUID: &str = "00000004-0000-1000-8000-00805f9b34fb";
pub const SETUP_UUID: &str = "0000aa01-0000-1000-8000-00805f9b34fb";
pub const STATUS_UUID: &str = "0000aa02-0000-1000-8000-00805f9b34fb";
pub const TIME_UUID: &str = "0000aa04-0000-1000-8000-00805f9b34fb";
pub const REFILL_MODE_UUID: &str = "0000aa05-0000-1000-8000-00805f9b34fb";

pub const KEY1: [u8; 4] = [0x90, 0xca, 0x85, 0xde];
pub const KEY2: [u8; 4] = [0x92, 0xab, 0x54, 0xfa];

const TOPIC_PREFIX: &str = "kettle";
const TOKEN_LEN: usize = 12;
const WEAK_SIGNAL_RSSI: i64 = -98;
/// Pause between dropping a stale status subscription and subscribing again
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(1000);

fn default_connect_attempts() -> u32 {
    3
}

fn default_max_delay_after_connect() -> u64 {
    4000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Options {
    product_id: u16,
    #[serde(default)]
    token: Option<Vec<u8>>,
    #[serde(default = "default_connect_attempts")]
    connect_attempts: u32,
    #[serde(default = "default_max_delay_after_connect")]
    max_delay_after_connect: u64,
}

pub fn action_name(action: u8) -> &'static str {
    match action {
        0 => "idle",
        1 => "heating",
        2 => "cooling",
        3 => "keeping_warm",
        _ => "unknown",
    }
}

pub fn mode_name(mode: u8) -> &'static str {
    match mode {
        255 => "none",
        1 => "boil",
        2 => "keep_warm",
        _ => "unknown",
    }
}

pub fn keep_warm_type_name(keep_warm_type: u8) -> &'static str {
    match keep_warm_type {
        0 => "boil_and_cool_down",
        1 => "heat_to_temperature",
        _ => "unknown",
    }
}

pub fn refill_mode_name(mode: u8) -> &'static str {
    match mode {
        0 => "keep_warm",
        1 => "turn_off",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KettleStatus {
    pub action: &'static str,
    pub mode: &'static str,
    pub keep_warm_set_temperature: u8,
    pub current_temperature: u8,
    pub keep_warm_type: &'static str,
    /// Minutes spent keeping warm
    pub keep_warm_time: u16,
}

pub fn parse_status(data: &[u8]) -> Option<KettleStatus> {
    Some(KettleStatus {
        action: action_name(*data.first()?),
        mode: mode_name(*data.get(1)?),
        keep_warm_set_temperature: *data.get(4)?,
        current_temperature: *data.get(5)?,
        keep_warm_type: keep_warm_type_name(*data.get(6)?),
        keep_warm_time: u16_le(data, 7)?,
    })
}

/// Settings only readable through their own characteristics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ExtendedAttributes {
    refill_mode: Option<&'static str>,
    time_limit: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Attributes {
    action: &'static str,
    mode: &'static str,
    keep_warm_refill_mode: Option<&'static str>,
    keep_warm_temperature: u8,
    keep_warm_type: &'static str,
    keep_warm_time: u16,
    keep_warm_time_limit: Option<f64>,
}

/// A validated command and the characteristic it is written to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KettleCommand {
    /// `[0 = boil | 1 = heat, temperature]`
    KeepWarmParameters { mode: u8, temperature: u8 },
    /// Half hours, 0..=24
    KeepWarmTimeLimit(u8),
    RefillMode(u8),
}

impl KettleCommand {
    pub fn parse(command: &str, payload: &ControlPayload) -> Result<Self> {
        let invalid = || BridgeError::InvalidCommand(format!("{}: {:?}", command, payload));
        match command {
            "set_keep_warm_parameters" => {
                let mode = match payload.field("mode").and_then(|m| m.as_str()) {
                    Some("boil") => 0,
                    Some("heat") => 1,
                    _ => return Err(invalid()),
                };
                let temperature = payload
                    .field("temperature")
                    .and_then(|t| t.as_f64())
                    .filter(|t| (40.0..=90.0).contains(t))
                    .ok_or_else(invalid)?;
                Ok(Self::KeepWarmParameters {
                    mode,
                    temperature: temperature as u8,
                })
            }
            "set_keep_warm_time_limit" => {
                let half_hours = payload
                    .field("time")
                    .and_then(|t| t.as_f64())
                    .map(|hours| (hours * 2.0).round())
                    .filter(|t| (0.0..=24.0).contains(t))
                    .ok_or_else(invalid)?;
                Ok(Self::KeepWarmTimeLimit(half_hours as u8))
            }
            "set_keep_warm_refill_mode" => match payload.field("mode").and_then(|m| m.as_str()) {
                Some("keep_warm") => Ok(Self::RefillMode(0)),
                Some("turn_off") => Ok(Self::RefillMode(1)),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }

    fn target(&self) -> &'static str {
        match self {
            Self::KeepWarmParameters { .. } => SETUP_UUID,
            Self::KeepWarmTimeLimit(_) => TIME_UUID,
            Self::RefillMode(_) => REFILL_MODE_UUID,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::KeepWarmParameters { mode, temperature } => vec![*mode, *temperature],
            Self::KeepWarmTimeLimit(half_hours) => vec![*half_hours],
            Self::RefillMode(mode) => vec![*mode],
        }
    }
}

fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let parts: Vec<u8> = mac
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| BridgeError::InvalidConfig(format!("mac {}: {}", mac, e)))?;
    <[u8; 6]>::try_from(parts)
        .map_err(|_| BridgeError::InvalidConfig(format!("mac {} must have six octets", mac)))
}

struct Inner {
    ctx: DeviceContext,
    topics: TopicHandler,
    policy: ConnectPolicy,
    product_id: u16,
    reversed_mac: [u8; 6],
    token: [u8; TOKEN_LEN],
    connected: AtomicBool,
    /// Only one connect and authentication sequence at a time
    connection_gate: ExclusivityGate,
    gatt: Mutex<Option<GattMap>>,
    extended: Mutex<ExtendedAttributes>,
}

impl Inner {
    fn cached_gatt(&self) -> Result<GattMap> {
        self.gatt
            .lock()
            .ok()
            .and_then(|gatt| gatt.clone())
            .ok_or_else(|| {
                BridgeError::Protocol(format!("{} is not connected", self.ctx.friendly_name))
            })
    }

    fn store_gatt(&self, gatt: GattMap) {
        if let Ok(mut cached) = self.gatt.lock() {
            *cached = Some(gatt);
        }
    }

    fn update_extended(&self, update: impl FnOnce(&mut ExtendedAttributes)) {
        if let Ok(mut extended) = self.extended.lock() {
            update(&mut extended);
        }
    }

    fn extended(&self) -> ExtendedAttributes {
        self.extended.lock().map(|e| *e).unwrap_or_default()
    }

    /// Connect and run the first two authentication stages
    async fn connect_to_kettle(&self) -> Result<()> {
        let gatt = self.ctx.connect(&self.policy).await?;
        self.store_gatt(gatt.clone());
        self.connected.store(true, Ordering::SeqCst);

        // Stage one
        self.ctx
            .write(gatt.require(AUTH_INIT_UUID)?, &KEY1, WriteMode::Command)
            .await?;

        // Stage two
        let auth = gatt.require(AUTH_UUID)?;
        self.ctx.start_notify(auth).await?;
        let challenge = cipher::cipher(
            &cipher::mix_a(&self.reversed_mac, self.product_id),
            &self.token,
        );
        self.ctx.write(auth, &challenge, WriteMode::Request).await
    }

    /// Verify the kettle's answer, finish authentication and start listening
    async fn complete_authentication(&self, answer: &[u8]) -> Result<()> {
        let gatt = self.cached_gatt()?;

        // Stage three
        let response = cipher::cipher(
            &cipher::mix_b(&self.reversed_mac, self.product_id),
            &cipher::cipher(&cipher::mix_a(&self.reversed_mac, self.product_id), answer),
        );
        if response != self.token {
            return Err(BridgeError::Protocol("Verification failed".to_string()));
        }
        let confirmation = cipher::cipher(&self.token, &KEY2);
        self.ctx
            .write(gatt.require(AUTH_UUID)?, &confirmation, WriteMode::Command)
            .await?;

        // Stage four
        self.ctx.read(gatt.require(VERIFY_UUID)?).await?;

        self.enable_status_notifications(&gatt).await?;
        info!("Connected to {}", self.ctx.friendly_name);
        self.fetch_extended_attributes(&gatt).await
    }

    async fn enable_status_notifications(&self, gatt: &GattMap) -> Result<()> {
        let status = gatt.require(STATUS_UUID)?;
        let stop = self
            .ctx
            .gate
            .exclusive(async { Ok(self.ctx.bus.stop_notify(&status.path).await?) })
            .await;
        match stop {
            Ok(()) => {}
            Err(BridgeError::Bus(e)) if e.is_no_notify_session() => {}
            Err(e) => return Err(e),
        }

        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        self.ctx.start_notify(status).await
    }

    async fn fetch_extended_attributes(&self, gatt: &GattMap) -> Result<()> {
        let refill_mode = self.ctx.read(gatt.require(REFILL_MODE_UUID)?).await?;
        if let Some(mode) = refill_mode.first() {
            self.update_extended(|e| e.refill_mode = Some(refill_mode_name(*mode)));
        }

        let time_limit = self.ctx.read(gatt.require(TIME_UUID)?).await?;
        if let Some(half_hours) = time_limit.first() {
            self.update_extended(|e| e.time_limit = Some(f64::from(*half_hours) / 2.0));
        }
        Ok(())
    }

    /// Pick up an existing connection after a restart
    async fn resume_connection(&self) -> Result<()> {
        if !self.ctx.is_connected().await {
            return Ok(());
        }
        info!("{} is already connected", self.ctx.friendly_name);
        self.connected.store(true, Ordering::SeqCst);

        let gatt = self
            .ctx
            .gate
            .exclusive(async {
                Ok(GattMap::discover(self.ctx.bus.as_ref(), &self.ctx.device_path).await?)
            })
            .await?;
        self.store_gatt(gatt.clone());
        self.enable_status_notifications(&gatt).await?;
        self.fetch_extended_attributes(&gatt).await
    }

    async fn send(&self, command: &KettleCommand) -> Result<()> {
        let gatt = self.cached_gatt()?;
        self.ctx
            .write(
                gatt.require(command.target())?,
                &command.payload(),
                WriteMode::Request,
            )
            .await?;

        match command {
            KettleCommand::KeepWarmTimeLimit(half_hours) => {
                let hours = f64::from(*half_hours) / 2.0;
                self.update_extended(|e| e.time_limit = Some(hours));
            }
            KettleCommand::RefillMode(mode) => {
                let name = refill_mode_name(*mode);
                self.update_extended(|e| e.refill_mode = Some(name));
            }
            KettleCommand::KeepWarmParameters { .. } => {}
        }
        Ok(())
    }

    async fn update_state(&self, status: &KettleStatus) {
        let extended = self.extended();
        let attributes = Attributes {
            action: status.action,
            mode: status.mode,
            keep_warm_refill_mode: extended.refill_mode,
            keep_warm_temperature: status.keep_warm_set_temperature,
            keep_warm_type: status.keep_warm_type,
            keep_warm_time: status.keep_warm_time,
            keep_warm_time_limit: extended.time_limit,
        };

        let state_changed = match self
            .topics
            .publish_raw_state(status.current_temperature.to_string())
            .await
        {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Failed to publish state of {}: {}", self.ctx.friendly_name, e);
                false
            }
        };
        let attributes_changed = match self.topics.publish_attributes(&attributes).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(
                    "Failed to publish attributes of {}: {}",
                    self.ctx.friendly_name, e
                );
                false
            }
        };
        if state_changed || attributes_changed {
            self.topics.update_presence(true).await;
        }
    }
}

pub struct MiKettleDevice {
    inner: Arc<Inner>,
}

impl MiKettleDevice {
    pub fn create(config: &ComponentConfig, ctx: DeviceContext) -> Result<SharedDevice> {
        Ok(Arc::new(Self::new(config, ctx)?))
    }

    fn new(config: &ComponentConfig, ctx: DeviceContext) -> Result<Self> {
        let options: Options = parse_options(config)?;
        let mut reversed_mac = parse_mac(&ctx.mac)?;
        reversed_mac.reverse();

        let token = match options.token.as_deref().map(<[u8; TOKEN_LEN]>::try_from) {
            Some(Ok(token)) => token,
            Some(Err(_)) => {
                warn!(
                    "Ignoring token of {}: it must have {} bytes",
                    ctx.friendly_name, TOKEN_LEN
                );
                rand::random()
            }
            None => rand::random(),
        };

        let mut topics = TopicHandler::new(&ctx, TOPIC_PREFIX);
        for command in [
            "set_keep_warm_parameters",
            "set_keep_warm_time_limit",
            "set_keep_warm_refill_mode",
        ] {
            topics.register_command(command);
        }

        let connection_gate = ExclusivityGate::new(&format!("{} connection", ctx.friendly_name));
        Ok(Self {
            inner: Arc::new(Inner {
                ctx,
                topics,
                policy: ConnectPolicy::new(
                    options.connect_attempts,
                    1000,
                    options.max_delay_after_connect,
                ),
                product_id: options.product_id,
                reversed_mac,
                token,
                connected: AtomicBool::new(false),
                connection_gate,
                gatt: Mutex::new(None),
                extended: Mutex::new(ExtendedAttributes::default()),
            }),
        })
    }

    fn try_connect(&self) {
        if self.inner.connected.load(Ordering::SeqCst) {
            return;
        }
        let Some(token) = self.inner.connection_gate.try_acquire() else {
            return;
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.connect_to_kettle().await {
                warn!("{} while connecting to {}", e, inner.ctx.friendly_name);
                if inner.connected.swap(false, Ordering::SeqCst) {
                    inner.ctx.disconnect_quietly().await;
                }
            }
            drop(token);
        });
    }
}

#[async_trait]
impl Device for MiKettleDevice {
    async fn initialize(&self) -> Result<()> {
        let ctx = &self.inner.ctx;
        let topics = &self.inner.topics;
        let discovery = DiscoveryEntry {
            topic: topics.discovery_topic("sensor", &format!("kettle_{}", ctx.id)),
            payload: json!({
                "state_topic": topics.state_topic(),
                "json_attributes_topic": topics.attributes_topic(),
                "name": ctx.friendly_name,
                "unique_id": format!("cybele_kettle_{}", ctx.id),
                "platform": "mqtt",
                "unit_of_measurement": "°C",
                "availability_topic": topics.presence_topic(),
                "icon": "mdi:kettle",
            }),
        };
        topics.initialize(&[discovery]).await?;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.resume_connection().await {
                warn!(
                    "Failed to resume connection to {}: {}",
                    inner.ctx.friendly_name, e
                );
            }
        });
        Ok(())
    }

    async fn on_advertisement(&self, device: &str, properties: &DeviceProperties) {
        if !self.inner.ctx.owns(device) {
            return;
        }

        if let Some(connected) = properties.connected() {
            self.inner.connected.store(connected, Ordering::SeqCst);
            self.inner.topics.update_presence(connected).await;
            if !connected {
                info!("Disconnected from {}", self.inner.ctx.friendly_name);
                // The first status after a reconnect brings presence back online
                self.inner.topics.reset();
            }
        }

        // An RSSI-only update means the kettle is advertising, i.e. free to connect
        if properties.len() == 1 {
            if let Some(rssi) = properties.rssi() {
                if rssi < WEAK_SIGNAL_RSSI {
                    info!(
                        "Signal is very weak. Connection to {} might fail or be unreliable.",
                        self.inner.ctx.friendly_name
                    );
                }
                self.try_connect();
            }
        }
    }

    async fn on_notification(&self, device: &str, notification: &CharacteristicNotification) {
        if !self.inner.ctx.owns(device) {
            return;
        }
        let Ok(gatt) = self.inner.cached_gatt() else {
            return;
        };

        match gatt.uuid_for_handle(&notification.handle) {
            Some(AUTH_UUID) => {
                let inner = self.inner.clone();
                let answer = notification.value.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner.complete_authentication(&answer).await {
                        warn!(
                            "Authentication with {} failed: {}",
                            inner.ctx.friendly_name, e
                        );
                    }
                });
            }
            Some(STATUS_UUID) => match parse_status(&notification.value) {
                Some(status) => self.inner.update_state(&status).await,
                None => warn!(
                    "Short status frame from {}: {:02x?}",
                    self.inner.ctx.friendly_name, notification.value
                ),
            },
            other => debug!(
                "Ignoring notification of {:?} from {}",
                other, self.inner.ctx.friendly_name
            ),
        }
    }

    async fn on_control_message(&self, topic: &str, payload: &str) {
        let Some((command, payload)) = self.inner.topics.handle_message(topic, payload) else {
            return;
        };
        let parsed = match KettleCommand::parse(&command, &payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Ignoring {} for {}: {}", command, self.inner.ctx.friendly_name, e);
                return;
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.send(&parsed).await {
                warn!("{} for {} failed: {}", command, inner.ctx.friendly_name, e);
            }
        });
    }

    async fn destroy(&self) {
        self.inner.connection_gate.close();
        if self.inner.connected.load(Ordering::SeqCst) {
            self.inner.ctx.disconnect_quietly().await;
        }
    }
}
