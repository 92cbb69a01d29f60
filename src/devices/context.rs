//! Per-device context shared by every variant
//!
//! Holds the identity of the peripheral, the adapter's gate and the injected
//! bus and transport, plus the connection protocol used by all connected
//! variants.

use crate::core::gate::ExclusivityGate;
use crate::domain::error::{BridgeError, Result};
use crate::domain::models::WriteMode;
use crate::infrastructure::bluez::gatt::CharacteristicRef;
use crate::infrastructure::bluez::{
    adapter_path, device_node_name, get_bool_property, GattMap, SharedBus, DEVICE_INTERFACE,
};
use crate::infrastructure::mqtt::SharedTransport;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything an adapter hands to the devices it builds
#[derive(Clone)]
pub struct DeviceDeps {
    pub hci_device: String,
    pub gate: ExclusivityGate,
    pub bus: SharedBus,
    pub transport: SharedTransport,
    pub topic_prefix: String,
    pub discovery_prefix: String,
}

/// Fields every device entry carries
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOptions {
    pub friendly_name: String,
    pub mac: String,
}

/// Bounds of the connect protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
    /// Upper bound for the wait on `ServicesResolved` after a connect
    pub max_delay_after_connect: Duration,
    pub resolve_poll_interval: Duration,
}

impl ConnectPolicy {
    pub fn new(attempts: u32, retry_delay_ms: u64, max_delay_after_connect_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            retry_delay: Duration::from_millis(retry_delay_ms),
            max_delay_after_connect: Duration::from_millis(max_delay_after_connect_ms),
            ..Self::default()
        }
    }
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_millis(1000),
            max_delay_after_connect: Duration::from_millis(5000),
            resolve_poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Clone)]
pub struct DeviceContext {
    /// Lowercase MAC without separators
    pub id: String,
    pub friendly_name: String,
    pub mac: String,
    pub hci_device: String,
    /// `dev_AA_BB_CC_DD_EE_FF`
    pub node_name: String,
    pub device_path: String,
    pub gate: ExclusivityGate,
    pub bus: SharedBus,
    pub transport: SharedTransport,
    pub topic_prefix: String,
    pub discovery_prefix: String,
}

impl DeviceContext {
    pub fn new(deps: &DeviceDeps, options: &DeviceOptions) -> Self {
        let node_name = device_node_name(&options.mac);
        let device_path = format!("{}/{}", adapter_path(&deps.hci_device), node_name);

        Self {
            id: options.mac.to_lowercase().replace(':', ""),
            friendly_name: options.friendly_name.clone(),
            mac: options.mac.clone(),
            hci_device: deps.hci_device.clone(),
            node_name,
            device_path,
            gate: deps.gate.clone(),
            bus: deps.bus.clone(),
            transport: deps.transport.clone(),
            topic_prefix: deps.topic_prefix.clone(),
            discovery_prefix: deps.discovery_prefix.clone(),
        }
    }

    /// Whether a dispatched event's device node belongs to this device
    pub fn owns(&self, node_name: &str) -> bool {
        self.node_name == node_name
    }

    /// Connect, wait for service resolution and map the GATT tree.
    ///
    /// Each attempt runs while holding the gate. Attempts are retried with a
    /// fixed delay; a device the daemon does not know (out of range) fails
    /// immediately.
    pub async fn connect(&self, policy: &ConnectPolicy) -> Result<GattMap> {
        if !self.bus.device_present(&self.device_path).await {
            return Err(BridgeError::DeviceUnavailable(self.friendly_name.clone()));
        }

        let mut last_error = String::new();
        for attempt in 1..=policy.attempts {
            match self.gate.exclusive(self.connect_once(policy)).await {
                Ok(map) => {
                    debug!("Connected to {} on attempt {}", self.friendly_name, attempt);
                    return Ok(map);
                }
                Err(BridgeError::GateClosed) => return Err(BridgeError::GateClosed),
                Err(e) => {
                    warn!(
                        "Connect attempt {}/{} to {} on {} failed: {}",
                        attempt, policy.attempts, self.friendly_name, self.hci_device, e
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < policy.attempts {
                tokio::time::sleep(policy.retry_delay).await;
            }
        }

        Err(BridgeError::ConnectFailed {
            device: self.friendly_name.clone(),
            attempts: policy.attempts,
            last_error,
        })
    }

    async fn connect_once(&self, policy: &ConnectPolicy) -> Result<GattMap> {
        self.bus.connect(&self.device_path).await?;

        let resolved = get_bool_property(
            self.bus.as_ref(),
            &self.device_path,
            DEVICE_INTERFACE,
            "ServicesResolved",
        )
        .await
        .unwrap_or(false);

        if !resolved {
            self.wait_for_services_resolved(policy).await?;
        }

        Ok(GattMap::discover(self.bus.as_ref(), &self.device_path).await?)
    }

    async fn wait_for_services_resolved(&self, policy: &ConnectPolicy) -> Result<()> {
        let poll = async {
            loop {
                tokio::time::sleep(policy.resolve_poll_interval).await;
                let resolved = get_bool_property(
                    self.bus.as_ref(),
                    &self.device_path,
                    DEVICE_INTERFACE,
                    "ServicesResolved",
                )
                .await;
                if let Ok(true) = resolved {
                    return;
                }
            }
        };

        tokio::time::timeout(policy.max_delay_after_connect, poll)
            .await
            .map_err(|_| {
                BridgeError::timeout(
                    policy.max_delay_after_connect,
                    format!("services of {} to resolve", self.friendly_name),
                )
            })
    }

    /// Whether the daemon reports the device as connected
    pub async fn is_connected(&self) -> bool {
        get_bool_property(
            self.bus.as_ref(),
            &self.device_path,
            DEVICE_INTERFACE,
            "Connected",
        )
        .await
        .unwrap_or(false)
    }

    pub async fn read(&self, characteristic: &CharacteristicRef) -> Result<Vec<u8>> {
        self.gate
            .exclusive(async { Ok(self.bus.read_value(&characteristic.path).await?) })
            .await
    }

    pub async fn write(
        &self,
        characteristic: &CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        self.gate
            .exclusive(async {
                Ok(self
                    .bus
                    .write_value(&characteristic.path, value, mode)
                    .await?)
            })
            .await
    }

    pub async fn start_notify(&self, characteristic: &CharacteristicRef) -> Result<()> {
        self.gate
            .exclusive(async { Ok(self.bus.start_notify(&characteristic.path).await?) })
            .await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.gate
            .exclusive(async { Ok(self.bus.disconnect(&self.device_path).await?) })
            .await
    }

    /// Disconnect, logging instead of failing
    pub async fn disconnect_quietly(&self) {
        match self.disconnect().await {
            Ok(()) => info!("Disconnected from {}", self.friendly_name),
            Err(e) => warn!("Failed to disconnect from {}: {}", self.friendly_name, e),
        }
    }
}
