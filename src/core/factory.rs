//! Construction of dongles, devices and services from configuration

use crate::core::dongle::Dongle;
use crate::core::gate::ExclusivityGate;
use crate::devices::context::{DeviceContext, DeviceDeps, DeviceOptions};
use crate::devices::{self, parse_options, DeviceConstructor, SharedDevice};
use crate::domain::error::{BridgeError, Result};
use crate::domain::settings::{ComponentConfig, DongleConfig, MqttSettings};
use crate::infrastructure::bluez::SharedBus;
use crate::infrastructure::mqtt::SharedTransport;
use crate::services::{self, SharedService};
use std::sync::Arc;
use tracing::{error, info};

/// Build a device through the type registry and initialize it
pub async fn manufacture_device(
    config: &ComponentConfig,
    deps: &DeviceDeps,
) -> Result<SharedDevice> {
    let constructor = devices::constructor_for(&config.kind)
        .ok_or_else(|| BridgeError::UnknownDeviceType(config.kind.clone()))?;
    build_device(constructor, config, deps).await
}

async fn build_device(
    constructor: DeviceConstructor,
    config: &ComponentConfig,
    deps: &DeviceDeps,
) -> Result<SharedDevice> {
    let options: DeviceOptions = parse_options(config)?;

    let device = constructor(config, DeviceContext::new(deps, &options))?;
    if let Err(e) = device.initialize().await {
        device.destroy().await;
        return Err(e);
    }
    info!(
        "Initialized {} {} on {}",
        config.kind, options.friendly_name, deps.hci_device
    );
    Ok(device)
}

/// Build a service through the type registry and initialize it
pub async fn manufacture_service(
    config: &ComponentConfig,
    deps: &DeviceDeps,
) -> Result<SharedService> {
    let constructor = services::constructor_for(&config.kind)
        .ok_or_else(|| BridgeError::UnknownServiceType(config.kind.clone()))?;

    let service = constructor(config, deps)?;
    if let Err(e) = service.initialize().await {
        service.destroy().await;
        return Err(e);
    }
    info!("Initialized {}", service.name());
    Ok(service)
}

/// Builds fully initialized dongles.
///
/// Services and devices are created in configuration order; the first
/// failure aborts the whole dongle and tears down what was already built.
pub struct DongleFactory {
    bus: SharedBus,
    transport: SharedTransport,
    topic_prefix: String,
    discovery_prefix: String,
}

impl DongleFactory {
    pub fn new(bus: SharedBus, transport: SharedTransport, mqtt: &MqttSettings) -> Self {
        Self {
            bus,
            transport,
            topic_prefix: mqtt.topic_prefix.clone(),
            discovery_prefix: mqtt.discovery_prefix.clone(),
        }
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    pub async fn manufacture(&self, config: &DongleConfig) -> Result<Arc<Dongle>> {
        let deps = DeviceDeps {
            hci_device: config.hci_device.clone(),
            gate: ExclusivityGate::new(&config.hci_device),
            bus: self.bus.clone(),
            transport: self.transport.clone(),
            topic_prefix: self.topic_prefix.clone(),
            discovery_prefix: self.discovery_prefix.clone(),
        };

        let mut services = Vec::with_capacity(config.services.len());
        let mut devices = Vec::with_capacity(config.devices.len());
        let built = async {
            for service in &config.services {
                services.push(manufacture_service(service, &deps).await?);
            }
            for device in &config.devices {
                devices.push(manufacture_device(device, &deps).await?);
            }
            Ok::<(), BridgeError>(())
        }
        .await;

        let dongle = Dongle::new(config, deps.gate.clone(), self.bus.clone(), services, devices);
        let result = match built {
            Ok(()) => dongle.initialize().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(dongle),
            Err(e) => {
                error!("Failed to build dongle {}: {}", config.hci_device, e);
                dongle.destroy().await;
                Err(e)
            }
        }
    }
}
