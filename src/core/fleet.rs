//! Fleet controller
//!
//! [`Cybele`] owns one [`Dongle`] per configured adapter and heals them: when a
//! dongle dies it is destroyed, and after a grace period the adapter is polled
//! until it is back on the bus, then rebuilt from the same configuration. An
//! adapter that does not come back in time is given up on.

use crate::core::dongle::Dongle;
use crate::core::factory::DongleFactory;
use crate::domain::error::{BridgeError, Result};
use crate::domain::settings::{DongleConfig, RecoverySettings};
use crate::infrastructure::bluez::adapter_path;
use crate::infrastructure::mqtt::InboundMessage;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct Cybele {
    factory: DongleFactory,
    recovery: RecoverySettings,
    dongles: Mutex<HashMap<String, Arc<Dongle>>>,
    /// Death listener per adapter; a listener also runs that adapter's recovery
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Cybele {
    pub fn new(factory: DongleFactory, recovery: RecoverySettings) -> Arc<Self> {
        Arc::new(Self {
            factory,
            recovery,
            dongles: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn dongles(&self) -> MutexGuard<'_, HashMap<String, Arc<Dongle>>> {
        lock(&self.dongles)
    }

    /// The live dongle of an adapter, if any
    #[cfg(test)]
    pub fn dongle(&self, hci_device: &str) -> Option<Arc<Dongle>> {
        self.dongles().get(hci_device).cloned()
    }

    /// Bring up every configured dongle in order; the first failure is returned
    pub async fn initialize(self: &Arc<Self>, configs: &[DongleConfig]) -> Result<()> {
        for config in configs {
            self.initialize_dongle(config.clone()).await?;
        }
        Ok(())
    }

    /// Build a dongle, register it and watch it for death
    pub fn initialize_dongle(
        self: &Arc<Self>,
        config: DongleConfig,
    ) -> BoxFuture<'static, Result<()>> {
        let fleet = self.clone();
        async move {
            let dongle = fleet.factory.manufacture(&config).await?;
            fleet
                .dongles()
                .insert(config.hci_device.clone(), dongle.clone());
            info!("Dongle {} is up", dongle.hci_device());

            let hci_device = config.hci_device.clone();
            let mut death = dongle.death();
            let listener = fleet.clone();
            let handle = tokio::spawn(async move {
                if death.wait_for(|dead| *dead).await.is_ok() {
                    listener.recover(config, dongle).await;
                }
            });
            // A replaced handle belongs to the recovery that is finishing right now
            lock(&fleet.listeners).insert(hci_device, handle);
            Ok(())
        }
        .boxed()
    }

    async fn recover(self: Arc<Self>, config: DongleConfig, dongle: Arc<Dongle>) {
        let hci_device = config.hci_device.clone();
        info!("Dongle {} died", hci_device);

        dongle.destroy().await;
        {
            let mut dongles = self.dongles();
            if dongles
                .get(&hci_device)
                .is_some_and(|current| Arc::ptr_eq(current, &dongle))
            {
                dongles.remove(&hci_device);
            }
        }

        // Give the adapter time to disappear from the bus completely
        tokio::time::sleep(self.recovery.grace_period()).await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.wait_for_adapter(&hci_device).await {
            error!("FATAL: Failed to reinitialize dongle {}: {}", hci_device, e);
            return;
        }

        match self.initialize_dongle(config).await {
            Ok(()) => info!("Successfully reinitialized dongle {}", hci_device),
            Err(e) => error!("Failed to reinitialize dongle {}: {}", hci_device, e),
        }
    }

    /// Poll until the adapter interface is back, bounded by the reappearance timeout
    pub async fn wait_for_adapter(&self, hci_device: &str) -> Result<()> {
        let path = adapter_path(hci_device);
        let bus = self.factory.bus();
        let poll = async {
            while !bus.adapter_present(&path).await {
                tokio::time::sleep(self.recovery.reappearance_poll()).await;
            }
        };

        tokio::time::timeout(self.recovery.reappearance_timeout(), poll)
            .await
            .map_err(|_| {
                BridgeError::timeout(
                    self.recovery.reappearance_timeout(),
                    format!("adapter {} to reappear", hci_device),
                )
            })
    }

    /// Hand an inbound transport message to every device of every dongle
    pub async fn route_message(&self, message: &InboundMessage) {
        let dongles: Vec<Arc<Dongle>> = self.dongles().values().cloned().collect();
        for dongle in dongles {
            dongle.route_message(&message.topic, &message.payload).await;
        }
    }

    /// Tear down every dongle and stop recovering
    pub async fn destroy(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let dongles: Vec<Arc<Dongle>> = self.dongles().drain().map(|(_, d)| d).collect();
        for dongle in dongles {
            dongle.destroy().await;
        }
        for (_, listener) in lock(&self.listeners).drain() {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::eqiva::REQUEST_UUID;
    use crate::domain::error::BusError;
    use crate::domain::models::{BusMessage, BusValue, DongleState, WriteMode};
    use crate::domain::settings::MqttSettings;
    use crate::infrastructure::bluez::{ADAPTER_INTERFACE, DEVICE_INTERFACE};
    use crate::testing::{BusCall, FakeBus, FakeTransport};
    use serde_json::json;
    use std::time::Duration;

    fn fleet(bus: Arc<FakeBus>, transport: Arc<FakeTransport>) -> Arc<Cybele> {
        Cybele::new(
            DongleFactory::new(bus, transport, &MqttSettings::default()),
            RecoverySettings::default(),
        )
    }

    fn dongle_config(devices: serde_json::Value) -> DongleConfig {
        serde_json::from_value(json!({ "hciDevice": "hci0", "mode": "le", "devices": devices }))
            .unwrap()
    }

    fn power_loss() -> BusMessage {
        BusMessage {
            path: "/org/bluez/hci0".into(),
            body: BusValue::Array(vec![
                BusValue::Str(ADAPTER_INTERFACE.into()),
                BusValue::Dict(vec![(
                    BusValue::Str("Powered".into()),
                    BusValue::variant(BusValue::Bool(false)),
                )]),
            ]),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_death_recovery_round_trip() {
        let bus = Arc::new(FakeBus::new());
        let cybele = fleet(bus.clone(), Arc::new(FakeTransport::new()));
        cybele.initialize(&[dongle_config(json!([]))]).await.unwrap();
        let first = cybele.dongle("hci0").unwrap();

        bus.emit(power_loss()).await;
        settle().await;
        assert_eq!(first.state(), DongleState::Destroyed);
        assert!(cybele.dongle("hci0").is_none());

        // The adapter is not polled during the grace period
        tokio::time::sleep(Duration::from_millis(2400)).await;
        settle().await;
        assert_eq!(bus.calls_to("StartDiscovery").len(), 1);

        // The adapter comes back a few polls later
        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(bus.calls_to("StartDiscovery").len(), 1);
        bus.set_adapter_present("/org/bluez/hci0", true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;

        assert_eq!(bus.calls_to("StartDiscovery").len(), 2);
        let second = cybele.dongle("hci0").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), DongleState::Discovering);

        cybele.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_death_during_initialize_is_recovered() {
        let bus = Arc::new(FakeBus::new());
        bus.set_adapter_present("/org/bluez/hci0", true);
        bus.fail_next(
            "StartDiscovery",
            BusError::remote("org.bluez.Error.InProgress", "Operation already in progress"),
        );
        let cybele = fleet(bus.clone(), Arc::new(FakeTransport::new()));
        cybele.initialize(&[dongle_config(json!([]))]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2600)).await;
        settle().await;

        assert_eq!(bus.calls_to("StartDiscovery").len(), 2);
        assert_eq!(
            cybele.dongle("hci0").map(|d| d.state()),
            Some(DongleState::Discovering)
        );
        cybele.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_that_never_returns_is_given_up() {
        let bus = Arc::new(FakeBus::new());
        let cybele = fleet(bus.clone(), Arc::new(FakeTransport::new()));
        cybele.initialize(&[dongle_config(json!([]))]).await.unwrap();

        bus.emit(power_loss()).await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(2500 + 15_000 + 100)).await;
        settle().await;

        // Reappearing later changes nothing
        bus.set_adapter_present("/org/bluez/hci0", true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;

        assert!(cybele.dongle("hci0").is_none());
        assert_eq!(bus.calls_to("StartDiscovery").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_a_pending_recovery() {
        let bus = Arc::new(FakeBus::new());
        let cybele = fleet(bus.clone(), Arc::new(FakeTransport::new()));
        cybele.initialize(&[dongle_config(json!([]))]).await.unwrap();

        bus.emit(power_loss()).await;
        settle().await;
        // Past the grace period, polling for the adapter
        tokio::time::sleep(Duration::from_millis(2600)).await;
        settle().await;

        cybele.destroy().await;
        assert!(lock(&cybele.listeners).is_empty());

        bus.set_adapter_present("/org/bluez/hci0", true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;

        assert!(cybele.dongle("hci0").is_none());
        assert_eq!(bus.calls_to("StartDiscovery").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_round_trip() {
        let bus = Arc::new(FakeBus::new());
        let transport = Arc::new(FakeTransport::new());
        let path = "/org/bluez/hci0/dev_00_1A_22_0C_00_01";
        bus.add_device(path);
        bus.set_property(path, DEVICE_INTERFACE, "ServicesResolved", BusValue::Bool(true));
        bus.add_characteristic(path, "service0400/char0410", REQUEST_UUID);
        bus.add_characteristic(
            path,
            "service0400/char0420",
            crate::devices::eqiva::RESPONSE_UUID,
        );

        let cybele = fleet(bus.clone(), transport.clone());
        cybele
            .initialize(&[dongle_config(json!([{
                "type": "EqivaThermostatDevice",
                "friendlyName": "Living room",
                "mac": "00:1A:22:0C:00:01",
                "pollingInterval": 300000
            }]))])
            .await
            .unwrap();

        cybele
            .route_message(&InboundMessage {
                topic: "cybele/eqiva_thermostat/001a220c0001/set_boost".into(),
                payload: "true".into(),
            })
            .await;
        // Unparseable JSON still reaches the handler, which rejects it quietly
        cybele
            .route_message(&InboundMessage {
                topic: "cybele/eqiva_thermostat/001a220c0001/set_offset".into(),
                payload: "{\"offset\":".into(),
            })
            .await;
        // Foreign topics are ignored
        cybele
            .route_message(&InboundMessage {
                topic: "cybele/eqiva_thermostat/ffffffffffff/set_boost".into(),
                payload: "true".into(),
            })
            .await;
        settle().await;

        assert_eq!(
            bus.calls_to("WriteValue"),
            vec![BusCall::WriteValue(
                format!("{}/service0400/char0410", path),
                vec![0x45, 0x01],
                WriteMode::Request,
            )]
        );
        cybele.destroy().await;
    }

    #[tokio::test]
    async fn test_startup_failure_is_returned() {
        let bus = Arc::new(FakeBus::new());
        let cybele = fleet(bus, Arc::new(FakeTransport::new()));
        let result = cybele
            .initialize(&[dongle_config(json!([{ "type": "GlanceClockDevice" }]))])
            .await;
        assert!(result.is_err());
        assert!(cybele.dongle("hci0").is_none());
    }
}
