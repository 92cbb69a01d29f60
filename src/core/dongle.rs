//! Adapter supervisor
//!
//! A [`Dongle`] owns one Bluetooth adapter together with the services it
//! hosts and the devices reached through it. It keeps discovery running,
//! dispatches bus signals to the devices in arrival order and watches the
//! adapter for signs of death. Recovery is the fleet's job; the dongle only
//! reports death through [`Dongle::death`].

use crate::core::gate::ExclusivityGate;
use crate::devices::SharedDevice;
use crate::domain::error::{BridgeError, Result};
use crate::domain::models::{BusMessage, DiscoveryFilter, DongleState, ScanMode};
use crate::domain::settings::{BrickWatchdogConfig, DongleConfig, TroubleshootingConfig};
use crate::infrastructure::bluez::props::{classify, BusEvent};
use crate::infrastructure::bluez::{adapter_path, BusSubscription, SharedBus};
use crate::services::SharedService;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Dongle {
    hci_device: String,
    adapter_path: String,
    mode: ScanMode,
    troubleshooting: TroubleshootingConfig,
    gate: ExclusivityGate,
    bus: SharedBus,
    services: Mutex<Vec<SharedService>>,
    devices: Mutex<Vec<SharedDevice>>,
    state: Mutex<DongleState>,
    death: watch::Sender<bool>,
    /// Woken by every device event while the brick watchdog runs
    activity: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Dongle {
    pub fn new(
        config: &DongleConfig,
        gate: ExclusivityGate,
        bus: SharedBus,
        services: Vec<SharedService>,
        devices: Vec<SharedDevice>,
    ) -> Arc<Self> {
        let (death, _) = watch::channel(false);
        Arc::new(Self {
            hci_device: config.hci_device.clone(),
            adapter_path: adapter_path(&config.hci_device),
            mode: config.mode,
            troubleshooting: config.troubleshooting.clone().unwrap_or_default(),
            gate,
            bus,
            services: Mutex::new(services),
            devices: Mutex::new(devices),
            state: Mutex::new(DongleState::Uninitialized),
            death,
            activity: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn hci_device(&self) -> &str {
        &self.hci_device
    }

    pub fn state(&self) -> DongleState {
        *lock(&self.state)
    }

    /// Resolves to `true` once the adapter is considered dead
    pub fn death(&self) -> watch::Receiver<bool> {
        self.death.subscribe()
    }

    #[cfg(test)]
    pub fn is_dead(&self) -> bool {
        *self.death.borrow()
    }

    fn is_destroyed(&self) -> bool {
        matches!(
            self.state(),
            DongleState::Destroying | DongleState::Destroyed
        )
    }

    fn set_state(&self, state: DongleState) {
        *lock(&self.state) = state;
    }

    fn devices(&self) -> Vec<SharedDevice> {
        lock(&self.devices).clone()
    }

    fn emit_death(&self) {
        if self.is_destroyed() {
            return;
        }
        self.set_state(DongleState::Dead);
        self.death.send_replace(true);
    }

    /// Start discovery, subscribe to the adapter's signals and arm the
    /// troubleshooting timers.
    ///
    /// A start refused with "Operation already in progress" is reported as
    /// death instead of an error.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        match self.restart_discovery().await {
            Ok(()) => {}
            Err(BridgeError::Bus(e)) if e.is_operation_in_progress() => {
                error!(
                    "Failed to start discovery on {}: {}. Treating the dongle as dead.",
                    self.hci_device, e
                );
                self.emit_death();
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let subscription = self.bus.subscribe(&self.adapter_path).await?;
        self.set_state(DongleState::Discovering);
        info!(
            "Started {} discovery on {}",
            self.mode.as_str(),
            self.hci_device
        );

        let mut tasks = vec![tokio::spawn(self.clone().dispatch(subscription))];
        if let Some(interval) = self.troubleshooting.scan_restart_interval {
            tasks.push(tokio::spawn(
                self.clone().rescan(Duration::from_millis(interval)),
            ));
        }
        if let Some(watchdog) = self.troubleshooting.brick_watchdog.clone() {
            tasks.push(tokio::spawn(self.clone().watchdog(watchdog)));
        }
        lock(&self.tasks).extend(tasks);
        Ok(())
    }

    async fn restart_discovery(&self) -> Result<()> {
        self.gate.exclusive(self.discovery_sequence()).await
    }

    /// Stop, filter, start. "No discovery started" on stop is not an error.
    async fn discovery_sequence(&self) -> Result<()> {
        match self.bus.stop_discovery(&self.adapter_path).await {
            Ok(()) => {}
            Err(e) if e.is_no_discovery_started() => {
                debug!("No discovery was running on {}", self.hci_device);
            }
            Err(e) => return Err(e.into()),
        }

        let filter = DiscoveryFilter {
            transport: self.mode,
            duplicate_data: true,
        };
        self.bus
            .set_discovery_filter(&self.adapter_path, &filter)
            .await?;
        self.bus.start_discovery(&self.adapter_path).await?;
        Ok(())
    }

    async fn dispatch(self: Arc<Self>, mut subscription: BusSubscription) {
        while let Some(message) = subscription.recv().await {
            if self.is_destroyed() {
                break;
            }
            self.handle_message(&message).await;
        }
        debug!("Bus subscription of {} ended", self.hci_device);
    }

    /// Route one bus signal to the devices of this adapter
    pub async fn handle_message(&self, message: &BusMessage) {
        let Some(event) = classify(message, &self.adapter_path) else {
            return;
        };

        if event.is_power_loss() {
            warn!("Dongle {} lost power", self.hci_device);
            self.emit_death();
            return;
        }

        match event {
            BusEvent::Device { device, properties } => {
                self.activity.notify_one();
                if properties.is_empty() {
                    return;
                }
                for handle in self.devices() {
                    handle.on_advertisement(&device, &properties).await;
                }
            }
            BusEvent::Characteristic {
                device,
                notification,
            } => {
                for handle in self.devices() {
                    handle.on_notification(&device, &notification).await;
                }
            }
            BusEvent::Adapter { .. } => {}
        }
    }

    /// Hand an inbound transport message to every device
    pub async fn route_message(&self, topic: &str, payload: &str) {
        for device in self.devices() {
            device.on_control_message(topic, payload).await;
        }
    }

    async fn rescan(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if self.is_destroyed() {
                return;
            }

            debug!("Restarting discovery on {}", self.hci_device);
            match self.restart_discovery().await {
                Ok(()) => {}
                Err(BridgeError::Bus(e)) if e.is_operation_in_progress() => {
                    error!(
                        "Failed to restart discovery on {}: {}. Treating the dongle as dead.",
                        self.hci_device, e
                    );
                    self.emit_death();
                    return;
                }
                Err(BridgeError::GateClosed) => return,
                Err(e) => warn!("Failed to restart discovery on {}: {}", self.hci_device, e),
            }
        }
    }

    async fn watchdog(self: Arc<Self>, config: BrickWatchdogConfig) {
        let timeout = Duration::from_millis(config.timeout);
        loop {
            if tokio::time::timeout(timeout, self.activity.notified())
                .await
                .is_ok()
            {
                continue;
            }
            if self.is_destroyed() {
                return;
            }

            error!(
                "No device events on {} for {} ms. The dongle might be bricked.",
                self.hci_device, config.timeout
            );
            if let Some(command) = &config.recovery_command {
                let hci_device = self.hci_device.clone();
                let command = command.clone();
                tokio::spawn(async move { run_recovery_command(&hci_device, &command).await });
            }

            // Once per silence; re-armed by the next device event
            self.activity.notified().await;
        }
    }

    /// Stop every timer, unsubscribe and tear down devices, then services.
    ///
    /// Never fails; problems are logged by the parts themselves.
    pub async fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }
        self.set_state(DongleState::Destroying);
        info!("Destroying dongle {}", self.hci_device);

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        let devices: Vec<SharedDevice> = lock(&self.devices).drain(..).collect();
        for device in devices {
            device.destroy().await;
        }
        let services: Vec<SharedService> = lock(&self.services).drain(..).collect();
        for service in services {
            service.destroy().await;
        }

        self.gate.close();
        self.set_state(DongleState::Destroyed);
    }
}

async fn run_recovery_command(hci_device: &str, command: &str) {
    info!("Running recovery command for {}: {}", hci_device, command);
    match Command::new("sh").arg("-c").arg(command).output().await {
        Ok(output) if output.status.success() => {
            info!("Recovery command for {} finished", hci_device)
        }
        Ok(output) => warn!(
            "Recovery command for {} exited with {}: {}",
            hci_device,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => error!("Failed to run recovery command for {}: {}", hci_device, e),
    }
}
