//! In-process fakes for the bus and the message transport

use crate::core::gate::ExclusivityGate;
use crate::devices::context::{DeviceContext, DeviceDeps, DeviceOptions};
use crate::domain::error::{BusError, TransportError};
use crate::domain::models::{BusMessage, BusValue, DiscoveryFilter, WriteMode};
use crate::infrastructure::bluez::{
    BluetoothBus, BusSubscription, GattApplication, GATT_CHARACTERISTIC_INTERFACE,
};
use crate::infrastructure::mqtt::MessageTransport;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum BusCall {
    StopDiscovery(String),
    SetDiscoveryFilter(String, DiscoveryFilter),
    StartDiscovery(String),
    RegisterApplication(String, String),
    UnregisterApplication(String, String),
    Subscribe(String),
    Connect(String),
    Disconnect(String),
    GetProperty(String, String, String),
    Introspect(String),
    ReadValue(String),
    WriteValue(String, Vec<u8>, WriteMode),
    StartNotify(String),
    StopNotify(String),
}

impl BusCall {
    pub fn method(&self) -> &'static str {
        match self {
            Self::StopDiscovery(_) => "StopDiscovery",
            Self::SetDiscoveryFilter(..) => "SetDiscoveryFilter",
            Self::StartDiscovery(_) => "StartDiscovery",
            Self::RegisterApplication(..) => "RegisterApplication",
            Self::UnregisterApplication(..) => "UnregisterApplication",
            Self::Subscribe(_) => "Subscribe",
            Self::Connect(_) => "Connect",
            Self::Disconnect(_) => "Disconnect",
            Self::GetProperty(..) => "GetProperty",
            Self::Introspect(_) => "Introspect",
            Self::ReadValue(_) => "ReadValue",
            Self::WriteValue(..) => "WriteValue",
            Self::StartNotify(_) => "StartNotify",
            Self::StopNotify(_) => "StopNotify",
        }
    }
}

#[derive(Default)]
pub struct FakeBus {
    calls: Mutex<Vec<BusCall>>,
    failures: Mutex<HashMap<&'static str, VecDeque<BusError>>>,
    adapters: Mutex<HashSet<String>>,
    devices: Mutex<HashSet<String>>,
    properties: Mutex<HashMap<(String, String, String), BusValue>>,
    nodes: Mutex<HashMap<String, Vec<String>>>,
    values: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    subscribers: Mutex<Vec<(String, mpsc::Sender<BusMessage>)>>,
    exported: Mutex<HashSet<String>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<BusCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<BusCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.method() == method)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Make the next call of `method` fail with `error`
    pub fn fail_next(&self, method: &'static str, error: BusError) {
        self.failures
            .lock()
            .unwrap()
            .entry(method)
            .or_default()
            .push_back(error);
    }

    pub fn set_adapter_present(&self, adapter_path: &str, present: bool) {
        let mut adapters = self.adapters.lock().unwrap();
        if present {
            adapters.insert(adapter_path.to_string());
        } else {
            adapters.remove(adapter_path);
        }
    }

    pub fn add_device(&self, device_path: &str) {
        self.devices.lock().unwrap().insert(device_path.to_string());
    }

    pub fn set_property(&self, path: &str, interface: &str, name: &str, value: BusValue) {
        self.properties.lock().unwrap().insert(
            (path.to_string(), interface.to_string(), name.to_string()),
            value,
        );
    }

    /// Expose `serviceXXXX/charYYYY` below a device with the given UUID
    pub fn add_characteristic(&self, device_path: &str, handle: &str, uuid: &str) {
        let (service, characteristic) = handle.split_once('/').unwrap();
        let service_path = format!("{}/{}", device_path, service);
        let mut nodes = self.nodes.lock().unwrap();

        let services = nodes.entry(device_path.to_string()).or_default();
        if !services.iter().any(|s| s == service) {
            services.push(service.to_string());
        }
        nodes
            .entry(service_path.clone())
            .or_default()
            .push(characteristic.to_string());
        drop(nodes);

        self.set_property(
            &format!("{}/{}", service_path, characteristic),
            GATT_CHARACTERISTIC_INTERFACE,
            "UUID",
            BusValue::Str(uuid.to_string()),
        );
    }

    /// Queue a value returned by the next read of `path` (the last one repeats)
    pub fn push_read_value(&self, path: &str, value: &[u8]) {
        self.values
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(value.to_vec());
    }

    /// Deliver a signal to every subscriber whose adapter contains `message.path`
    pub async fn emit(&self, message: BusMessage) {
        let targets: Vec<mpsc::Sender<BusMessage>> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|(adapter, _)| message.path.starts_with(adapter.as_str()))
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in targets {
            let _ = tx.send(message.clone()).await;
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    fn record(&self, call: BusCall) -> Result<(), BusError> {
        let method = call.method();
        self.calls.lock().unwrap().push(call);
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn unknown_object(path: &str) -> BusError {
    BusError::remote(
        "org.freedesktop.DBus.Error.UnknownObject",
        format!("Unknown object '{}'", path),
    )
}

#[async_trait]
impl BluetoothBus for FakeBus {
    async fn stop_discovery(&self, adapter_path: &str) -> Result<(), BusError> {
        self.record(BusCall::StopDiscovery(adapter_path.to_string()))
    }

    async fn set_discovery_filter(
        &self,
        adapter_path: &str,
        filter: &DiscoveryFilter,
    ) -> Result<(), BusError> {
        self.record(BusCall::SetDiscoveryFilter(
            adapter_path.to_string(),
            filter.clone(),
        ))
    }

    async fn start_discovery(&self, adapter_path: &str) -> Result<(), BusError> {
        self.record(BusCall::StartDiscovery(adapter_path.to_string()))
    }

    async fn adapter_present(&self, adapter_path: &str) -> bool {
        self.adapters.lock().unwrap().contains(adapter_path)
    }

    async fn register_application(
        &self,
        adapter_path: &str,
        application: &GattApplication,
    ) -> Result<(), BusError> {
        if !self.exported.lock().unwrap().insert(application.path.clone()) {
            return Err(BusError::remote(
                "org.freedesktop.DBus.Error.ObjectPathInUse",
                format!("Object path already used: {}", application.path),
            ));
        }
        let registered = self.record(BusCall::RegisterApplication(
            adapter_path.to_string(),
            application.path.clone(),
        ));
        if registered.is_err() {
            self.exported.lock().unwrap().remove(&application.path);
        }
        registered
    }

    async fn unregister_application(
        &self,
        adapter_path: &str,
        application: &GattApplication,
    ) -> Result<(), BusError> {
        self.exported.lock().unwrap().remove(&application.path);
        self.record(BusCall::UnregisterApplication(
            adapter_path.to_string(),
            application.path.clone(),
        ))
    }

    async fn subscribe(&self, adapter_path: &str) -> Result<BusSubscription, BusError> {
        self.record(BusCall::Subscribe(adapter_path.to_string()))?;
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .lock()
            .unwrap()
            .push((adapter_path.to_string(), tx));
        Ok(rx)
    }

    async fn device_present(&self, device_path: &str) -> bool {
        self.devices.lock().unwrap().contains(device_path)
    }

    async fn connect(&self, device_path: &str) -> Result<(), BusError> {
        self.record(BusCall::Connect(device_path.to_string()))
    }

    async fn disconnect(&self, device_path: &str) -> Result<(), BusError> {
        self.record(BusCall::Disconnect(device_path.to_string()))
    }

    async fn get_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<BusValue, BusError> {
        self.record(BusCall::GetProperty(
            path.to_string(),
            interface.to_string(),
            name.to_string(),
        ))?;
        self.properties
            .lock()
            .unwrap()
            .get(&(path.to_string(), interface.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| unknown_object(path))
    }

    async fn introspect(&self, path: &str) -> Result<Vec<String>, BusError> {
        self.record(BusCall::Introspect(path.to_string()))?;
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_value(&self, characteristic_path: &str) -> Result<Vec<u8>, BusError> {
        self.record(BusCall::ReadValue(characteristic_path.to_string()))?;
        let mut values = self.values.lock().unwrap();
        let queue = values
            .get_mut(characteristic_path)
            .ok_or_else(|| unknown_object(characteristic_path))?;
        match queue.len() {
            0 => Err(unknown_object(characteristic_path)),
            1 => Ok(queue[0].clone()),
            _ => Ok(queue.pop_front().unwrap_or_default()),
        }
    }

    async fn write_value(
        &self,
        characteristic_path: &str,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BusError> {
        self.record(BusCall::WriteValue(
            characteristic_path.to_string(),
            value.to_vec(),
            mode,
        ))
    }

    async fn start_notify(&self, characteristic_path: &str) -> Result<(), BusError> {
        self.record(BusCall::StartNotify(characteristic_path.to_string()))
    }

    async fn stop_notify(&self, characteristic_path: &str) -> Result<(), BusError> {
        self.record(BusCall::StopNotify(characteristic_path.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Default)]
pub struct FakeTransport {
    published: Mutex<Vec<Published>>,
    subscribed: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }
}

#[async_trait]
impl MessageTransport for FakeTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: String,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.subscribed.lock().unwrap().extend(topics.iter().cloned());
        Ok(())
    }
}

/// Dependencies of devices on `hci0`
pub fn device_deps(bus: Arc<FakeBus>, transport: Arc<FakeTransport>) -> DeviceDeps {
    DeviceDeps {
        hci_device: "hci0".to_string(),
        gate: ExclusivityGate::new("hci0"),
        bus,
        transport,
        topic_prefix: "cybele".to_string(),
        discovery_prefix: "homeassistant".to_string(),
    }
}

pub fn device_context(
    bus: Arc<FakeBus>,
    transport: Arc<FakeTransport>,
    friendly_name: &str,
    mac: &str,
) -> DeviceContext {
    DeviceContext::new(
        &device_deps(bus, transport),
        &DeviceOptions {
            friendly_name: friendly_name.to_string(),
            mac: mac.to_string(),
        },
    )
}
