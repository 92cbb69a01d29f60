//! zbus backed [`BluetoothBus`]

use crate::domain::error::BusError;
use crate::domain::models::{BusMessage, BusValue, DiscoveryFilter, WriteMode};
use crate::infrastructure::bluez::{
    BluetoothBus, BusSubscription, GattApplication, ADAPTER_INTERFACE, BLUEZ_SERVICE,
    DEVICE_INTERFACE, GATT_CHARACTERISTIC_INTERFACE, GATT_MANAGER_INTERFACE,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zbus::zvariant::{Dict, ObjectPath, OwnedValue, Value};
use zbus::{Connection, MatchRule, Message, MessageStream};

const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
const SUBSCRIPTION_CAPACITY: usize = 256;

impl From<zbus::Error> for BusError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, description, _) => {
                BusError::remote(name.to_string(), description.unwrap_or_default())
            }
            zbus::Error::FDO(fdo) => BusError::Connection(fdo.to_string()),
            other => BusError::Connection(other.to_string()),
        }
    }
}

impl From<zbus::zvariant::Error> for BusError {
    fn from(err: zbus::zvariant::Error) -> Self {
        BusError::Connection(err.to_string())
    }
}

/// Shared system bus connection to BlueZ
#[derive(Clone)]
pub struct DbusBluetoothBus {
    conn: Connection,
}

impl DbusBluetoothBus {
    pub async fn system() -> Result<Self, BusError> {
        let conn = Connection::system().await?;
        Ok(Self { conn })
    }

    async fn call<B>(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        body: &B,
    ) -> Result<Message, BusError>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        debug!("{}.{} on {}", interface, method, path);
        let reply = self
            .conn
            .call_method(Some(BLUEZ_SERVICE), path, Some(interface), method, body)
            .await?;
        Ok(reply)
    }
}

#[async_trait]
impl BluetoothBus for DbusBluetoothBus {
    async fn stop_discovery(&self, adapter_path: &str) -> Result<(), BusError> {
        self.call(adapter_path, ADAPTER_INTERFACE, "StopDiscovery", &())
            .await?;
        Ok(())
    }

    async fn set_discovery_filter(
        &self,
        adapter_path: &str,
        filter: &DiscoveryFilter,
    ) -> Result<(), BusError> {
        let mut options: HashMap<&str, Value<'_>> = HashMap::new();
        options.insert("Transport", Value::from(filter.transport.as_str()));
        options.insert("DuplicateData", Value::from(filter.duplicate_data));

        self.call(
            adapter_path,
            ADAPTER_INTERFACE,
            "SetDiscoveryFilter",
            &(options,),
        )
        .await?;
        Ok(())
    }

    async fn start_discovery(&self, adapter_path: &str) -> Result<(), BusError> {
        self.call(adapter_path, ADAPTER_INTERFACE, "StartDiscovery", &())
            .await?;
        Ok(())
    }

    async fn adapter_present(&self, adapter_path: &str) -> bool {
        self.get_property(adapter_path, ADAPTER_INTERFACE, "Address")
            .await
            .is_ok()
    }

    async fn register_application(
        &self,
        adapter_path: &str,
        application: &GattApplication,
    ) -> Result<(), BusError> {
        application.export(&self.conn).await?;

        let options: HashMap<&str, Value<'_>> = HashMap::new();
        let app_path = ObjectPath::try_from(application.path.as_str())?;
        let registered = self
            .call(
                adapter_path,
                GATT_MANAGER_INTERFACE,
                "RegisterApplication",
                &(app_path, options),
            )
            .await;

        if let Err(e) = registered {
            if let Err(unexport) = application.unexport(&self.conn).await {
                warn!("Failed to unexport {}: {}", application.path, unexport);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn unregister_application(
        &self,
        adapter_path: &str,
        application: &GattApplication,
    ) -> Result<(), BusError> {
        let app_path = ObjectPath::try_from(application.path.as_str())?;
        let unregistered = self
            .call(
                adapter_path,
                GATT_MANAGER_INTERFACE,
                "UnregisterApplication",
                &(app_path,),
            )
            .await;

        // The objects and the bus name go away even when BlueZ refused.
        let unexported = application.unexport(&self.conn).await;
        unregistered?;
        unexported?;
        Ok(())
    }

    async fn subscribe(&self, adapter_path: &str) -> Result<BusSubscription, BusError> {
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(BLUEZ_SERVICE)?
            .interface(PROPERTIES_INTERFACE)?
            .member("PropertiesChanged")?
            .path_namespace(adapter_path.to_string())?
            .build();
        let mut stream =
            MessageStream::for_match_rule(rule, &self.conn, Some(SUBSCRIPTION_CAPACITY)).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let adapter = adapter_path.to_string();

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Signal stream error on {}: {}", adapter, e);
                        continue;
                    }
                };
                let Some(bus_message) = to_bus_message(&message) else {
                    continue;
                };
                if tx.send(bus_message).await.is_err() {
                    break;
                }
            }
            debug!("Signal subscription for {} ended", adapter);
        });

        Ok(rx)
    }

    async fn device_present(&self, device_path: &str) -> bool {
        self.get_property(device_path, DEVICE_INTERFACE, "Address")
            .await
            .is_ok()
    }

    async fn connect(&self, device_path: &str) -> Result<(), BusError> {
        self.call(device_path, DEVICE_INTERFACE, "Connect", &())
            .await?;
        Ok(())
    }

    async fn disconnect(&self, device_path: &str) -> Result<(), BusError> {
        self.call(device_path, DEVICE_INTERFACE, "Disconnect", &())
            .await?;
        Ok(())
    }

    async fn get_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<BusValue, BusError> {
        let reply = self
            .call(path, PROPERTIES_INTERFACE, "Get", &(interface, name))
            .await?;
        let value: OwnedValue = reply.body().deserialize()?;
        Ok(to_bus_value(&value))
    }

    async fn introspect(&self, path: &str) -> Result<Vec<String>, BusError> {
        let reply = self.call(path, INTROSPECTABLE_INTERFACE, "Introspect", &()).await?;
        let xml: String = reply.body().deserialize()?;

        let node = zbus_xml::Node::from_reader(xml.as_bytes()).map_err(|e| {
            BusError::UnexpectedReply {
                path: path.to_string(),
                detail: format!("Invalid introspection XML: {}", e),
            }
        })?;

        Ok(node
            .nodes()
            .iter()
            .filter_map(|child| child.name().map(str::to_string))
            .collect())
    }

    async fn read_value(&self, characteristic_path: &str) -> Result<Vec<u8>, BusError> {
        let options: HashMap<&str, Value<'_>> = HashMap::new();
        let reply = self
            .call(
                characteristic_path,
                GATT_CHARACTERISTIC_INTERFACE,
                "ReadValue",
                &(options,),
            )
            .await?;
        let value: Vec<u8> = reply.body().deserialize()?;
        Ok(value)
    }

    async fn write_value(
        &self,
        characteristic_path: &str,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BusError> {
        let mut options: HashMap<&str, Value<'_>> = HashMap::new();
        options.insert("type", Value::from(mode.as_str()));

        self.call(
            characteristic_path,
            GATT_CHARACTERISTIC_INTERFACE,
            "WriteValue",
            &(value.to_vec(), options),
        )
        .await?;
        Ok(())
    }

    async fn start_notify(&self, characteristic_path: &str) -> Result<(), BusError> {
        self.call(
            characteristic_path,
            GATT_CHARACTERISTIC_INTERFACE,
            "StartNotify",
            &(),
        )
        .await?;
        Ok(())
    }

    async fn stop_notify(&self, characteristic_path: &str) -> Result<(), BusError> {
        self.call(
            characteristic_path,
            GATT_CHARACTERISTIC_INTERFACE,
            "StopNotify",
            &(),
        )
        .await?;
        Ok(())
    }
}

/// `PropertiesChanged(s interface, a{sv} changed, as invalidated)`
fn to_bus_message(message: &Message) -> Option<BusMessage> {
    let header = message.header();
    let path = header.path()?.to_string();

    let body = message.body();
    let (interface, changed, invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
        match body.deserialize() {
            Ok(body) => body,
            Err(e) => {
                warn!("Undecodable PropertiesChanged on {}: {}", path, e);
                return None;
            }
        };

    let changed = changed
        .iter()
        .map(|(key, value)| {
            (
                BusValue::Str(key.clone()),
                BusValue::variant(to_bus_value(value)),
            )
        })
        .collect();

    Some(BusMessage {
        path,
        body: BusValue::Struct(vec![
            BusValue::Str(interface),
            BusValue::Dict(changed),
            BusValue::Array(invalidated.into_iter().map(BusValue::Str).collect()),
        ]),
    })
}

fn to_bus_value(value: &Value<'_>) -> BusValue {
    match value {
        Value::Bool(b) => BusValue::Bool(*b),
        Value::U8(v) => BusValue::Byte(*v),
        Value::I16(v) => BusValue::I16(*v),
        Value::U16(v) => BusValue::U16(*v),
        Value::I32(v) => BusValue::I32(*v),
        Value::U32(v) => BusValue::U32(*v),
        Value::I64(v) => BusValue::I64(*v),
        Value::U64(v) => BusValue::U64(*v),
        Value::F64(v) => BusValue::F64(*v),
        Value::Str(s) => BusValue::Str(s.to_string()),
        Value::ObjectPath(p) => BusValue::ObjectPath(p.to_string()),
        Value::Value(inner) => BusValue::variant(to_bus_value(inner)),
        Value::Array(array) if array.element_signature().as_str() == "y" => BusValue::Bytes(
            array
                .iter()
                .filter_map(|item| match item {
                    Value::U8(b) => Some(*b),
                    _ => None,
                })
                .collect(),
        ),
        Value::Array(array) => BusValue::Array(array.iter().map(to_bus_value).collect()),
        Value::Structure(structure) => {
            BusValue::Struct(structure.fields().iter().map(to_bus_value).collect())
        }
        Value::Dict(_) => dict_to_bus_value(value),
        other => BusValue::Unsupported(format!("{:?}", other)),
    }
}

/// Dicts are converted through the key types BlueZ uses (`a{sv}`, `a{qv}`, `a{yv}`).
/// Entries come out ordered by key.
fn dict_to_bus_value(value: &Value<'_>) -> BusValue {
    let dict = || {
        value
            .try_to_owned()
            .ok()
            .and_then(|v| Dict::try_from(Value::from(v)).ok())
    };

    if let Some(map) = dict().and_then(|d| BTreeMap::<String, OwnedValue>::try_from(d).ok()) {
        return BusValue::Dict(
            map.iter()
                .map(|(k, v)| (BusValue::Str(k.clone()), to_bus_value(v)))
                .collect(),
        );
    }
    if let Some(map) = dict().and_then(|d| BTreeMap::<u16, OwnedValue>::try_from(d).ok()) {
        return BusValue::Dict(
            map.iter()
                .map(|(k, v)| (BusValue::U16(*k), to_bus_value(v)))
                .collect(),
        );
    }
    if let Some(map) = dict().and_then(|d| BTreeMap::<u8, OwnedValue>::try_from(d).ok()) {
        return BusValue::Dict(
            map.iter()
                .map(|(k, v)| (BusValue::Byte(*k), to_bus_value(v)))
                .collect(),
        );
    }

    BusValue::Unsupported(format!("{:?}", value))
}
