//! Locally hosted GATT applications
//!
//! An application is a tree of services and read-only characteristics rooted
//! at one object path. It is exported on the system bus and then handed to the
//! adapter's GATT manager, which serves it to connecting peripherals.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::Connection;

/// Produces the current value of a characteristic on every read
pub type ValueReader = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
pub struct GattCharacteristicDef {
    /// Last path segment, e.g. `CURRENTTIME`
    pub name: String,
    pub uuid: String,
    pub flags: Vec<String>,
    pub reader: ValueReader,
}

impl fmt::Debug for GattCharacteristicDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattCharacteristicDef")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct GattServiceDef {
    pub uuid: String,
    pub primary: bool,
    pub characteristics: Vec<GattCharacteristicDef>,
}

#[derive(Debug, Clone)]
pub struct GattApplication {
    /// Well-known bus name owned while the application is exported
    pub bus_name: String,
    /// Object path of the application root, which carries the object manager
    pub path: String,
    pub services: Vec<GattServiceDef>,
}

impl GattApplication {
    /// `de.hypfer.cybele` -> `/de/hypfer/cybele`
    pub fn path_for_name(bus_name: &str) -> String {
        format!("/{}", bus_name.split('.').collect::<Vec<_>>().join("/"))
    }

    /// Object path of every service, paired with its definition
    pub fn service_paths(&self) -> Vec<(String, &GattServiceDef)> {
        self.services
            .iter()
            .enumerate()
            .map(|(index, service)| (format!("{}/service{}", self.path, index), service))
            .collect()
    }

    /// Export every object of the application on `conn`
    pub(crate) async fn export(&self, conn: &Connection) -> zbus::Result<()> {
        conn.request_name(self.bus_name.as_str()).await?;

        let server = conn.object_server();
        server.at(self.path.as_str(), zbus::fdo::ObjectManager).await?;

        for (service_path, service) in self.service_paths() {
            server
                .at(
                    service_path.as_str(),
                    ServiceObject {
                        uuid: service.uuid.clone(),
                        primary: service.primary,
                    },
                )
                .await?;

            for characteristic in &service.characteristics {
                let path = format!("{}/{}", service_path, characteristic.name);
                server
                    .at(
                        path.as_str(),
                        CharacteristicObject {
                            service: OwnedObjectPath::try_from(service_path.clone())?,
                            definition: characteristic.clone(),
                        },
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Remove every exported object and release the bus name
    pub(crate) async fn unexport(&self, conn: &Connection) -> zbus::Result<()> {
        let server = conn.object_server();

        for (service_path, service) in self.service_paths() {
            for characteristic in &service.characteristics {
                let path = format!("{}/{}", service_path, characteristic.name);
                server.remove::<CharacteristicObject, _>(path.as_str()).await?;
            }
            server.remove::<ServiceObject, _>(service_path.as_str()).await?;
        }
        server
            .remove::<zbus::fdo::ObjectManager, _>(self.path.as_str())
            .await?;

        conn.release_name(self.bus_name.as_str()).await?;
        Ok(())
    }
}

struct ServiceObject {
    uuid: String,
    primary: bool,
}

#[zbus::interface(name = "org.bluez.GattService1")]
impl ServiceObject {
    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    #[zbus(property)]
    fn primary(&self) -> bool {
        self.primary
    }
}

struct CharacteristicObject {
    service: OwnedObjectPath,
    definition: GattCharacteristicDef,
}

#[zbus::interface(name = "org.bluez.GattCharacteristic1")]
impl CharacteristicObject {
    fn read_value(&self, options: HashMap<String, OwnedValue>) -> Vec<u8> {
        let value = (self.definition.reader)();

        if let Some(device) = options.get("device") {
            info!(
                "{} read by {:?}. Response: {}",
                self.definition.name,
                device,
                hex(&value)
            );
        }

        value
    }

    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.definition.uuid.clone()
    }

    #[zbus(property)]
    fn service(&self) -> OwnedObjectPath {
        self.service.clone()
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.definition.flags.clone()
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}
