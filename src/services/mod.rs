//! Services Module
//!
//! GATT services hosted by an adapter for peripherals to read from.
//!
//! ## Modules
//!
//! - [`current_time`] - Standard current time service

pub mod current_time;

use crate::devices::context::DeviceDeps;
use crate::domain::error::Result;
use crate::domain::settings::ComponentConfig;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Service: Send + Sync {
    /// Adapter scoped name, used in logs
    fn name(&self) -> &str;

    /// Export and register with the adapter
    async fn initialize(&self) -> Result<()>;

    /// Unregister; failures are logged, never returned
    async fn destroy(&self);
}

pub type SharedService = Arc<dyn Service>;

/// Builds a service from its config entry and the adapter's dependencies
pub type ServiceConstructor = fn(&ComponentConfig, &DeviceDeps) -> Result<SharedService>;

/// Registry of service types by their `type` string
pub fn constructor_for(kind: &str) -> Option<ServiceConstructor> {
    let constructor: ServiceConstructor = match kind {
        "CurrentTimeService" => current_time::CurrentTimeService::create,
        _ => return None,
    };
    Some(constructor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        assert!(constructor_for("CurrentTimeService").is_some());
        assert!(constructor_for("BatteryService").is_none());
    }
}
