//! Infrastructure Module
//!
//! Adapters to the outside world.
//!
//! ## Modules
//!
//! - [`bluez`] - Bluetooth management daemon over the system bus
//! - [`mqtt`] - Message transport to the broker
//! - [`logging`] - tracing subscriber setup

pub mod bluez;
pub mod logging;
pub mod mqtt;
