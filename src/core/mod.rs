//! Core Module
//!
//! Adapter supervision and self-healing.
//!
//! ## Modules
//!
//! - [`gate`] - Per-adapter exclusivity gate for radio operations
//! - [`dongle`] - Supervisor of one adapter, its services and devices
//! - [`fleet`] - Owner of all dongles, recovers them after death
//! - [`factory`] - Builds dongles, devices and services from configuration

pub mod dongle;
pub mod factory;
pub mod fleet;
pub mod gate;
