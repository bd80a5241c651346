//! Stackwire Discovery - Attached devices and their drivers
//!
//! This crate turns enumeration events into live, typed drivers:
//! - Enumeration requests, including re-enumeration after a connection loss
//! - The device registry keyed by uid
//! - The driver factory mapping device types to constructors
//! - Drivers for the Air Quality and LCD 128x64 Bricklets

pub mod drivers;
pub mod enumeration;
pub mod factory;
pub mod link;
pub mod registry;

pub use drivers::{AirQuality, AllValues, IaqAccuracy, Lcd128x64};
pub use enumeration::EnumerationService;
pub use factory::{ConstructionError, DriverFactory, DriverSettings};
pub use link::{DeviceLink, Driver};
pub use registry::{
    DeviceInfo, DeviceRecord, DeviceRegistry, LossPolicy, RegistryChange, RegistryEvent,
};
