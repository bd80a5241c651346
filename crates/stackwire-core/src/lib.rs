//! Stackwire Core - Core types shared by the broker client crates
//!
//! This crate provides the foundational types for the Stackwire system:
//! - Device identifiers (base58 uids) and device type tags
//! - Connection, enumeration and device callback events
//! - Retry policy used by the caller-side connect/enumerate loops

pub mod device;
pub mod event;
pub mod retry;

pub use device::{DeviceClass, DeviceType, Uid, UidError, Version};
pub use event::{
    ConnectionEvent, ConnectionReason, ConnectionState, DeviceCallback, EnumerationEvent,
    EnumerationReason, Event,
};
pub use retry::RetryPolicy;
