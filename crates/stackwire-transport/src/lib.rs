//! Stackwire Transport - Broker connection and event dispatch
//!
//! This crate owns everything between the TCP socket and application handlers:
//! - Frame encoding/decoding for the broker protocol
//! - The connection with its read loop, request/response correlation and keep-alive probe
//! - The single ordered callback dispatcher
//! - An opt-in reconnect supervisor driven by a caller-supplied retry policy

pub mod connection;
pub mod dispatch;
pub mod frame;
pub mod reconnect;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use connection::{
    ConnectionOptions, DeviceErrorCode, TransportConnection, TransportError, DEFAULT_PORT,
};
pub use dispatch::{
    CallbackDispatcher, DispatcherRunning, EventFilter, EventSink, HandlerFault, HandlerResult,
    HandlerToken,
};
pub use frame::{Frame, FrameError, PayloadReader};
pub use reconnect::AutoReconnect;
