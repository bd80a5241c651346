//! Inbound events delivered through the callback dispatcher

use serde::{Deserialize, Serialize};

use crate::device::{DeviceType, Uid, Version};

/// State of the broker connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Why the connection state changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionReason {
    /// Caller asked for it (`connect()` / `disconnect()`)
    Requested,
    /// Unsolicited loss, or the reconnect that follows one
    AutoReconnect,
}

/// Connection-state change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    pub reason: ConnectionReason,
}

impl ConnectionEvent {
    pub fn new(state: ConnectionState, reason: ConnectionReason) -> Self {
        Self { state, reason }
    }

    /// True for the event emitted when the channel closed without being asked to
    pub fn is_unsolicited_loss(&self) -> bool {
        self.state == ConnectionState::Disconnected
            && self.reason == ConnectionReason::AutoReconnect
    }

    pub fn is_requested_disconnect(&self) -> bool {
        self.state == ConnectionState::Disconnected && self.reason == ConnectionReason::Requested
    }
}

/// Why an enumeration event was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationReason {
    /// Answer to an enumerate request for a module that was already attached
    AlreadyPresentAtConnect,
    /// Module was plugged in (or powered up) while connected
    NewlyAttached,
    /// Module was unplugged
    Detached,
}

impl EnumerationReason {
    /// Decode the enumeration type byte (0 available, 1 connected, 2 disconnected)
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AlreadyPresentAtConnect),
            1 => Some(Self::NewlyAttached),
            2 => Some(Self::Detached),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::AlreadyPresentAtConnect => 0,
            Self::NewlyAttached => 1,
            Self::Detached => 2,
        }
    }

    pub fn is_attach(self) -> bool {
        !matches!(self, Self::Detached)
    }
}

/// A module appeared or disappeared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationEvent {
    pub uid: Uid,
    /// Parent module (None for top-level modules)
    pub parent: Option<Uid>,
    /// Port or slot on the parent
    pub position: char,
    pub hardware_version: Version,
    pub firmware_version: Version,
    pub device_type: DeviceType,
    pub reason: EnumerationReason,
}

impl EnumerationEvent {
    /// Attach event with no parent and zeroed versions
    pub fn attached(uid: impl Into<Uid>, device_type: DeviceType) -> Self {
        Self {
            uid: uid.into(),
            parent: None,
            position: '0',
            hardware_version: Version::default(),
            firmware_version: Version::default(),
            device_type,
            reason: EnumerationReason::NewlyAttached,
        }
    }

    /// Detach event; the broker reports only the uid for these
    pub fn detached(uid: impl Into<Uid>) -> Self {
        Self {
            reason: EnumerationReason::Detached,
            ..Self::attached(uid, DeviceType(0))
        }
    }

    pub fn with_reason(mut self, reason: EnumerationReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<Uid>, position: char) -> Self {
        self.parent = Some(parent.into());
        self.position = position;
        self
    }
}

/// Asynchronous callback emitted by a module (e.g. a periodic sensor reading)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCallback {
    /// Header uid; the only reliable key for modules with 64-bit uids
    pub wire_uid: u32,
    /// Printable form of `wire_uid`, for logging
    pub uid: Uid,
    pub function_id: u8,
    pub payload: Vec<u8>,
}

impl DeviceCallback {
    pub fn new(wire_uid: u32, function_id: u8, payload: Vec<u8>) -> Self {
        Self {
            wire_uid,
            uid: Uid::from_wire(wire_uid),
            function_id,
            payload,
        }
    }
}

/// Everything the read loop can hand to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connection(ConnectionEvent),
    Enumeration(EnumerationEvent),
    Callback(DeviceCallback),
}

impl Event {
    /// Short label used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connection(_) => "connection",
            Event::Enumeration(_) => "enumeration",
            Event::Callback(_) => "callback",
        }
    }
}
