//! Application state shared with the status server

use serde::Serialize;
use stackwire_core::{ConnectionState, Uid};
use stackwire_discovery::{DeviceInfo, DeviceRegistry, RegistryEvent};
use stackwire_transport::TransportConnection;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::station::{Reading, Station};

/// Connection summary served by `/api/connection`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub address: Option<String>,
    pub devices: usize,
}

/// Shared application state
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub connection: TransportConnection,
    pub station: Arc<Station>,
}

impl AppState {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        connection: TransportConnection,
        station: Arc<Station>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            connection,
            station,
        })
    }

    /// Get all attached devices
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.registry.devices()
    }

    /// Get an attached device by uid
    pub fn get_device(&self, uid: &str) -> Option<DeviceInfo> {
        self.registry.get(&Uid::new(uid)).map(|record| record.info)
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.station.readings()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.connection.state(),
            address: self.connection.address(),
            devices: self.registry.len(),
        }
    }

    /// Subscribe to registry transitions
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }
}
