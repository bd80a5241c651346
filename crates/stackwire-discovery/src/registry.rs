//! Live set of attached devices
//!
//! [`DeviceRegistry::on_enumeration_event`] is the only way records change.
//! The map lock is held for map operations only; driver construction, release
//! and observers always run with it released.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stackwire_core::{
    ConnectionEvent, ConnectionState, DeviceClass, DeviceType, EnumerationEvent, Event, Uid,
    Version,
};
use stackwire_transport::{
    CallbackDispatcher, EventFilter, HandlerResult, HandlerToken, TransportConnection,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::factory::{ConstructionError, DriverFactory};
use crate::link::{DeviceLink, Driver};

/// What happens to records when the connection goes away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossPolicy {
    /// Keep records; re-enumeration refreshes them
    #[default]
    KeepDevices,
    /// Release every record on disconnect
    DetachAll,
}

/// Serializable description of an attached device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub uid: Uid,
    pub device_type: DeviceType,
    pub name: Option<String>,
    pub class: DeviceClass,
    pub parent: Option<Uid>,
    pub position: char,
    pub hardware_version: Version,
    pub firmware_version: Version,
    pub attached_at: DateTime<Utc>,
}

impl DeviceInfo {
    fn from_event(event: &EnumerationEvent) -> Self {
        Self {
            uid: event.uid.clone(),
            device_type: event.device_type,
            name: event.device_type.name().map(str::to_string),
            class: event.device_type.class(),
            parent: event.parent.clone(),
            position: event.position,
            hardware_version: event.hardware_version,
            firmware_version: event.firmware_version,
            attached_at: Utc::now(),
        }
    }
}

/// One attached device and the driver owned for it
#[derive(Clone)]
pub struct DeviceRecord {
    pub info: DeviceInfo,
    pub driver: Arc<dyn Driver>,
    link: Arc<DeviceLink>,
}

impl DeviceRecord {
    pub fn uid(&self) -> &Uid {
        &self.info.uid
    }

    pub fn device_type(&self) -> DeviceType {
        self.info.device_type
    }

    pub fn driver_as<T: Driver>(&self) -> Option<Arc<T>> {
        self.driver.clone().into_any().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("info", &self.info)
            .field("link", &self.link)
            .finish()
    }
}

/// Registry transition, broadcast to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Attached { device: DeviceInfo },
    Replaced { previous: DeviceInfo, device: DeviceInfo },
    Detached { device: DeviceInfo },
    Rejected {
        uid: Uid,
        device_type: DeviceType,
        reason: String,
    },
    Cleared { count: usize },
}

/// Outcome of applying one enumeration event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    Inserted,
    Replaced,
    Removed,
    /// Detach for a uid that was not present
    Ignored,
    /// No driver for the device type
    Unsupported,
    /// Driver construction failed
    Rejected,
}

pub struct DeviceRegistry {
    devices: Mutex<HashMap<Uid, DeviceRecord>>,
    factory: DriverFactory,
    connection: TransportConnection,
    dispatcher: CallbackDispatcher,
    policy: LossPolicy,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    pub fn new(
        factory: DriverFactory,
        connection: TransportConnection,
        dispatcher: CallbackDispatcher,
        policy: LossPolicy,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(100);
        Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            factory,
            connection,
            dispatcher,
            policy,
            events,
        })
    }

    /// Feed enumeration and connection events from `dispatcher` into the registry
    pub fn attach(self: &Arc<Self>) -> Vec<HandlerToken> {
        let weak = Arc::downgrade(self);
        let enumeration = self
            .dispatcher
            .register_async(EventFilter::Enumeration, move |event| {
                handle_enumeration(weak.clone(), event)
            });

        let weak = Arc::downgrade(self);
        let connection = self.dispatcher.on_connection(move |event| {
            if let Some(registry) = weak.upgrade() {
                registry.on_connection_event(event);
            }
            Ok(())
        });

        vec![enumeration, connection]
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn policy(&self) -> LossPolicy {
        self.policy
    }

    pub fn factory(&self) -> &DriverFactory {
        &self.factory
    }

    /// Apply one enumeration event
    pub async fn on_enumeration_event(&self, event: &EnumerationEvent) -> RegistryChange {
        let uid = &event.uid;
        let previous = self.devices.lock().remove(uid);
        if let Some(previous) = &previous {
            self.release(previous);
        }

        if !event.reason.is_attach() {
            return match previous {
                Some(record) => {
                    info!(uid = %uid, device_type = %record.info.device_type, "Device detached");
                    self.publish(RegistryEvent::Detached { device: record.info });
                    RegistryChange::Removed
                }
                None => {
                    debug!(uid = %uid, "Detach for unknown device ignored");
                    RegistryChange::Ignored
                }
            };
        }

        if !self.factory.supports(event.device_type) {
            debug!(uid = %uid, device_type = %event.device_type, "Ignoring device without driver");
            self.forget(previous);
            self.publish(RegistryEvent::Rejected {
                uid: uid.clone(),
                device_type: event.device_type,
                reason: "unsupported device type".to_string(),
            });
            return RegistryChange::Unsupported;
        }

        let link = match DeviceLink::new(
            uid.clone(),
            self.connection.clone(),
            self.dispatcher.clone(),
            self.factory.settings().response_timeout,
        ) {
            Ok(link) => Arc::new(link),
            Err(e) => return self.reject(event, previous, ConstructionError::from(e)),
        };

        match self.factory.create(event.device_type, link.clone()).await {
            Ok(Some(driver)) => self.insert(event, previous, driver, link),
            Ok(None) => {
                link.release();
                self.forget(previous);
                RegistryChange::Unsupported
            }
            Err(e) => {
                link.release();
                self.reject(event, previous, e)
            }
        }
    }

    fn insert(
        &self,
        event: &EnumerationEvent,
        previous: Option<DeviceRecord>,
        driver: Arc<dyn Driver>,
        link: Arc<DeviceLink>,
    ) -> RegistryChange {
        let record = DeviceRecord {
            info: DeviceInfo::from_event(event),
            driver,
            link,
        };
        let device = record.info.clone();
        let displaced = self.devices.lock().insert(event.uid.clone(), record);
        if let Some(displaced) = &displaced {
            self.release(displaced);
        }

        match previous.or(displaced) {
            Some(previous) => {
                info!(
                    uid = %device.uid,
                    device_type = %device.device_type,
                    previous_type = %previous.info.device_type,
                    "Device replaced"
                );
                self.publish(RegistryEvent::Replaced {
                    previous: previous.info,
                    device,
                });
                RegistryChange::Replaced
            }
            None => {
                info!(
                    uid = %device.uid,
                    device_type = %device.device_type,
                    reason = ?event.reason,
                    "Device attached"
                );
                self.publish(RegistryEvent::Attached { device });
                RegistryChange::Inserted
            }
        }
    }

    fn reject(
        &self,
        event: &EnumerationEvent,
        previous: Option<DeviceRecord>,
        error: ConstructionError,
    ) -> RegistryChange {
        warn!(
            uid = %event.uid,
            device_type = %event.device_type,
            error = %error,
            "Driver construction failed, device left absent"
        );
        self.forget(previous);
        self.publish(RegistryEvent::Rejected {
            uid: event.uid.clone(),
            device_type: event.device_type,
            reason: error.to_string(),
        });
        RegistryChange::Rejected
    }

    /// Report a prior record dropped because its uid no longer has a driver
    fn forget(&self, previous: Option<DeviceRecord>) {
        if let Some(record) = previous {
            info!(uid = %record.info.uid, "Device removed");
            self.publish(RegistryEvent::Detached { device: record.info });
        }
    }

    fn release(&self, record: &DeviceRecord) {
        if record.link.release() {
            record.driver.on_release();
        }
    }

    fn publish(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    /// Apply the loss policy to a connection-state change
    pub fn on_connection_event(&self, event: ConnectionEvent) -> usize {
        if self.policy == LossPolicy::DetachAll && event.state == ConnectionState::Disconnected {
            self.clear()
        } else {
            0
        }
    }

    /// Release every record
    pub fn clear(&self) -> usize {
        let records: Vec<DeviceRecord> = self.devices.lock().drain().map(|(_, r)| r).collect();
        for record in &records {
            self.release(record);
        }
        let count = records.len();
        if count > 0 {
            info!(count, "Registry cleared");
            self.publish(RegistryEvent::Cleared { count });
        }
        count
    }

    pub fn get(&self, uid: &Uid) -> Option<DeviceRecord> {
        self.devices.lock().get(uid).cloned()
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.devices.lock().contains_key(uid)
    }

    pub fn driver(&self, uid: &Uid) -> Option<Arc<dyn Driver>> {
        self.devices.lock().get(uid).map(|r| r.driver.clone())
    }

    /// Driver for `uid` if it is a `T`
    pub fn driver_as<T: Driver>(&self, uid: &Uid) -> Option<Arc<T>> {
        self.get(uid)?.driver_as::<T>()
    }

    /// First driver of type `T`, by uid order
    pub fn find_driver<T: Driver>(&self) -> Option<Arc<T>> {
        self.find_drivers::<T>().into_iter().next()
    }

    pub fn find_drivers<T: Driver>(&self) -> Vec<Arc<T>> {
        let mut records = self.records();
        records.sort_by(|a, b| a.info.uid.cmp(&b.info.uid));
        records.iter().filter_map(|r| r.driver_as::<T>()).collect()
    }

    fn records(&self) -> Vec<DeviceRecord> {
        self.devices.lock().values().cloned().collect()
    }

    /// Snapshot of every attached device, sorted by uid
    pub fn devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self.records().into_iter().map(|r| r.info).collect();
        devices.sort_by(|a, b| a.uid.cmp(&b.uid));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn handle_enumeration(registry: Weak<DeviceRegistry>, event: Event) -> HandlerResult {
    if let (Some(registry), Event::Enumeration(enumeration)) = (registry.upgrade(), &event) {
        registry.on_enumeration_event(enumeration).await;
    }
    Ok(())
}
