//! Weather-station glue: sensor readings onto the display

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use stackwire_core::{DeviceType, Uid};
use stackwire_discovery::{
    AirQuality, AllValues, DeviceInfo, DeviceRegistry, Lcd128x64, RegistryEvent,
};
use stackwire_transport::TransportError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Latest reading of one Air Quality sensor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub uid: Uid,
    pub values: AllValues,
    pub temperature_celsius: f64,
    pub humidity_percent: f64,
    pub air_pressure_hpa: f64,
    pub received_at: DateTime<Utc>,
}

impl Reading {
    fn new(uid: Uid, values: AllValues) -> Self {
        Self {
            uid,
            values,
            temperature_celsius: values.temperature_celsius(),
            humidity_percent: values.humidity_percent(),
            air_pressure_hpa: values.air_pressure_hpa(),
            received_at: Utc::now(),
        }
    }
}

/// Display lines for one reading as (line, text)
pub fn display_lines(values: &AllValues) -> [(u8, String); 4] {
    [
        (2, format!("IAQ:      {:6}", values.iaq_index)),
        (3, format!("Temp:     {:6.2} \u{F8}C", values.temperature_celsius())),
        (4, format!("Humidity: {:6.2} %RH", values.humidity_percent())),
        (5, format!("Air Pres: {:6.1} mbar", values.air_pressure_hpa())),
    ]
}

#[derive(Default)]
struct ReadingBook {
    readings: RwLock<HashMap<Uid, Reading>>,
    latest: RwLock<Option<Uid>>,
}

impl ReadingBook {
    fn record(&self, uid: &Uid, values: AllValues) {
        self.readings
            .write()
            .insert(uid.clone(), Reading::new(uid.clone(), values));
        *self.latest.write() = Some(uid.clone());
    }
}

/// Subscribes to every attached Air Quality sensor and renders onto every attached display
pub struct Station {
    registry: Arc<DeviceRegistry>,
    book: Arc<ReadingBook>,
    updates: mpsc::UnboundedSender<AllValues>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<AllValues>>>,
}

impl Station {
    pub fn new(registry: Arc<DeviceRegistry>) -> Arc<Self> {
        let (updates, pending) = mpsc::unbounded_channel();
        Arc::new(Self {
            registry,
            book: Arc::new(ReadingBook::default()),
            updates,
            pending: Mutex::new(Some(pending)),
        })
    }

    /// Follow registry events; returns `None` if already started
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut updates = self.pending.lock().take()?;
        let mut events = self.registry.subscribe();

        // devices attached before start
        for device in self.registry.devices() {
            self.on_attached(&device);
        }

        let station = self.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => station.on_registry_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Station lagged behind registry events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    Some(values) = updates.recv() => {
                        station.render(&values).await;
                    }
                }
            }
            debug!("Station stopped");
        }))
    }

    /// Most recently received reading across all sensors
    pub fn latest(&self) -> Option<Reading> {
        let uid = self.book.latest.read().clone()?;
        self.book.readings.read().get(&uid).cloned()
    }

    /// Latest reading per attached sensor, sorted by uid
    pub fn readings(&self) -> Vec<Reading> {
        let mut readings: Vec<Reading> = self.book.readings.read().values().cloned().collect();
        readings.sort_by(|a, b| a.uid.cmp(&b.uid));
        readings
    }

    async fn on_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Attached { device } | RegistryEvent::Replaced { device, .. } => {
                if self.on_attached(&device) {
                    if let Some(reading) = self.latest() {
                        self.render(&reading.values).await;
                    }
                }
            }
            RegistryEvent::Detached { device } => {
                if self.book.readings.write().remove(&device.uid).is_some() {
                    debug!(uid = %device.uid, "Dropped reading of detached sensor");
                }
            }
            RegistryEvent::Cleared { .. } => {
                self.book.readings.write().clear();
            }
            RegistryEvent::Rejected { .. } => {}
        }
    }

    /// Subscribe to a new sensor; true if `device` is a display
    fn on_attached(&self, device: &DeviceInfo) -> bool {
        match device.device_type {
            DeviceType::AIR_QUALITY => {
                self.subscribe_sensor(&device.uid);
                false
            }
            DeviceType::LCD_128X64 => true,
            _ => false,
        }
    }

    fn subscribe_sensor(&self, uid: &Uid) {
        let Some(sensor) = self.registry.driver_as::<AirQuality>(uid) else {
            return;
        };

        let updates = self.updates.clone();
        let book = self.book.clone();
        let sensor_uid = uid.clone();
        let result = sensor.on_all_values(move |values| {
            book.record(&sensor_uid, values);
            let _ = updates.send(values);
            Ok(())
        });

        if let Err(e) = result {
            warn!(uid = %uid, error = %e, "Failed to subscribe to Air Quality readings");
            return;
        }
        info!(uid = %uid, "Subscribed to Air Quality readings");

        // fill the display without waiting for the first period
        let updates = self.updates.clone();
        let book = self.book.clone();
        let sensor_uid = uid.clone();
        tokio::spawn(async move {
            match sensor.get_all_values().await {
                Ok(values) => {
                    book.record(&sensor_uid, values);
                    let _ = updates.send(values);
                }
                Err(e) => {
                    warn!(uid = %sensor_uid, error = %e, "Initial Air Quality reading failed")
                }
            }
        });
    }

    async fn render(&self, values: &AllValues) {
        for display in self.registry.find_drivers::<Lcd128x64>() {
            if let Err(e) = write_reading(&display, values).await {
                warn!(error = %e, "Failed to update display");
            }
        }
    }
}

async fn write_reading(display: &Lcd128x64, values: &AllValues) -> Result<(), TransportError> {
    for (line, text) in display_lines(values) {
        display.write_line(line, 0, &text).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackwire_core::{EnumerationEvent, RetryPolicy};
    use stackwire_discovery::drivers::air_quality::{
        encode_all_values, CALLBACK_ALL_VALUES, FUNCTION_GET_ALL_VALUES,
    };
    use stackwire_discovery::drivers::lcd::FUNCTION_WRITE_LINE;
    use stackwire_discovery::{
        DriverFactory, DriverSettings, EnumerationService, IaqAccuracy, LossPolicy,
    };
    use stackwire_transport::mock::MockBroker;
    use stackwire_transport::{CallbackDispatcher, ConnectionOptions, TransportConnection};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    const READING: AllValues = AllValues {
        iaq_index: 42,
        iaq_index_accuracy: IaqAccuracy::High,
        temperature: 2187,
        humidity: 4510,
        air_pressure: 101340,
    };

    async fn connected(
        broker: &MockBroker,
    ) -> (Arc<DeviceRegistry>, Arc<Station>, EnumerationService) {
        let dispatcher = CallbackDispatcher::new();
        dispatcher.spawn().unwrap();
        let connection = TransportConnection::new(
            dispatcher.sink(),
            ConnectionOptions {
                probe_interval: None,
            },
        );
        let settings = DriverSettings {
            response_timeout: TIMEOUT,
            ..DriverSettings::default()
        };
        let registry = DeviceRegistry::new(
            DriverFactory::with_defaults(settings),
            connection.clone(),
            dispatcher,
            LossPolicy::KeepDevices,
        );
        registry.attach();
        let station = Station::new(registry.clone());
        station.start().unwrap();

        connection.connect(&broker.address()).await.unwrap();
        let service = EnumerationService::new(connection, RetryPolicy::immediate());
        (registry, station, service)
    }

    /// Resend the reading until the station has subscribed and recorded it
    async fn deliver_reading(broker: &MockBroker, station: &Station, uid: &Uid) -> Reading {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                broker
                    .send_callback(uid, CALLBACK_ALL_VALUES, encode_all_values(&READING))
                    .await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                if let Some(reading) = station.latest() {
                    return reading;
                }
            }
        })
        .await
        .expect("station never recorded a reading")
    }

    async fn eventually<C: Fn() -> bool>(condition: C) -> bool {
        tokio::time::timeout(TIMEOUT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[test]
    fn test_display_lines() {
        let lines = display_lines(&READING);
        assert_eq!(lines[0], (2, "IAQ:          42".to_string()));
        assert_eq!(lines[1], (3, "Temp:      21.87 \u{F8}C".to_string()));
        assert_eq!(lines[2], (4, "Humidity:  45.10 %RH".to_string()));
        assert_eq!(lines[3], (5, "Air Pres: 1013.4 mbar".to_string()));
        assert!(lines.iter().all(|(_, text)| text.chars().count() <= 22));
    }

    #[tokio::test]
    async fn test_reading_is_rendered_on_display() {
        let broker = MockBroker::start().await.unwrap();
        broker.add_device(EnumerationEvent::attached("Lcd", DeviceType::LCD_128X64));
        broker.add_device(EnumerationEvent::attached("Aq1", DeviceType::AIR_QUALITY));

        let (registry, station, service) = connected(&broker).await;
        service.enumerate().await.unwrap();
        assert!(eventually(|| registry.len() == 2).await);

        let reading = deliver_reading(&broker, &station, &Uid::new("Aq1")).await;
        assert_eq!(reading.uid, Uid::new("Aq1"));
        assert_eq!(reading.values, READING);
        assert!((reading.temperature_celsius - 21.87).abs() < 1e-9);

        let frame = broker
            .wait_for_request(
                |f| f.function_id == FUNCTION_WRITE_LINE && f.payload.first() == Some(&5),
                TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(&frame.payload[2..10], b"Air Pres");
        assert_eq!(station.readings().len(), 1);
    }

    #[tokio::test]
    async fn test_initial_reading_fetched_on_attach() {
        let broker = MockBroker::start().await.unwrap();
        let sensor = Uid::new("Aq1");
        broker.set_response(&sensor, FUNCTION_GET_ALL_VALUES, encode_all_values(&READING));
        broker.add_device(EnumerationEvent::attached("Lcd", DeviceType::LCD_128X64));
        broker.add_device(EnumerationEvent::attached("Aq1", DeviceType::AIR_QUALITY));

        let (_registry, station, service) = connected(&broker).await;
        service.enumerate().await.unwrap();

        // no periodic callback is sent
        assert!(eventually(|| station.latest().is_some()).await);
        assert_eq!(station.latest().unwrap().values, READING);
        let frame = broker
            .wait_for_request(
                |f| f.function_id == FUNCTION_WRITE_LINE && f.payload.first() == Some(&4),
                TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(&frame.payload[2..10], b"Humidity");
    }

    #[tokio::test]
    async fn test_display_attached_later_shows_latest_reading() {
        let broker = MockBroker::start().await.unwrap();
        broker.add_device(EnumerationEvent::attached("Aq1", DeviceType::AIR_QUALITY));

        let (registry, station, service) = connected(&broker).await;
        service.enumerate().await.unwrap();
        assert!(eventually(|| registry.len() == 1).await);
        deliver_reading(&broker, &station, &Uid::new("Aq1")).await;

        broker
            .send_enumeration(&EnumerationEvent::attached("Lcd", DeviceType::LCD_128X64))
            .await;
        let frame = broker
            .wait_for_request(
                |f| f.function_id == FUNCTION_WRITE_LINE && f.payload.first() == Some(&2),
                TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(&frame.payload[2..6], b"IAQ:");
    }

    #[tokio::test]
    async fn test_detached_sensor_drops_reading() {
        let broker = MockBroker::start().await.unwrap();
        broker.add_device(EnumerationEvent::attached("Aq1", DeviceType::AIR_QUALITY));

        let (registry, station, service) = connected(&broker).await;
        service.enumerate().await.unwrap();
        assert!(eventually(|| registry.len() == 1).await);
        deliver_reading(&broker, &station, &Uid::new("Aq1")).await;

        broker.send_enumeration(&EnumerationEvent::detached("Aq1")).await;
        assert!(eventually(|| station.readings().is_empty()).await);
        assert!(station.latest().is_none());
        assert!(station.start().is_none());
    }
}
