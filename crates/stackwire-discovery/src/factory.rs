//! Device type to driver constructor table

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use stackwire_core::{DeviceType, Uid, UidError};
use stackwire_transport::TransportError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::drivers::{AirQuality, Lcd128x64};
use crate::link::{DeviceLink, Driver};

#[derive(Error, Debug)]
pub enum ConstructionError {
    #[error("Handshake with {uid} failed: {source}")]
    Handshake {
        uid: Uid,
        #[source]
        source: TransportError,
    },
    #[error("Invalid uid: {0}")]
    Uid(#[from] UidError),
}

impl ConstructionError {
    pub fn handshake(uid: &Uid, source: TransportError) -> Self {
        Self::Handshake {
            uid: uid.clone(),
            source,
        }
    }
}

/// Settings handed to the bundled drivers
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// How long a driver call waits for its response
    pub response_timeout: Duration,
    /// All-values callback period configured on Air Quality attach
    pub air_quality_period_ms: u32,
    /// First display line written on LCD attach
    pub display_title: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(2500),
            air_quality_period_ms: 1000,
            display_title: "   Weather Station".to_string(),
        }
    }
}

type ConstructorFuture = BoxFuture<'static, Result<Arc<dyn Driver>, ConstructionError>>;
type Constructor = Arc<dyn Fn(Arc<DeviceLink>) -> ConstructorFuture + Send + Sync>;

/// Maps device types to driver constructors
pub struct DriverFactory {
    constructors: HashMap<DeviceType, Constructor>,
    settings: DriverSettings,
}

impl DriverFactory {
    /// Empty table
    pub fn new(settings: DriverSettings) -> Self {
        Self {
            constructors: HashMap::new(),
            settings,
        }
    }

    /// Table with the bundled Air Quality and LCD 128x64 drivers
    pub fn with_defaults(settings: DriverSettings) -> Self {
        let mut factory = Self::new(settings);

        let period = factory.settings.air_quality_period_ms;
        factory.register(DeviceType::AIR_QUALITY, move |link| async move {
            AirQuality::attach(link, period)
                .await
                .map(|driver| driver as Arc<dyn Driver>)
        });

        let title = factory.settings.display_title.clone();
        factory.register(DeviceType::LCD_128X64, move |link| {
            let title = title.clone();
            async move {
                Lcd128x64::attach(link, &title)
                    .await
                    .map(|driver| driver as Arc<dyn Driver>)
            }
        });

        factory
    }

    /// Add or replace the constructor for `device_type`
    pub fn register<F, Fut>(&mut self, device_type: DeviceType, constructor: F)
    where
        F: Fn(Arc<DeviceLink>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Driver>, ConstructionError>> + Send + 'static,
    {
        let constructor: Constructor = Arc::new(move |link| constructor(link).boxed());
        self.constructors.insert(device_type, constructor);
    }

    pub fn supports(&self, device_type: DeviceType) -> bool {
        self.constructors.contains_key(&device_type)
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Build a driver; `Ok(None)` for device types without a constructor
    pub async fn create(
        &self,
        device_type: DeviceType,
        link: Arc<DeviceLink>,
    ) -> Result<Option<Arc<dyn Driver>>, ConstructionError> {
        let Some(constructor) = self.constructors.get(&device_type).cloned() else {
            debug!(uid = %link.uid(), device_type = %device_type, "No driver for device type");
            return Ok(None);
        };
        constructor(link).await.map(Some)
    }
}
