//! Air Quality Bricklet: IAQ index, temperature, humidity and air pressure

use serde::{Deserialize, Serialize};
use stackwire_core::DeviceType;
use stackwire_transport::{FrameError, HandlerResult, HandlerToken, PayloadReader, TransportError};
use std::any::Any;
use std::sync::Arc;
use tracing::info;

use crate::factory::ConstructionError;
use crate::link::{DeviceLink, Driver};

pub const FUNCTION_GET_ALL_VALUES: u8 = 1;
pub const FUNCTION_SET_ALL_VALUES_CALLBACK_CONFIGURATION: u8 = 4;
pub const FUNCTION_GET_ALL_VALUES_CALLBACK_CONFIGURATION: u8 = 5;
pub const CALLBACK_ALL_VALUES: u8 = 6;

/// Calibration state of the IAQ index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IaqAccuracy {
    Unreliable,
    Low,
    Medium,
    High,
}

impl IaqAccuracy {
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::Unreliable,
        }
    }
}

/// One complete reading; fixed-point values as sent by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllValues {
    pub iaq_index: i32,
    pub iaq_index_accuracy: IaqAccuracy,
    /// 1/100 °C
    pub temperature: i32,
    /// 1/100 %RH
    pub humidity: i32,
    /// 1/100 hPa
    pub air_pressure: i32,
}

impl AllValues {
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let mut reader = PayloadReader::new(payload);
        Ok(Self {
            iaq_index: reader.read_i32()?,
            iaq_index_accuracy: IaqAccuracy::from_wire(reader.read_u8()?),
            temperature: reader.read_i32()?,
            humidity: reader.read_i32()?,
            air_pressure: reader.read_i32()?,
        })
    }

    pub fn temperature_celsius(&self) -> f64 {
        f64::from(self.temperature) / 100.0
    }

    pub fn humidity_percent(&self) -> f64 {
        f64::from(self.humidity) / 100.0
    }

    pub fn air_pressure_hpa(&self) -> f64 {
        f64::from(self.air_pressure) / 100.0
    }
}

pub struct AirQuality {
    link: Arc<DeviceLink>,
}

impl AirQuality {
    /// Bind to an attached device and configure the all-values callback period
    pub async fn attach(
        link: Arc<DeviceLink>,
        period_ms: u32,
    ) -> Result<Arc<Self>, ConstructionError> {
        let driver = Arc::new(Self { link });
        driver
            .set_all_values_callback_configuration(period_ms, false)
            .await
            .map_err(|e| ConstructionError::handshake(driver.link.uid(), e))?;
        info!(uid = %driver.link.uid(), period_ms, "Air Quality initialized");
        Ok(driver)
    }

    pub async fn get_all_values(&self) -> Result<AllValues, TransportError> {
        let payload = self.link.request(FUNCTION_GET_ALL_VALUES, Vec::new()).await?;
        Ok(AllValues::decode(&payload)?)
    }

    /// Emit the all-values callback every `period_ms` (0 disables it)
    pub async fn set_all_values_callback_configuration(
        &self,
        period_ms: u32,
        value_has_to_change: bool,
    ) -> Result<(), TransportError> {
        let mut payload = Vec::with_capacity(5);
        payload.extend_from_slice(&period_ms.to_le_bytes());
        payload.push(u8::from(value_has_to_change));
        self.link
            .request(FUNCTION_SET_ALL_VALUES_CALLBACK_CONFIGURATION, payload)
            .await?;
        Ok(())
    }

    /// Current (period_ms, value_has_to_change)
    pub async fn get_all_values_callback_configuration(
        &self,
    ) -> Result<(u32, bool), TransportError> {
        let payload = self
            .link
            .request(FUNCTION_GET_ALL_VALUES_CALLBACK_CONFIGURATION, Vec::new())
            .await?;
        let mut reader = PayloadReader::new(&payload);
        Ok((reader.read_u32()?, reader.read_bool()?))
    }

    /// Subscribe to periodic all-values callbacks
    pub fn on_all_values<F>(&self, handler: F) -> Result<HandlerToken, TransportError>
    where
        F: Fn(AllValues) -> HandlerResult + Send + Sync + 'static,
    {
        self.link.on_callback(CALLBACK_ALL_VALUES, move |payload| {
            let values = AllValues::decode(payload)?;
            handler(values)
        })
    }
}

impl Driver for AirQuality {
    fn device_type(&self) -> DeviceType {
        DeviceType::AIR_QUALITY
    }

    fn link(&self) -> &DeviceLink {
        &self.link
    }

    fn on_release(&self) {
        info!(uid = %self.link.uid(), "Air Quality released");
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Encode a reading the way the device sends it
#[cfg(any(test, feature = "test-support"))]
pub fn encode_all_values(values: &AllValues) -> Vec<u8> {
    let accuracy = match values.iaq_index_accuracy {
        IaqAccuracy::Unreliable => 0u8,
        IaqAccuracy::Low => 1,
        IaqAccuracy::Medium => 2,
        IaqAccuracy::High => 3,
    };
    let mut payload = Vec::with_capacity(17);
    payload.extend_from_slice(&values.iaq_index.to_le_bytes());
    payload.push(accuracy);
    payload.extend_from_slice(&values.temperature.to_le_bytes());
    payload.extend_from_slice(&values.humidity.to_le_bytes());
    payload.extend_from_slice(&values.air_pressure.to_le_bytes());
    payload
}
