//! Bundled device drivers

pub mod air_quality;
pub mod lcd;

pub use air_quality::{AirQuality, AllValues, IaqAccuracy};
pub use lcd::Lcd128x64;
