//! LCD 128x64 Bricklet

use stackwire_core::DeviceType;
use stackwire_transport::frame::push_string;
use stackwire_transport::TransportError;
use std::any::Any;
use std::sync::Arc;
use tracing::info;

use crate::factory::ConstructionError;
use crate::link::{DeviceLink, Driver};

pub const FUNCTION_CLEAR_DISPLAY: u8 = 3;
pub const FUNCTION_WRITE_LINE: u8 = 6;

/// Characters per text line
pub const LINE_LENGTH: usize = 22;
/// Text lines on the display
pub const LINE_COUNT: u8 = 8;

pub struct Lcd128x64 {
    link: Arc<DeviceLink>,
}

impl Lcd128x64 {
    /// Bind to an attached display, clear it and write the title line
    pub async fn attach(
        link: Arc<DeviceLink>,
        title: &str,
    ) -> Result<Arc<Self>, ConstructionError> {
        let driver = Arc::new(Self { link });
        let handshake = match driver.clear_display().await {
            Ok(()) => driver.write_line(0, 0, title).await,
            Err(e) => Err(e),
        };
        handshake.map_err(|e| ConstructionError::handshake(driver.link.uid(), e))?;
        info!(uid = %driver.link.uid(), "LCD 128x64 initialized");
        Ok(driver)
    }

    pub async fn clear_display(&self) -> Result<(), TransportError> {
        self.link.request(FUNCTION_CLEAR_DISPLAY, Vec::new()).await?;
        Ok(())
    }

    /// Write `text` at (`line`, `position`); characters outside Latin-1 become '?'
    pub async fn write_line(
        &self,
        line: u8,
        position: u8,
        text: &str,
    ) -> Result<(), TransportError> {
        self.link
            .request(FUNCTION_WRITE_LINE, encode_line(line, position, text))
            .await?;
        Ok(())
    }
}

fn encode_line(line: u8, position: u8, text: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + LINE_LENGTH);
    payload.push(line);
    payload.push(position);
    push_string(&mut payload, text, LINE_LENGTH);
    payload
}

impl Driver for Lcd128x64 {
    fn device_type(&self) -> DeviceType {
        DeviceType::LCD_128X64
    }

    fn link(&self) -> &DeviceLink {
        &self.link
    }

    fn on_release(&self) {
        info!(uid = %self.link.uid(), "LCD 128x64 released");
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
