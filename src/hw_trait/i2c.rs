//! I2C hardware abstraction trait.

use std::sync::Arc;

use async_trait::async_trait;

use super::Result;

/// I2C bus abstraction. The slave address travels with each call, so one
/// handle serves every peripheral on the bus.
#[async_trait]
pub trait I2c: Send {
    /// Write data to an I2C device.
    async fn write(&mut self, addr: u8, data: &[u8]) -> Result<()>;

    /// Read data from an I2C device.
    async fn read(&mut self, addr: u8, buffer: &mut [u8]) -> Result<()>;

    /// Write then read with a repeated start (register reads).
    async fn write_read(&mut self, addr: u8, write: &[u8], read: &mut [u8]) -> Result<()>;
}

/// The process-wide management I2C bus.
pub type SharedI2c = Arc<tokio::sync::Mutex<Box<dyn I2c>>>;
