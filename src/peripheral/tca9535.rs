//! TCA9535 16-bit I2C IO expander driver.
//!
//! The expander has two 8-bit ports with input, output, polarity and
//! configuration registers. Board selectors drive chain-select and
//! reset lines through its output ports. The register map is shared
//! with the PCA9535/PCA9555 family, so one driver covers the expanders
//! on every supported backplane.
//!
//! Datasheet: <https://www.ti.com/product/TCA9535>

use crate::hw_trait::{Result, SharedI2c};

/// TCA9535 register addresses.
pub mod regs {
    pub const INPUT0: u8 = 0x00;
    pub const INPUT1: u8 = 0x01;
    pub const OUTPUT0: u8 = 0x02;
    pub const OUTPUT1: u8 = 0x03;
    pub const POLARITY0: u8 = 0x04;
    pub const POLARITY1: u8 = 0x05;
    pub const CONFIG0: u8 = 0x06;
    pub const CONFIG1: u8 = 0x07;
}

pub struct Tca9535 {
    i2c: SharedI2c,
    address: u8,
}

impl Tca9535 {
    pub fn new(i2c: SharedI2c, address: u8) -> Self {
        Self { i2c, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub async fn write_reg(&self, reg: u8, value: u8) -> Result<()> {
        let mut i2c = self.i2c.lock().await;
        i2c.write(self.address, &[reg, value]).await
    }

    pub async fn read_reg(&self, reg: u8) -> Result<u8> {
        let mut buf = [0u8; 1];
        let mut i2c = self.i2c.lock().await;
        i2c.write_read(self.address, &[reg], &mut buf).await?;
        Ok(buf[0])
    }
}
