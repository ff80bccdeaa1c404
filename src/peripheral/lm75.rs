//! LM75-class I2C temperature sensor driver.
//!
//! Every chain (Desk) or board pair (Blade, Rig) carries one sensor at
//! `0x48 + n`. Only the integer temperature register is used.

use crate::hw_trait::{Result, SharedI2c};
use crate::tracing::prelude::*;

/// Base slave address; sensor `n` answers at `BASE_ADDRESS + n`.
pub const BASE_ADDRESS: u8 = 0x48;

/// Temperature register (integer degrees Celsius in the high byte).
const REG_TEMP: u8 = 0x00;

pub struct Lm75 {
    i2c: SharedI2c,
    address: u8,
}

impl Lm75 {
    pub fn new(i2c: SharedI2c, address: u8) -> Self {
        Self { i2c, address }
    }

    /// Read the temperature, sanitized: boards report garbage above
    /// 100 degC, where a set sign bit is a known glitch that is cleared;
    /// anything else overrange reads as 0.
    pub async fn read_celsius(&self) -> Result<u8> {
        let mut buf = [0u8; 1];
        {
            let mut i2c = self.i2c.lock().await;
            i2c.write_read(self.address, &[REG_TEMP], &mut buf).await?;
        }
        let mut temp = buf[0];
        if temp > 100 {
            warn!(
                addr = format!("{:#04x}", self.address),
                raw = format!("{:#04x}", temp),
                "invalid temperature"
            );
            if temp & 0x80 != 0 {
                temp -= 0x80;
            } else {
                temp = 0;
            }
        }
        Ok(temp)
    }
}
