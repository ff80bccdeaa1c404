//! MCP4x digital trimpot driver.
//!
//! Desk and Rig boards set their core voltage through an MCP4x-family
//! potentiometer; the wiper value comes from the option string.

use crate::hw_trait::{Result, SharedI2c};

pub struct Mcp4x {
    i2c: SharedI2c,
    address: u8,
}

impl Mcp4x {
    pub fn new(i2c: SharedI2c, address: u8) -> Self {
        Self { i2c, address }
    }

    /// Check the part answers on the bus.
    pub async fn probe(&self) -> bool {
        let mut buf = [0u8; 1];
        let mut i2c = self.i2c.lock().await;
        i2c.read(self.address, &mut buf).await.is_ok()
    }

    /// Write a volatile wiper register (0 or 1).
    pub async fn set_wiper(&self, wiper: u8, value: u8) -> Result<()> {
        // command byte: register address in the high nibble, write op 00
        let command = wiper << 4;
        let mut i2c = self.i2c.lock().await;
        i2c.write(self.address, &[command, value]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeI2cBus;

    #[tokio::test]
    async fn wiper_write_format() {
        let bus = FakeI2cBus::new();
        bus.add_device(0x28);
        let pot = Mcp4x::new(bus.shared(), 0x28);
        pot.set_wiper(0, 0xc8).await.unwrap();
        pot.set_wiper(1, 0x64).await.unwrap();
        assert_eq!(
            bus.writes_to(0x28),
            vec![vec![0x00, 0xc8], vec![0x10, 0x64]]
        );
    }

    #[tokio::test]
    async fn probe_detects_absence() {
        let bus = FakeI2cBus::new();
        bus.add_device(0x28);
        assert!(Mcp4x::new(bus.shared(), 0x28).probe().await);
        assert!(!Mcp4x::new(bus.shared(), 0x29).probe().await);
    }
}
