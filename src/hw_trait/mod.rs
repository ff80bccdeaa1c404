//! Hardware abstraction traits.
//!
//! The driver core never touches a device node directly; it talks to the
//! buses through these traits. The embedding host supplies concrete
//! implementations (Linux spidev / i2c-dev, or fakes in tests).

pub mod i2c;
pub mod spi;

use thiserror::Error;

pub use i2c::{I2c, SharedI2c};
pub use spi::{SharedSpi, Spi};

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum HwError {
    #[error("SPI transfer failed: {0}")]
    Spi(String),

    #[error("I2C transfer failed at 0x{addr:02x}: {msg}")]
    I2c { addr: u8, msg: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, HwError>;
