//! SPI hardware abstraction trait.

use std::sync::Arc;

use async_trait::async_trait;

use super::Result;

/// A full-duplex SPI port.
///
/// A1 chains run in SPI mode 1. One call is one blocking transfer: the
/// port clocks `rx.len()` bytes in, driving `tx` out when given and
/// zeros otherwise (the half-duplex poll used to walk responses back
/// through the chain).
#[async_trait]
pub trait Spi: Send {
    /// Transfer `rx.len()` bytes. When `tx` is `Some`, it must be the
    /// same length as `rx`.
    async fn transfer(&mut self, tx: Option<&[u8]>, rx: &mut [u8]) -> Result<()>;

    /// Change the bus clock.
    async fn set_speed_khz(&mut self, khz: u32) -> Result<()>;
}

/// A process-wide SPI context, shared between the chains multiplexed
/// onto one bus. The board selector serializes use of the bus; this
/// mutex only satisfies `&mut` access.
pub type SharedSpi = Arc<tokio::sync::Mutex<Box<dyn Spi>>>;
