//! Board selectors: the I2C-controlled multiplexers that route the
//! host's SPI bus to one chain at a time on multi-board products.
//!
//! The selector owns the bus mutex. [`BoardSelector::select`] blocks
//! until the bus is free, routes it, and returns a [`BusGuard`];
//! dropping the guard releases the bus (the expander state is left
//! alone). Operations that are only legal while the bus is held take
//! the guard as proof of lock. Exactly one selector is active per
//! process; discovery probes Desk, Blade, Rig, then falls back to the
//! single-chain dummy.

pub mod blade;
pub mod desk;
pub mod dummy;
pub mod rig;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Duration;

use crate::hw_trait::Result;

pub use blade::BladeSelector;
pub use desk::DeskSelector;
pub use dummy::DummySelector;
pub use rig::RigSelector;

/// Reset line timing shared by all backplanes.
pub(crate) const RESET_LOW_TIME: Duration = Duration::from_millis(200);
pub(crate) const RESET_HI_TIME: Duration = Duration::from_millis(100);

/// Proof that the holder routed the shared SPI bus and owns it until
/// drop.
pub struct BusGuard {
    _lock: OwnedMutexGuard<()>,
}

impl BusGuard {
    pub(crate) async fn acquire(bus: &Arc<Mutex<()>>) -> Self {
        Self {
            _lock: bus.clone().lock_owned().await,
        }
    }
}

#[async_trait]
pub trait BoardSelector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Chains this product can carry.
    fn max_chains(&self) -> usize;

    /// Route the SPI bus to `chain`. Blocks until the bus is free.
    /// Reselecting the active chain produces no I2C traffic.
    async fn select(&self, chain: usize) -> Result<BusGuard>;

    /// Pulse the selected chain's reset line. Requires the bus.
    async fn reset(&self, guard: &BusGuard) -> Result<()>;

    /// Pulse every reset line; acquires and releases the bus itself.
    async fn reset_all(&self) -> Result<()>;

    /// Board temperature for the selected chain, in degrees Celsius;
    /// 0 when unknown. Requires the bus.
    async fn get_temp(&self, guard: &BusGuard, sensor: u8) -> u8;

    /// Release the expander on shutdown.
    async fn exit(&self) {}
}
