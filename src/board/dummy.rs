//! The single-chain selector: one chain wired straight to the SPI bus,
//! nothing to route, no sensors.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::hw_trait::{HwError, Result};

use super::{BoardSelector, BusGuard};

pub struct DummySelector {
    bus: Arc<Mutex<()>>,
}

impl DummySelector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bus: Arc::new(Mutex::new(())),
        })
    }
}

#[async_trait]
impl BoardSelector for DummySelector {
    fn name(&self) -> &'static str {
        "single-chain"
    }

    fn max_chains(&self) -> usize {
        1
    }

    async fn select(&self, chain: usize) -> Result<BusGuard> {
        if chain != 0 {
            return Err(HwError::InvalidParameter(format!(
                "single chain has no chain {}",
                chain
            )));
        }
        Ok(BusGuard::acquire(&self.bus).await)
    }

    async fn reset(&self, _guard: &BusGuard) -> Result<()> {
        Ok(())
    }

    async fn reset_all(&self) -> Result<()> {
        Ok(())
    }

    async fn get_temp(&self, _guard: &BusGuard, _sensor: u8) -> u8 {
        0
    }
}
