//! CoinCraft Desk backplane: a PCA9555-class expander at 0x20 driving
//! a 1-of-5 chain select, one board (and one LM75 sensor) per chain.
//!
//! Output port 0 carries the active-low chain select, output port 1
//! the active-low reset lines. Core voltage sits behind per-board MCP4x
//! trimpots, programmed by the detection glue.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as StateMutex;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::hw_trait::{HwError, Result, SharedI2c};
use crate::peripheral::lm75::{self, Lm75};
use crate::peripheral::tca9535::{regs, Tca9535};
use crate::tracing::prelude::*;

use super::{BoardSelector, BusGuard, RESET_HI_TIME, RESET_LOW_TIME};

pub const MAX_CHAINS: usize = 5;

const EXPANDER_ADDRESS: u8 = 0x20;

/// Per-board MCP4x trimpot addresses, indexed by board.
pub const TRIMPOT_ADDRESSES: [u8; MAX_CHAINS] = [0x2c, 0x2b, 0x2a, 0x29, 0x28];

pub struct DeskSelector {
    bus: Arc<Mutex<()>>,
    active_chain: StateMutex<Option<usize>>,
    expander: Tca9535,
    i2c: SharedI2c,
}

impl DeskSelector {
    /// Probe for the backplane: both ports become outputs with select
    /// and reset lines released (high).
    pub async fn probe(i2c: SharedI2c) -> Option<Arc<Self>> {
        let expander = Tca9535::new(i2c.clone(), EXPANDER_ADDRESS);
        let init = async {
            expander.write_reg(regs::CONFIG0, 0x00).await?;
            expander.write_reg(regs::OUTPUT0, 0xff).await?;
            expander.write_reg(regs::CONFIG1, 0x00).await?;
            expander.write_reg(regs::OUTPUT1, 0xff).await?;
            Ok::<(), HwError>(())
        };
        match init.await {
            Ok(()) => Some(Arc::new(Self {
                bus: Arc::new(Mutex::new(())),
                active_chain: StateMutex::new(None),
                expander,
                i2c,
            })),
            Err(_) => {
                info!("no CoinCraft Desk backplane detected");
                None
            }
        }
    }

    async fn pulse_reset(&self, lines: u8) -> Result<()> {
        self.expander.write_reg(regs::OUTPUT1, !lines).await?;
        sleep(RESET_LOW_TIME).await;
        self.expander.write_reg(regs::OUTPUT1, 0xff).await?;
        sleep(RESET_HI_TIME).await;
        Ok(())
    }
}

#[async_trait]
impl BoardSelector for DeskSelector {
    fn name(&self) -> &'static str {
        "CoinCraft Desk"
    }

    fn max_chains(&self) -> usize {
        MAX_CHAINS
    }

    async fn select(&self, chain: usize) -> Result<BusGuard> {
        if chain >= MAX_CHAINS {
            return Err(HwError::InvalidParameter(format!(
                "Desk has no chain {}",
                chain
            )));
        }
        let guard = BusGuard::acquire(&self.bus).await;
        if *self.active_chain.lock() == Some(chain) {
            return Ok(guard);
        }
        self.expander
            .write_reg(regs::OUTPUT0, !(1u8 << chain))
            .await?;
        *self.active_chain.lock() = Some(chain);
        Ok(guard)
    }

    async fn reset(&self, _guard: &BusGuard) -> Result<()> {
        let Some(chain) = *self.active_chain.lock() else {
            return Ok(());
        };
        self.pulse_reset(1 << chain).await
    }

    async fn reset_all(&self) -> Result<()> {
        let _guard = BusGuard::acquire(&self.bus).await;
        self.pulse_reset(0xff).await
    }

    async fn get_temp(&self, _guard: &BusGuard, sensor: u8) -> u8 {
        if sensor != 0 {
            return 0;
        }
        let Some(chain) = *self.active_chain.lock() else {
            return 0;
        };
        let sensor = Lm75::new(self.i2c.clone(), lm75::BASE_ADDRESS + chain as u8);
        sensor.read_celsius().await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeI2cBus;

    fn bus_with_expander() -> FakeI2cBus {
        let bus = FakeI2cBus::new();
        bus.add_device(EXPANDER_ADDRESS);
        bus
    }

    #[tokio::test]
    async fn probe_absent_backplane() {
        let bus = FakeI2cBus::new();
        assert!(DeskSelector::probe(bus.shared()).await.is_none());
    }

    #[tokio::test]
    async fn select_drives_one_of_five() {
        let bus = bus_with_expander();
        let selector = DeskSelector::probe(bus.shared()).await.unwrap();
        bus.clear_writes();

        drop(selector.select(3).await.unwrap());
        assert_eq!(
            bus.writes_to(EXPANDER_ADDRESS),
            vec![vec![regs::OUTPUT0, !(1 << 3)]]
        );

        // reselect: no traffic
        bus.clear_writes();
        drop(selector.select(3).await.unwrap());
        assert!(bus.writes_to(EXPANDER_ADDRESS).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_all_parks_lines_high() {
        let bus = bus_with_expander();
        let selector = DeskSelector::probe(bus.shared()).await.unwrap();
        selector.reset_all().await.unwrap();
        assert_eq!(bus.reg(EXPANDER_ADDRESS, regs::OUTPUT1), Some(0xff));
    }

    #[tokio::test]
    async fn per_chain_temperature() {
        let bus = bus_with_expander();
        bus.add_device(0x4b);
        bus.set_reg(0x4b, 0, 48);
        let selector = DeskSelector::probe(bus.shared()).await.unwrap();

        let guard = selector.select(3).await.unwrap();
        assert_eq!(selector.get_temp(&guard, 0).await, 48);
    }
}
