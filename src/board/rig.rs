//! CoinCraft Rig v3 backplane: sixteen chains behind a pair of
//! TCA9535 expanders, one for the active-low chain select and one for
//! the per-board reset lines. Boards carry two chains each and share
//! an LM75 sensor and an MCP4x trimpot per board.

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

pub const MAX_CHAINS: usize = 16;
const BOARDS: usize = MAX_CHAINS / 2;

const SELECT_EXPANDER_ADDRESS: u8 = 0x20;
const RESET_EXPANDER_ADDRESS: u8 = 0x21;

/// The per-board trimpot, shared by the board's two chains.
pub const TRIMPOT_ADDRESS: u8 = 0x28;

#[derive(Default)]
struct State {
    active_chain: Option<usize>,
    last_temp: [u8; BOARDS],
}

pub struct RigSelector {
    bus: Arc<Mutex<()>>,
    state: StateMutex<State>,
    select_expander: Tca9535,
    reset_expander: Tca9535,
    i2c: SharedI2c,
}

impl RigSelector {
    /// Probe for the backplane; both expanders must acknowledge their
    /// init sequence (all lines released).
    pub async fn probe(i2c: SharedI2c) -> Option<Arc<Self>> {
        let select_expander = Tca9535::new(i2c.clone(), SELECT_EXPANDER_ADDRESS);
        let reset_expander = Tca9535::new(i2c.clone(), RESET_EXPANDER_ADDRESS);
        let init = async {
            for expander in [&select_expander, &reset_expander] {
                expander.write_reg(regs::CONFIG0, 0x00).await?;
                expander.write_reg(regs::OUTPUT0, 0xff).await?;
                expander.write_reg(regs::CONFIG1, 0x00).await?;
                expander.write_reg(regs::OUTPUT1, 0xff).await?;
            }
            Ok::<(), HwError>(())
        };
        match init.await {
            Ok(()) => Some(Arc::new(Self {
                bus: Arc::new(Mutex::new(())),
                state: StateMutex::new(State::default()),
                select_expander,
                reset_expander,
                i2c,
            })),
            Err(_) => {
                info!("no CoinCraft Rig backplane detected");
                None
            }
        }
    }

    async fn pulse_reset(&self, port0_lines: u8) -> Result<()> {
        self.reset_expander
            .write_reg(regs::OUTPUT0, !port0_lines)
            .await?;
        sleep(RESET_LOW_TIME).await;
        self.reset_expander.write_reg(regs::OUTPUT0, 0xff).await?;
        sleep(RESET_HI_TIME).await;
        Ok(())
    }
}

#[async_trait]
impl BoardSelector for RigSelector {
    fn name(&self) -> &'static str {
        "CoinCraft Rig"
    }

    fn max_chains(&self) -> usize {
        MAX_CHAINS
    }

    async fn select(&self, chain: usize) -> Result<BusGuard> {
        if chain >= MAX_CHAINS {
            return Err(HwError::InvalidParameter(format!(
                "Rig has no chain {}",
                chain
            )));
        }
        let guard = BusGuard::acquire(&self.bus).await;
        if self.state.lock().active_chain == Some(chain) {
            return Ok(guard);
        }
        // one-hot active-low select split over the two ports
        let (port0, port1) = if chain < 8 {
            (!(1u8 << chain), 0xff)
        } else {
            (0xff, !(1u8 << (chain - 8)))
        };
        self.select_expander.write_reg(regs::OUTPUT0, port0).await?;
        self.select_expander.write_reg(regs::OUTPUT1, port1).await?;
        self.state.lock().active_chain = Some(chain);
        Ok(guard)
    }

    async fn reset(&self, _guard: &BusGuard) -> Result<()> {
        let (board, odd_chain) = {
            let state = self.state.lock();
            let Some(chain) = state.active_chain else {
                return Ok(());
            };
            (chain / 2, chain & 1 == 1)
        };
        // the reset line belongs to the board; the even chain drives it
        if odd_chain {
            return Ok(());
        }
        self.pulse_reset(1 << board).await
    }

    async fn reset_all(&self) -> Result<()> {
        let _guard = BusGuard::acquire(&self.bus).await;
        self.pulse_reset(0xff).await
    }

    async fn get_temp(&self, _guard: &BusGuard, sensor: u8) -> u8 {
        if sensor != 0 {
            return 0;
        }
        let (board, odd_chain) = {
            let state = self.state.lock();
            let Some(chain) = state.active_chain else {
                return 0;
            };
            (chain / 2, chain & 1 == 1)
        };
        if odd_chain {
            return self.state.lock().last_temp[board];
        }
        let sensor = Lm75::new(self.i2c.clone(), lm75::BASE_ADDRESS + board as u8);
        let temp = sensor.read_celsius().await.unwrap_or(0);
        self.state.lock().last_temp[board] = temp;
        temp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeI2cBus;

    fn bus_with_expanders() -> FakeI2cBus {
        let bus = FakeI2cBus::new();
        bus.add_device(SELECT_EXPANDER_ADDRESS);
        bus.add_device(RESET_EXPANDER_ADDRESS);
        bus
    }

    #[tokio::test]
    async fn probe_needs_both_expanders() {
        let bus = FakeI2cBus::new();
        bus.add_device(SELECT_EXPANDER_ADDRESS);
        assert!(RigSelector::probe(bus.shared()).await.is_none());
        bus.add_device(RESET_EXPANDER_ADDRESS);
        assert!(RigSelector::probe(bus.shared()).await.is_some());
    }

    #[tokio::test]
    async fn select_upper_half_uses_second_port() {
        let bus = bus_with_expanders();
        let selector = RigSelector::probe(bus.shared()).await.unwrap();
        bus.clear_writes();

        drop(selector.select(11).await.unwrap());
        assert_eq!(
            bus.writes_to(SELECT_EXPANDER_ADDRESS),
            vec![
                vec![regs::OUTPUT0, 0xff],
                vec![regs::OUTPUT1, !(1 << 3)],
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_all_releases_every_line() {
        let bus = bus_with_expanders();
        let selector = RigSelector::probe(bus.shared()).await.unwrap();
        selector.reset_all().await.unwrap();
        assert_eq!(bus.reg(RESET_EXPANDER_ADDRESS, regs::OUTPUT0), Some(0xff));
    }
}
