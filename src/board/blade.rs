//! CoinCraft Blade backplane: a TCA9535 at 0x27 selecting one of 8
//! chains, packed two chains per board.
//!
//! Output port 1 carries the active-low board select (bit 7 is board
//! 0), output port 0 the per-board reset lines. The two chains of a
//! board share the select line and the LM75 sensor, so consecutive
//! selects within a board and temperature reads for the odd chain do
//! no bus traffic.

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

pub const MAX_CHAINS: usize = 8;
const BOARDS: usize = MAX_CHAINS / 2;

const EXPANDER_ADDRESS: u8 = 0x27;

#[derive(Default)]
struct State {
    active_chain: Option<usize>,
    active_board: Option<usize>,
    board_mask: u8,
    last_temp: [u8; BOARDS],
}

pub struct BladeSelector {
    bus: Arc<Mutex<()>>,
    state: StateMutex<State>,
    expander: Tca9535,
    i2c: SharedI2c,
}

impl BladeSelector {
    /// Probe for the backplane: configure the expander's ports as
    /// outputs with every line released. An expander that does not
    /// acknowledge means no Blade is present.
    pub async fn probe(i2c: SharedI2c) -> Option<Arc<Self>> {
        let expander = Tca9535::new(i2c.clone(), EXPANDER_ADDRESS);
        let init = async {
            expander.write_reg(regs::CONFIG1, 0x00).await?;
            expander.write_reg(regs::OUTPUT1, 0xff).await?;
            expander.write_reg(regs::CONFIG0, 0x00).await?;
            expander.write_reg(regs::OUTPUT0, 0x00).await?;
            Ok::<(), HwError>(())
        };
        match init.await {
            Ok(()) => Some(Arc::new(Self {
                bus: Arc::new(Mutex::new(())),
                state: StateMutex::new(State::default()),
                expander,
                i2c,
            })),
            Err(_) => {
                info!("no CoinCraft Blade backplane detected");
                None
            }
        }
    }

    async fn pulse_reset(&self, mask: u8) -> Result<()> {
        self.expander.write_reg(regs::OUTPUT0, 0x00).await?;
        self.expander.write_reg(regs::OUTPUT0, mask).await?;
        sleep(RESET_LOW_TIME).await;
        self.expander.write_reg(regs::OUTPUT0, 0x00).await?;
        sleep(RESET_HI_TIME).await;
        Ok(())
    }
}

#[async_trait]
impl BoardSelector for BladeSelector {
    fn name(&self) -> &'static str {
        "CoinCraft Blade"
    }

    fn max_chains(&self) -> usize {
        MAX_CHAINS
    }

    async fn select(&self, chain: usize) -> Result<BusGuard> {
        if chain >= MAX_CHAINS {
            return Err(HwError::InvalidParameter(format!(
                "Blade has no chain {}",
                chain
            )));
        }
        let guard = BusGuard::acquire(&self.bus).await;

        let board = chain / 2;
        enum Switch {
            None,
            ChainOnly,
            Board,
        }
        let switch = {
            let state = self.state.lock();
            if state.active_chain == Some(chain) {
                Switch::None
            } else if state.active_board == Some(board) {
                Switch::ChainOnly
            } else {
                Switch::Board
            }
        };
        match switch {
            Switch::None => {}
            Switch::ChainOnly => {
                self.state.lock().active_chain = Some(chain);
            }
            Switch::Board => {
                self.expander.write_reg(regs::OUTPUT1, 0xff).await?;
                self.expander
                    .write_reg(regs::OUTPUT1, !(0x80 >> board))
                    .await?;
                let mut state = self.state.lock();
                state.active_chain = Some(chain);
                state.active_board = Some(board);
                state.board_mask = 1 << board;
            }
        }
        Ok(guard)
    }

    async fn reset(&self, _guard: &BusGuard) -> Result<()> {
        let (odd_chain, mask) = {
            let state = self.state.lock();
            (
                state.active_chain.is_some_and(|c| c & 1 == 1),
                state.board_mask,
            )
        };
        // the reset line belongs to the board; the even chain drives it
        if odd_chain {
            return Ok(());
        }
        self.pulse_reset(mask).await
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
        // the board pair shares one sensor; no need to read it twice
        if odd_chain {
            return self.state.lock().last_temp[board];
        }
        let sensor = Lm75::new(self.i2c.clone(), lm75::BASE_ADDRESS + board as u8);
        let temp = sensor.read_celsius().await.unwrap_or(0);
        self.state.lock().last_temp[board] = temp;
        temp
    }
}
