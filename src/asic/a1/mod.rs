//! Bitmine A1 chip support: wire protocol, PLL math, the chain model,
//! and the per-chip clock autotuner.

pub mod chain;
mod commands;
pub mod pll;
pub mod protocol;
pub mod tuner;

pub use chain::{Chain, Chip};

use thiserror::Error;

use crate::hw_trait::HwError;
use protocol::Opcode;

/// Errors from the SPI command layer.
///
/// Transport failures and framing mismatches both surface here; callers
/// decide whether to disable the chip, retry next tick, or abandon the
/// chain.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Hw(#[from] HwError),

    #[error("{cmd:?} to chip {chip}: bad echo {echo:02x?}")]
    BadEcho { cmd: Opcode, chip: u8, echo: [u8; 2] },

    #[error("chip {chip}: PLL lock timeout")]
    PllLockTimeout { chip: u8 },

    #[error("no result marker in response window")]
    NoResultMarker,

    #[error("no chips detected")]
    NoChips,

    #[error("chain masked by configuration")]
    Masked,
}
