//! Crate-level error type.

use thiserror::Error;

use crate::asic::a1::ChainError;
use crate::hw_trait::HwError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Hw(#[from] HwError),

    #[error("chain {chain}: {source}")]
    Chain { chain: usize, source: ChainError },

    #[error("no supported A1 product detected")]
    NothingDetected,
}

pub type Result<T> = std::result::Result<T, Error>;
