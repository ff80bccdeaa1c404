//! Device driver for chains of Bitmine A1 SHA-256 ASIC chips.
//!
//! A1 chips are daisy-chained over SPI and, on multi-board products,
//! multiplexed onto one or two SPI buses through an I2C GPIO expander
//! (the board selector). This crate accepts mining work items from a host
//! framework, distributes them across chips, harvests nonces, and
//! continuously autotunes each chip's PLL clock from the observed
//! good/bad nonce ratio.
//!
//! The crate is organized in layers, hardware up:
//!
//! - [`hw_trait`]: the SPI and I2C transport seams. The embedding host
//!   provides concrete implementations (spidev, i2c-dev, test fakes).
//! - [`asic::a1`]: the A1 wire protocol, PLL math, the chain model with
//!   its per-chip job pipeline, and the clock autotuner.
//! - [`peripheral`]: small drivers for the I2C parts on the boards
//!   (IO expander, LM75 temperature sensor, MCP4x trimpot).
//! - [`board`]: the board selector capability and its product-specific
//!   implementations (single chain, Desk, Blade, Rig).
//! - [`device`]: the per-chain device exposed to the host scheduler:
//!   [`detect`](device::detect), scan loop, queue management, flushing.
//!
//! Work items enter through [`device::A1Device::queue_full`] and leave
//! either via [`host::Host::submit_nonce`] (a chip found a nonce) or
//! [`host::Host::work_completed`] (slot overwrite, abort, or enqueue
//! failure); the host owns the work's lifecycle beyond that.

pub mod asic;
pub mod board;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod hw_trait;
pub mod job;
pub mod peripheral;
pub mod stats;
pub mod tracing;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{Config, ConfigOptions};
pub use device::{detect, A1Device};
pub use error::{Error, Result};
