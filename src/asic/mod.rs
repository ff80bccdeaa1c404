//! ASIC chip families supported by this driver.

pub mod a1;
