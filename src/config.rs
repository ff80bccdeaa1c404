//! Driver configuration.
//!
//! Configuration arrives from two places: an optional TOML config file
//! and the host's `--bitmine-a1-options` option string. The option
//! string always wins. Zero values mean "keep the default".
//!
//! Option string format:
//!
//! ```text
//! ref:sys:spi:chipnum:wiper:override_diff:board_mask clk wiper cmask sclk
//! ```
//!
//! Six decimal integers and one hex (`board_mask`), then up to four
//! dash-separated per-board arrays. Arrays shorter than the board count
//! repeat their last entry; the `wiper` and `cmask` arrays are hex.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Upper bound on boards across all supported products.
pub const MAX_BOARDS: usize = 16;

/// Global configuration, one instance per process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOptions {
    pub ref_clk_khz: u32,
    pub sys_clk_khz: u32,
    pub spi_clk_khz: u32,
    /// Bit per chain id; set bits bypass the chain entirely.
    pub chain_mask: u32,
    /// Job target override: 0 = diff-1 targets, -1 = the work's real
    /// device difficulty, > 0 = cap the device difficulty at this value.
    pub override_diff: i32,
    pub stats_fname: Option<String>,
    pub config_fname: Option<String>,
    pub enable_auto_tune: bool,
    /// Error-ratio band, in permille of all nonces in the window.
    pub lower_ratio_pm: u32,
    pub upper_ratio_pm: u32,
    /// Autotune clock clamp, in kHz.
    pub lower_clk_khz: u32,
    pub upper_clk_khz: u32,
    /// Limit chip chains to this many chips (testing only).
    pub override_chip_num: usize,
    /// Global trimpot wiper value; 0 leaves the trimpots alone.
    pub wiper: u8,
    /// Thermal throttle threshold in degrees Celsius; 0 disables.
    pub cutoff_temp: u8,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            ref_clk_khz: 16_000,
            sys_clk_khz: 800_000,
            spi_clk_khz: 2_000,
            chain_mask: 0,
            override_diff: 0,
            stats_fname: None,
            config_fname: None,
            enable_auto_tune: false,
            lower_ratio_pm: 3,
            upper_ratio_pm: 20,
            lower_clk_khz: 400_000,
            upper_clk_khz: 1_100_000,
            override_chip_num: 0,
            wiper: 0,
            cutoff_temp: 0,
        }
    }
}

impl ConfigOptions {
    /// Parse the optional TOML config file.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("config file: {}", e)))
    }
}

/// Per-board overrides from the dash-separated option arrays.
#[derive(Debug, Clone, Default)]
pub struct ExtraOptions {
    pub sys_clk_khz: [u32; MAX_BOARDS],
    pub wiper: [u8; MAX_BOARDS],
    pub chip_bitmask: [u64; MAX_BOARDS],
    pub spi_clk_khz: [u32; MAX_BOARDS],
}

/// Parsed configuration: global options plus per-board overrides.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub options: ConfigOptions,
    pub extra: ExtraOptions,
}

impl Config {
    pub fn new(options: ConfigOptions) -> Self {
        Self {
            options,
            extra: ExtraOptions::default(),
        }
    }

    /// Parse an option string over the defaults.
    pub fn from_option_string(opt: &str) -> Result<Self> {
        Self::from_option_string_with(ConfigOptions::default(), opt)
    }

    /// Parse an option string over a base configuration (typically one
    /// loaded from the config file).
    pub fn from_option_string_with(base: ConfigOptions, opt: &str) -> Result<Self> {
        let mut config = Self::new(base);
        let mut tokens = opt.split_whitespace();

        if let Some(head) = tokens.next() {
            config.parse_scalar_fields(head)?;
        }

        let o = &mut config.extra;
        if let Some(t) = tokens.next() {
            parse_board_array(t, &mut o.sys_clk_khz, "sys_clk", false)?;
        }
        if let Some(t) = tokens.next() {
            let mut wiper = [0u64; MAX_BOARDS];
            parse_board_array(t, &mut wiper, "wiper", true)?;
            for (dst, src) in o.wiper.iter_mut().zip(wiper) {
                *dst = u8::try_from(src)
                    .map_err(|_| Error::Config(format!("wiper value {:#x} out of range", src)))?;
            }
        }
        if let Some(t) = tokens.next() {
            parse_board_array(t, &mut o.chip_bitmask, "chip_bitmask", true)?;
        }
        if let Some(t) = tokens.next() {
            parse_board_array(t, &mut o.spi_clk_khz, "spi_clk", false)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn parse_scalar_fields(&mut self, head: &str) -> Result<()> {
        let mut fields = head.split(':');
        let c = &mut self.options;

        if let Some(v) = parse_field::<u32>(&mut fields, "ref_clk")? {
            c.ref_clk_khz = v;
        }
        if let Some(v) = parse_field::<u32>(&mut fields, "sys_clk")? {
            c.sys_clk_khz = v;
        }
        if let Some(v) = parse_field::<u32>(&mut fields, "spi_clk")? {
            c.spi_clk_khz = v;
        }
        if let Some(v) = parse_field::<usize>(&mut fields, "chip_num")? {
            c.override_chip_num = v;
        }
        if let Some(v) = parse_field::<u8>(&mut fields, "wiper")? {
            c.wiper = v;
        }
        if let Some(v) = parse_field::<i32>(&mut fields, "override_diff")? {
            warn!(override_diff = v, "using difficulty override");
            c.override_diff = v;
        }
        if let Some(field) = fields.next() {
            if !field.is_empty() {
                let mask = u32::from_str_radix(field, 16)
                    .map_err(|_| Error::Config(format!("bad board_mask '{}'", field)))?;
                if mask != 0 {
                    warn!(board_mask = format!("{:#x}", mask), "masking chains");
                    c.chain_mask = mask;
                }
            }
        }
        Ok(())
    }

    /// Reject configurations the hardware cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.options.sys_clk_khz < 100_000 {
            return Err(Error::Config(
                "system clock must be above 100MHz".to_string(),
            ));
        }
        Ok(())
    }

    // --- Per-chain resolution ---

    pub fn chain_masked(&self, chain_id: usize) -> bool {
        self.options.chain_mask & (1 << chain_id) != 0
    }

    pub fn sys_clk_for_chain(&self, chain_id: usize) -> u32 {
        match self.extra.sys_clk_khz.get(chain_id) {
            Some(&khz) if khz != 0 => khz,
            _ => self.options.sys_clk_khz,
        }
    }

    pub fn spi_clk_for_chain(&self, chain_id: usize) -> u32 {
        match self.extra.spi_clk_khz.get(chain_id) {
            Some(&khz) if khz != 0 => khz,
            _ => self.options.spi_clk_khz,
        }
    }

    pub fn chip_bitmask_for_chain(&self, chain_id: usize) -> u64 {
        self.extra.chip_bitmask.get(chain_id).copied().unwrap_or(0)
    }

    pub fn wiper_for_board(&self, board_id: usize) -> u8 {
        match self.extra.wiper.get(board_id) {
            Some(&w) if w != 0 => w,
            _ => self.options.wiper,
        }
    }
}

fn parse_field<T: std::str::FromStr>(
    fields: &mut std::str::Split<'_, char>,
    name: &str,
) -> Result<Option<T>>
where
    T: Copy + Default + PartialEq,
{
    let Some(field) = fields.next() else {
        return Ok(None);
    };
    if field.is_empty() {
        return Ok(None);
    }
    let value: T = field
        .parse()
        .map_err(|_| Error::Config(format!("bad {} '{}'", name, field)))?;
    if value == T::default() {
        return Ok(None);
    }
    Ok(Some(value))
}

/// Parse a dash-separated per-board array. Entries beyond the last given
/// one repeat it, matching how rigs are populated with identical boards.
fn parse_board_array<T>(opt: &str, out: &mut [T; MAX_BOARDS], name: &str, is_hex: bool) -> Result<()>
where
    T: Copy + TryFrom<u64>,
{
    if opt.is_empty() {
        return Ok(());
    }
    debug!(array = name, value = opt, "parsing per-board array");

    let mut last: Option<T> = None;
    let mut n = 0;
    for (i, entry) in opt.split('-').take(MAX_BOARDS).enumerate() {
        let raw = if is_hex {
            u64::from_str_radix(entry, 16)
        } else {
            entry.parse::<u64>()
        }
        .map_err(|_| Error::Config(format!("bad {} entry '{}'", name, entry)))?;
        let value =
            T::try_from(raw).map_err(|_| Error::Config(format!("{} entry {} too large", name, raw)))?;
        out[i] = value;
        last = Some(value);
        n = i + 1;
    }
    if let Some(last) = last {
        for slot in out.iter_mut().skip(n) {
            *slot = last;
        }
        info!(array = name, entries = n, "per-board array scanned");
    }
    Ok(())
}
