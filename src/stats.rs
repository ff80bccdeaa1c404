//! Optional autotune stats log.
//!
//! An append-only plain-text file recording every windowed tuning
//! decision: `+++` lines for good windows, `---` for bad ones, `CHANGE`
//! lines when a chip's clock moves, and limit lines when a chip pins at
//! the lower clock. Absent a configured path, every call is a no-op.

use std::fs::{File, OpenOptions};
use std::io::Write;

use parking_lot::Mutex;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::asic::a1::tuner::NonceWindow;
use crate::tracing::prelude::*;

pub struct StatsLog {
    file: Mutex<Option<File>>,
}

impl StatsLog {
    /// Open the stats file, or construct a disabled log when no path is
    /// configured. Open failures are logged and degrade to disabled.
    pub fn open(path: Option<&str>) -> Self {
        let file = path.and_then(|p| {
            match OpenOptions::new().create(true).append(true).open(p) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(path = p, error = %e, "failed to open stats file");
                    None
                }
            }
        });
        Self {
            file: Mutex::new(file),
        }
    }

    pub fn disabled() -> Self {
        Self {
            file: Mutex::new(None),
        }
    }

    /// Window summary on a tuning decision point.
    pub fn log_stat(
        &self,
        chain_id: usize,
        chip_id: u8,
        window: &NonceWindow,
        prev_clk_khz: u32,
        ratio_pm: u32,
        bad: bool,
    ) {
        self.write_line(format_args!(
            "{} {} {}/{}: {}/{}-{}, {} ({})",
            time_string(),
            if bad { "---" } else { "+++" },
            chain_id,
            chip_id,
            window.shares_nok,
            window.shares_ok,
            ratio_pm,
            window.sys_clk_khz / 1000,
            prev_clk_khz / 1000,
        ));
    }

    /// A clock change; `prev` is the window that triggered it.
    pub fn log_change(
        &self,
        chain_id: usize,
        chip_id: u8,
        prev: &NonceWindow,
        new_clk_khz: u32,
        ratio_pm: u32,
    ) {
        self.write_line(format_args!(
            "{} {} CHANGE: {}/{}: {}/{}/{} {}->{}",
            time_string(),
            if prev.sys_clk_khz < new_clk_khz { "+++" } else { "---" },
            chain_id,
            chip_id,
            prev.shares_nok,
            prev.shares_ok,
            ratio_pm,
            prev.sys_clk_khz / 1000,
            new_clk_khz / 1000,
        ));
    }

    /// A chip that wants to downtune but is already at the lower clamp.
    pub fn log_limit(&self, chain_id: usize, chip_id: u8, clk_khz: u32) {
        self.write_line(format_args!(
            "{} {}/{}: limit reached: clk={}",
            time_string(),
            chain_id,
            chip_id,
            clk_khz,
        ));
    }

    /// Flush and drop the file handle.
    pub fn close(&self) {
        let mut file = self.file.lock();
        if let Some(f) = file.as_mut() {
            let _ = f.flush();
        }
        *file = None;
    }

    fn write_line(&self, line: std::fmt::Arguments<'_>) {
        let mut file = self.file.lock();
        if let Some(f) = file.as_mut() {
            if writeln!(f, "{}", line).and_then(|_| f.flush()).is_err() {
                warn!("stats file write failed, disabling stats log");
                *file = None;
            }
        }
    }
}

fn time_string() -> String {
    let format = format_description!("[[[year]-[month]-[day] [hour]:[minute]:[second]]");
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&format)
        .unwrap_or_else(|_| String::from("[unknown]"))
}
