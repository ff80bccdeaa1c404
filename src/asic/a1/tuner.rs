//! Per-chip clock autotuning.
//!
//! Each chip keeps a sliding measurement window of good and bad nonces.
//! A clean window whose time span has elapsed raises the chip's clock
//! by one step; a window with too many bad nonces lowers it. The window
//! before the current one is kept as a snapshot so a chip that already
//! climbed past its peak never climbs again: good nonces only trigger
//! an uptune check while the current clock is above the previous
//! window's clock.

use tokio::time::{Duration, Instant};

use crate::host::Host;
use crate::tracing::prelude::*;

use super::chain::Chain;

/// Bad nonces in a window before a downtune is considered.
const BAD_NONCE_COUNT: u32 = 5;
/// Window length in whole-chip nonce ranges.
const NONCE_RANGES_PER_WINDOW: f64 = 200.0;
/// Nonces required before the error ratio means anything.
const MIN_NUM_NONCES: u32 = 30;
/// Clock adjustment step.
const CLOCK_DELTA_KHZ: i32 = 4_000;

/// One measurement window.
#[derive(Debug, Clone, Copy)]
pub struct NonceWindow {
    pub shares_ok: u32,
    pub shares_nok: u32,
    pub start_time: Instant,
    pub end_time: Instant,
    pub sys_clk_khz: u32,
}

impl NonceWindow {
    /// A fresh window: its span is the expected time for the chip to
    /// sweep 200 whole nonce ranges at the given clock.
    pub fn new(now: Instant, num_cores: u8, sys_clk_khz: u32) -> Self {
        // nonces per second = cores * clk_hz / 2^32
        let nonces_per_sec = f64::from(num_cores) * f64::from(sys_clk_khz) / 4_294_967.296;
        let end_time = if nonces_per_sec > 0.0 {
            now + Duration::from_secs_f64(NONCE_RANGES_PER_WINDOW / nonces_per_sec)
        } else {
            now
        };
        Self {
            shares_ok: 0,
            shares_nok: 0,
            start_time: now,
            end_time,
            sys_clk_khz,
        }
    }

    /// Bad-nonce fraction in permille, rounded; `None` until the window
    /// holds enough nonces to be meaningful.
    pub fn ratio_pm(&self) -> Option<u32> {
        let all = self.shares_ok + self.shares_nok;
        if all < MIN_NUM_NONCES {
            return None;
        }
        Some((self.shares_nok * 1000 + all / 2) / all)
    }
}

/// A chip's current window plus the snapshot of the one before it.
#[derive(Debug, Clone, Copy)]
pub struct TuneState {
    pub current: NonceWindow,
    pub prev: NonceWindow,
}

impl TuneState {
    pub fn fresh(now: Instant, num_cores: u8, sys_clk_khz: u32) -> Self {
        let window = NonceWindow::new(now, num_cores, sys_clk_khz);
        Self {
            current: window,
            prev: window,
        }
    }
}

impl Chain {
    /// Evict the current measurements: snapshot the window and start a
    /// new one, optionally at a new clock.
    pub(super) fn reset_nonce_stats(&mut self, i: usize, new_clk_khz: Option<u32>) {
        let now = Instant::now();
        let chip = &mut self.chips[i];
        let clk = new_clk_khz.unwrap_or(chip.tune.current.sys_clk_khz);
        chip.tune.prev = chip.tune.current;
        chip.tune.current = NonceWindow::new(now, chip.num_cores, clk);
    }

    /// Account a host-accepted nonce. Returns true if the chip was
    /// uptuned (and therefore reset).
    pub async fn add_nonce_good(&mut self, host: &dyn Host, i: usize) -> bool {
        {
            let chip = &mut self.chips[i];
            chip.nonces_found += 1;
            chip.tune.current.shares_ok += 1;
            // don't climb again once past the peak
            if chip.tune.current.sys_clk_khz <= chip.tune.prev.sys_clk_khz {
                return false;
            }
        }
        self.check_uptune(host, i).await
    }

    /// Account a host-rejected nonce. Returns true if the chip was
    /// downtuned.
    pub async fn add_nonce_bad(&mut self, host: &dyn Host, i: usize) -> bool {
        let (window, prev_clk, chip_id) = {
            let chip = &mut self.chips[i];
            chip.hw_errors += 1;
            chip.tune.current.shares_nok += 1;
            if chip.tune.current.shares_nok < BAD_NONCE_COUNT {
                return false;
            }
            (chip.tune.current, chip.tune.prev.sys_clk_khz, chip.chip_id)
        };
        let Some(ratio) = window.ratio_pm() else {
            return false;
        };
        self.stats
            .log_stat(self.chain_id, chip_id, &window, prev_clk, ratio, true);

        if !self.config.options.enable_auto_tune {
            return false;
        }
        if ratio > self.config.options.upper_ratio_pm {
            if window.sys_clk_khz > self.config.options.lower_clk_khz {
                return self.adjust_clock(host, i, -CLOCK_DELTA_KHZ, ratio).await;
            }
            self.stats
                .log_limit(self.chain_id, chip_id, window.sys_clk_khz);
        }
        self.reset_nonce_stats(i, None);
        false
    }

    /// Raise the chip's clock if its window elapsed cleanly. Also called
    /// from flush handling: an uptuned chip was just reset, so its
    /// queued work needs no separate flush.
    pub async fn check_uptune(&mut self, host: &dyn Host, i: usize) -> bool {
        let upper = self.config.options.upper_clk_khz;
        let (window, prev_clk, chip_id) = {
            let chip = &self.chips[i];
            (chip.tune.current, chip.tune.prev.sys_clk_khz, chip.chip_id)
        };
        if window.sys_clk_khz >= upper {
            return false;
        }
        if window.end_time > Instant::now() {
            return false;
        }
        let Some(ratio) = window.ratio_pm() else {
            return false;
        };
        self.stats
            .log_stat(self.chain_id, chip_id, &window, prev_clk, ratio, false);

        if !self.config.options.enable_auto_tune {
            return false;
        }
        if ratio < self.config.options.lower_ratio_pm {
            return self.adjust_clock(host, i, CLOCK_DELTA_KHZ, ratio).await;
        }
        self.reset_nonce_stats(i, None);
        false
    }

    /// Move the chip's clock by `delta_khz`, clamped to the configured
    /// band. A clamp that lands on the current clock is a no-op; an
    /// actual change restarts the chip and starts a fresh window at the
    /// new clock.
    async fn adjust_clock(&mut self, host: &dyn Host, i: usize, delta_khz: i32, ratio: u32) -> bool {
        let lower = self.config.options.lower_clk_khz;
        let upper = self.config.options.upper_clk_khz;
        let current = self.chips[i].tune.current.sys_clk_khz;
        let new_clk =
            (i64::from(current) + i64::from(delta_khz)).clamp(i64::from(lower), i64::from(upper)) as u32;
        if new_clk == current {
            return false;
        }

        if !self.restart_chip(host, i, new_clk).await {
            // the measurements died with the failed reset
            self.reset_nonce_stats(i, None);
            return false;
        }
        self.reset_nonce_stats(i, Some(new_clk));

        let chip_id = self.chips[i].chip_id;
        let prev = self.chips[i].tune.prev;
        info!(
            chain = self.chain_id,
            chip = chip_id,
            from_khz = current,
            to_khz = new_clk,
            ratio_pm = ratio,
            "adjusted chip clock"
        );
        self.stats
            .log_change(self.chain_id, chip_id, &prev, new_clk, ratio);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::asic::a1::pll::PllParams;
    use crate::asic::a1::protocol::Opcode;
    use crate::config::Config;
    use crate::test_utils::{exec_ack, read_reg_payload, RecordingHost, ScriptedSpi};

    fn tuning_config() -> Arc<Config> {
        let mut config = Config::default();
        config.options.enable_auto_tune = true;
        Arc::new(config)
    }

    fn fixture(spi: &ScriptedSpi) -> Chain {
        Chain::test_fixture(spi.shared(), 1, 32, tuning_config())
    }

    /// Queue the SPI traffic of a successful chip restart at `sys_khz`:
    /// unicast RESET, then WRITE_REG + one locked READ_REG poll.
    fn script_restart(spi: &ScriptedSpi, sys_khz: u32) {
        exec_ack(spi, 1, 2, 0, &[Opcode::Reset as u8]);
        let reg = PllParams::for_clock(16_000, sys_khz).encode();
        exec_ack(spi, 1, 6, 0, &[Opcode::WriteReg as u8]);
        exec_ack(
            spi,
            1,
            0,
            6,
            &read_reg_payload(1, &[reg[0], reg[1]], true, 0, 0, 32),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn five_bad_nonces_downtune() {
        let spi = ScriptedSpi::new();
        let host = RecordingHost::new();
        let mut chain = fixture(&spi);

        // 25 good nonces keep the ratio window populated
        for _ in 0..25 {
            chain.add_nonce_good(&host, 0).await;
        }
        script_restart(&spi, 796_000);

        // four bad nonces do nothing yet
        for _ in 0..4 {
            assert!(!chain.add_nonce_bad(&host, 0).await);
        }
        // the fifth reaches the count; ratio = (5*1000 + 15) / 30 = 167 pm
        assert!(chain.add_nonce_bad(&host, 0).await);

        let tune = &chain.chips[0].tune;
        assert_eq!(tune.current.sys_clk_khz, 796_000);
        assert_eq!(tune.prev.sys_clk_khz, 800_000);
        assert_eq!(tune.current.shares_ok, 0);
        assert_eq!(tune.current.shares_nok, 0);
        assert_eq!(chain.chips[0].hw_errors, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_ratio_at_lower_clamp_only_resets_window() {
        let spi = ScriptedSpi::new();
        let host = RecordingHost::new();
        let mut chain = fixture(&spi);
        chain.chips[0].tune.current.sys_clk_khz = 400_000;

        for _ in 0..25 {
            chain.add_nonce_good(&host, 0).await;
        }
        for _ in 0..5 {
            assert!(!chain.add_nonce_bad(&host, 0).await);
        }
        // no restart traffic, just a window reset
        assert_eq!(spi.transfer_count(), 0);
        assert_eq!(chain.chips[0].tune.current.shares_nok, 0);
        assert_eq!(chain.chips[0].tune.current.sys_clk_khz, 400_000);
    }

    #[tokio::test(start_paused = true)]
    async fn no_uptune_before_window_elapses() {
        let spi = ScriptedSpi::new();
        let host = RecordingHost::new();
        let mut chain = fixture(&spi);
        // pretend the chip already climbed once, so good nonces check
        chain.chips[0].tune.prev.sys_clk_khz = 796_000;

        for _ in 0..40 {
            assert!(!chain.add_nonce_good(&host, 0).await);
        }
        assert_eq!(spi.transfer_count(), 0, "window still open, no restart");
    }

    #[tokio::test(start_paused = true)]
    async fn clean_elapsed_window_uptunes() {
        let spi = ScriptedSpi::new();
        let host = RecordingHost::new();
        let mut chain = fixture(&spi);
        chain.chips[0].tune.prev.sys_clk_khz = 796_000;

        for _ in 0..30 {
            chain.add_nonce_good(&host, 0).await;
        }
        // let the measurement window run out
        tokio::time::advance(Duration::from_secs(7_000)).await;

        script_restart(&spi, 804_000);
        assert!(chain.add_nonce_good(&host, 0).await);
        assert_eq!(chain.chips[0].tune.current.sys_clk_khz, 804_000);
        assert_eq!(chain.chips[0].tune.prev.sys_clk_khz, 800_000);
    }

    #[tokio::test(start_paused = true)]
    async fn peak_stickiness_blocks_uptune() {
        let spi = ScriptedSpi::new();
        let host = RecordingHost::new();
        let mut chain = fixture(&spi);
        // previous window ran at the same clock: the chip is at (or past)
        // its peak and good nonces must not re-check
        assert_eq!(
            chain.chips[0].tune.prev.sys_clk_khz,
            chain.chips[0].tune.current.sys_clk_khz
        );

        for _ in 0..40 {
            assert!(!chain.add_nonce_good(&host, 0).await);
        }
        tokio::time::advance(Duration::from_secs(10_000)).await;
        for _ in 0..10 {
            assert!(!chain.add_nonce_good(&host, 0).await);
        }
        assert_eq!(spi.transfer_count(), 0);

        // flush-driven check_uptune bypasses the peak gate
        script_restart(&spi, 804_000);
        assert!(chain.check_uptune(&host, 0).await);
        assert_eq!(chain.chips[0].tune.current.sys_clk_khz, 804_000);
    }

    #[tokio::test(start_paused = true)]
    async fn uptune_stops_at_upper_clamp() {
        let spi = ScriptedSpi::new();
        let host = RecordingHost::new();
        let mut chain = fixture(&spi);
        chain.chips[0].tune.current.sys_clk_khz = 1_100_000;
        chain.chips[0].tune.prev.sys_clk_khz = 1_096_000;

        for _ in 0..40 {
            chain.add_nonce_good(&host, 0).await;
        }
        tokio::time::advance(Duration::from_secs(10_000)).await;
        assert!(!chain.check_uptune(&host, 0).await);
        assert_eq!(spi.transfer_count(), 0);
        assert_eq!(chain.chips[0].tune.current.sys_clk_khz, 1_100_000);
    }

    #[tokio::test(start_paused = true)]
    async fn too_few_nonces_never_tune() {
        let spi = ScriptedSpi::new();
        let host = RecordingHost::new();
        let mut chain = fixture(&spi);
        chain.chips[0].tune.prev.sys_clk_khz = 796_000;

        // 29 nonces total: below the minimum, ratio unknown
        for _ in 0..25 {
            chain.add_nonce_good(&host, 0).await;
        }
        tokio::time::advance(Duration::from_secs(10_000)).await;
        for _ in 0..4 {
            assert!(!chain.add_nonce_bad(&host, 0).await);
        }
        assert!(!chain.check_uptune(&host, 0).await);
        assert_eq!(spi.transfer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_flushes_in_flight_work() {
        let spi = ScriptedSpi::new();
        let host = RecordingHost::new();
        let mut chain = fixture(&spi);
        chain.chips[0].work[1] = Some(crate::job::WorkItem {
            id: 9,
            midstate: [0; 32],
            tail: [0; 12],
            device_diff: 1.0,
        });

        for _ in 0..25 {
            chain.add_nonce_good(&host, 0).await;
        }
        script_restart(&spi, 796_000);
        for _ in 0..5 {
            chain.add_nonce_bad(&host, 0).await;
        }
        assert_eq!(host.completed(), vec![9]);
        assert!(chain.chips[0].work.iter().all(|w| w.is_none()));
    }
}
