//! The chain model: detection, self-test, per-chip health, and the
//! per-chip job pipeline.
//!
//! A chain owns its chips and the SPI scratch buffers; chips refer back
//! to the chain by index. Chips are created during init and never
//! removed, only marked disabled. A chip that fails an SPI operation is
//! put on a 30 second cooldown; repeated cooldown failures disable it
//! for good.

use std::sync::Arc;

use tokio::time::{Duration, Instant};

use crate::config::Config;
use crate::host::Host;
use crate::hw_trait::SharedSpi;
use crate::job::{compact_target, WorkItem, WorkQueue};
use crate::stats::StatsLog;
use crate::tracing::prelude::*;

use super::pll::{self, PllParams};
use super::protocol::{self, NonceResult, Opcode, BROADCAST, MAX_CHAIN_LENGTH, RESET_STRATEGY_ABORT};
use super::tuner::TuneState;
use super::ChainError;

/// Scratch size covering the worst-case padded frame: a broadcast poll
/// across a full 64-chip chain.
pub(super) const SCRATCH_LEN: usize = 512;

/// Cooldown before a failed chip is retried.
const COOLDOWN: Duration = Duration::from_secs(30);
/// Failed cooldown retries after which a chip is disabled for good.
const DISABLE_CHIP_FAIL_THRESHOLD: u32 = 3;

const BROKEN_CHIP_CORE_THRESHOLD: u8 = 26;
const WEAK_CHIP_CORE_THRESHOLD: u8 = 30;
const BROKEN_CHIP_SYS_CLK_KHZ: u32 = 400_000;
const WEAK_CHIP_SYS_CLK_KHZ: u32 = 600_000;

/// Bus speed while the chain runs BIST on the bootstrap PLL.
const BIST_SPI_CLK_KHZ: u32 = 100;

const MAX_PLL_WAIT_CYCLES: u32 = 25;
const PLL_CYCLE_WAIT: Duration = Duration::from_millis(40);

/// One A1 ASIC on a chain.
#[derive(Debug)]
pub struct Chip {
    /// 1-based position in the chain.
    pub chip_id: u8,
    /// Live cores reported at BIST.
    pub num_cores: u8,
    /// In-flight work by job slot; `None` iff the slot is free.
    pub work: [Option<WorkItem>; 4],
    /// Next slot to fill. Advances modulo 4 only on successful WRITE_JOB.
    pub last_queued_id: usize,
    pub hw_errors: u64,
    pub stales: u64,
    pub nonces_found: u64,
    pub nonce_ranges_done: u64,
    /// Set while the chip cools down after an SPI failure.
    pub cooldown_begin: Option<Instant>,
    pub fail_count: u32,
    /// Terminal; never cleared.
    pub disabled: bool,
    /// Autotune measurement windows.
    pub tune: TuneState,
}

impl Chip {
    fn new(chip_id: u8, sys_clk_khz: u32, now: Instant) -> Self {
        Self {
            chip_id,
            num_cores: 0,
            work: Default::default(),
            last_queued_id: 0,
            hw_errors: 0,
            stales: 0,
            nonces_found: 0,
            nonce_ranges_done: 0,
            cooldown_begin: None,
            fail_count: 0,
            disabled: false,
            tune: TuneState::fresh(now, 0, sys_clk_khz),
        }
    }
}

/// One SPI-attached daisy chain of A1 chips.
pub struct Chain {
    pub(crate) chain_id: usize,
    pub(crate) spi: SharedSpi,
    pub(crate) tx: Vec<u8>,
    pub(crate) rx: Vec<u8>,
    pub(crate) chips: Vec<Chip>,
    /// Chips answering on the wire.
    pub(crate) num_chips: usize,
    /// Chips actually driven; may be capped below `num_chips` for testing.
    pub(crate) num_active_chips: usize,
    /// Live cores across non-disabled chips.
    pub(crate) num_cores: u32,
    pub(crate) sys_clk_khz: u32,
    pub(crate) spi_clk_khz: u32,
    /// Work pending dispatch to chips.
    pub(crate) active_wq: WorkQueue,
    pub(crate) temp: u8,
    pub(crate) last_temp_time: Option<Instant>,
    /// Whole nonce ranges completed since the last scan credit.
    pub(crate) nonce_ranges_processed: i64,
    pub(crate) config: Arc<Config>,
    pub(crate) stats: Arc<StatsLog>,
    last_target: Option<(f64, u32)>,
}

impl Chain {
    /// Detect and bring up the chain: count chips, run BIST on the
    /// bootstrap PLL, set the target clock, and classify every chip.
    pub async fn init(
        spi: SharedSpi,
        chain_id: usize,
        config: Arc<Config>,
        stats: Arc<StatsLog>,
    ) -> Result<Self, ChainError> {
        if config.chain_masked(chain_id) {
            warn!(chain = chain_id, "masked -> bypassing");
            return Err(ChainError::Masked);
        }
        debug!(chain = chain_id, "A1 init chain");

        let sys_clk_khz = config.sys_clk_for_chain(chain_id);
        let spi_clk_khz = config.spi_clk_for_chain(chain_id);
        let ref_clk_khz = config.options.ref_clk_khz;
        let override_chip_num = config.options.override_chip_num;

        let mut chain = Self {
            chain_id,
            spi,
            tx: vec![0; SCRATCH_LEN],
            rx: vec![0; SCRATCH_LEN],
            chips: Vec::new(),
            num_chips: 0,
            num_active_chips: 0,
            num_cores: 0,
            sys_clk_khz,
            spi_clk_khz,
            active_wq: WorkQueue::new(),
            temp: 0,
            last_temp_time: None,
            nonce_ranges_processed: 0,
            config,
            stats,
            last_target: None,
        };

        chain.num_chips = chain.detect_length().await?;
        if chain.num_chips == 0 {
            return Err(ChainError::NoChips);
        }
        info!(chain = chain_id, chips = chain.num_chips, "found A1 chip chain");

        // BIST runs on the 200 MHz bootstrap multiplier over a slow bus.
        chain.set_bus_speed(BIST_SPI_CLK_KHZ).await?;
        chain.cmd_write_reg(BROADCAST, &pll::bootstrap_reg()).await?;
        chain.cmd_bist_start().await?;

        chain
            .set_pll_config(BROADCAST, ref_clk_khz, sys_clk_khz)
            .await?;

        chain.set_bus_speed(spi_clk_khz).await?;
        info!(chain = chain_id, spi_khz = spi_clk_khz, "bus at configured speed");

        chain.num_active_chips = chain.num_chips;
        if override_chip_num > 0 && chain.num_chips > override_chip_num {
            chain.num_active_chips = override_chip_num;
            warn!(
                chain = chain_id,
                chips = chain.num_active_chips,
                "limiting chain"
            );
        }

        let now = Instant::now();
        chain.chips = (1..=chain.num_active_chips)
            .map(|id| Chip::new(id as u8, sys_clk_khz, now))
            .collect();

        chain.cmd_bist_fix().await?;

        for i in 0..chain.num_active_chips {
            chain.check_chip(i).await;
        }
        info!(
            chain = chain_id,
            chips = chain.num_active_chips,
            cores = chain.num_cores,
            "chain initialized"
        );
        Ok(chain)
    }

    /// Count chips by echo delay: a RESET header shifted through the
    /// chain comes back two bytes later per chip.
    async fn detect_length(&mut self) -> Result<usize, ChainError> {
        const TX_LEN: usize = 6;
        self.tx[..TX_LEN].fill(0);
        self.tx[0] = Opcode::Reset as u8;

        {
            let mut spi = self.spi.lock().await;
            spi.transfer(Some(&self.tx[..TX_LEN]), &mut self.rx[..TX_LEN])
                .await?;
        }
        trace!(
            chain = self.chain_id,
            rx = %crate::tracing::hex(&self.rx[..TX_LEN]),
            "detect"
        );

        let max_poll_words = MAX_CHAIN_LENGTH * 2;
        for i in 1..max_poll_words {
            if self.rx[0] == Opcode::Reset as u8 && self.rx[1] == 0 {
                return Ok(i / 2 + 1);
            }
            let mut spi = self.spi.lock().await;
            spi.transfer(None, &mut self.rx[..2]).await?;
        }
        warn!(chain = self.chain_id, "no A1 chip chain detected");
        Ok(0)
    }

    pub(crate) async fn set_bus_speed(&mut self, khz: u32) -> Result<(), ChainError> {
        let mut spi = self.spi.lock().await;
        spi.set_speed_khz(khz).await?;
        Ok(())
    }

    /// Restore the chain's configured bus speed. Called at the top of
    /// every scan tick, after the board selector routed the bus here.
    pub(crate) async fn apply_spi_clk(&mut self) -> Result<(), ChainError> {
        let khz = self.spi_clk_khz;
        self.set_bus_speed(khz).await
    }

    /// Write a PLL configuration and wait for lock. Broadcast writes
    /// verify every active chip; unicast writes verify their target.
    pub async fn set_pll_config(
        &mut self,
        chip_id: u8,
        ref_clk_khz: u32,
        sys_clk_khz: u32,
    ) -> Result<(), ChainError> {
        info!(
            chain = self.chain_id,
            chip = chip_id,
            ref_mhz = ref_clk_khz / 1000,
            sys_mhz = sys_clk_khz / 1000,
            "setting PLL"
        );
        let params = PllParams::for_clock(ref_clk_khz, sys_clk_khz);
        let reg = params.encode();
        debug!(
            chain = self.chain_id,
            fb_div = params.fb_div,
            pre_div = params.pre_div,
            post_div = params.post_div,
            reg = %crate::tracing::hex(&reg),
            "PLL dividers"
        );
        self.cmd_write_reg(chip_id, &reg).await?;

        let sweep: Vec<u8> = if chip_id == BROADCAST {
            (1..=self.num_active_chips as u8).collect()
        } else {
            vec![chip_id]
        };
        for cid in sweep {
            if !self.check_chip_pll_lock(cid, &reg).await {
                error!(chain = self.chain_id, chip = cid, "failed PLL lock");
                return Err(ChainError::PllLockTimeout { chip: cid });
            }
        }
        Ok(())
    }

    async fn check_chip_pll_lock(&mut self, chip_id: u8, reg: &[u8; 6]) -> bool {
        for _ in 0..MAX_PLL_WAIT_CYCLES {
            if let Ok(status) = self.cmd_read_reg(chip_id).await {
                if status.pll_locked() {
                    // double check that the chip latched what we wrote
                    return status.pll_echo() == [reg[0], reg[1]];
                }
            }
            tokio::time::sleep(PLL_CYCLE_WAIT).await;
        }
        false
    }

    /// Read back a chip after BIST and classify it: bypassed by config,
    /// broken (re-clock to 400 MHz and disable), weak (re-clock to
    /// 600 MHz, keep), or normal.
    async fn check_chip(&mut self, i: usize) {
        let chip_id = (i + 1) as u8;
        let cid = self.chain_id;

        if self.config.chip_bitmask_for_chain(cid) & (1 << i) != 0 {
            warn!(chain = cid, chip = i, "bypassing chip");
            let chip = &mut self.chips[i];
            chip.num_cores = 0;
            chip.disabled = true;
            return;
        }

        let status = match self.cmd_read_reg(chip_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    chain = cid,
                    chip = chip_id,
                    error = %e,
                    "failed to read register -> disabling"
                );
                let chip = &mut self.chips[i];
                chip.num_cores = 0;
                chip.disabled = true;
                return;
            }
        };

        let cores = status.core_count();
        self.chips[i].num_cores = cores;
        self.num_cores += u32::from(cores);
        info!(chain = cid, chip = chip_id, cores = cores, "found chip");

        let ref_clk_khz = self.config.options.ref_clk_khz;
        if cores < BROKEN_CHIP_CORE_THRESHOLD {
            warn!(
                chain = cid,
                chip = chip_id,
                cores = cores,
                threshold = BROKEN_CHIP_CORE_THRESHOLD,
                "broken chip"
            );
            if let Err(e) = self
                .set_pll_config(chip_id, ref_clk_khz, BROKEN_CHIP_SYS_CLK_KHZ)
                .await
            {
                warn!(chain = cid, chip = chip_id, error = %e, "downclock failed");
            }
            let _ = self.cmd_read_reg(chip_id).await;
            self.chips[i].disabled = true;
            self.num_cores -= u32::from(cores);
            return;
        }

        if cores < WEAK_CHIP_CORE_THRESHOLD {
            warn!(
                chain = cid,
                chip = chip_id,
                cores = cores,
                threshold = WEAK_CHIP_CORE_THRESHOLD,
                "weak chip"
            );
            if let Err(e) = self
                .set_pll_config(chip_id, ref_clk_khz, WEAK_CHIP_SYS_CLK_KHZ)
                .await
            {
                warn!(chain = cid, chip = chip_id, error = %e, "downclock failed");
            }
            let _ = self.cmd_read_reg(chip_id).await;
            self.chips[i].tune = TuneState::fresh(Instant::now(), cores, WEAK_CHIP_SYS_CLK_KHZ);
            return;
        }

        self.chips[i].tune = TuneState::fresh(Instant::now(), cores, self.sys_clk_khz);
    }

    /// A chip is reachable iff it is neither terminally disabled nor
    /// cooling down.
    pub fn is_chip_disabled(&self, chip_id: u8) -> bool {
        let chip = &self.chips[(chip_id - 1) as usize];
        chip.disabled || chip.cooldown_begin.is_some()
    }

    /// Take a chip off the bus after an SPI failure and start its
    /// cooldown.
    pub async fn disable_chip(&mut self, chip_id: u8) {
        let _ = self.flush_spi().await;
        let cid = self.chain_id;
        if self.is_chip_disabled(chip_id) {
            warn!(chain = cid, chip = chip_id, "already disabled");
            return;
        }
        warn!(chain = cid, chip = chip_id, "temporarily disabling chip");
        self.chips[(chip_id - 1) as usize].cooldown_begin = Some(Instant::now());
    }

    /// Retry chips whose cooldown has expired; disable for good after
    /// too many failed retries.
    pub async fn check_disabled_chips(&mut self) {
        let cid = self.chain_id;
        for i in 0..self.num_active_chips {
            let chip_id = (i + 1) as u8;
            {
                let chip = &self.chips[i];
                if chip.disabled {
                    continue;
                }
                match chip.cooldown_begin {
                    Some(begin) if begin.elapsed() >= COOLDOWN => {}
                    _ => continue,
                }
            }

            if self.cmd_read_reg(chip_id).await.is_err() {
                let chip = &mut self.chips[i];
                chip.fail_count += 1;
                warn!(
                    chain = cid,
                    chip = chip_id,
                    fails = chip.fail_count,
                    "not yet working"
                );
                if chip.fail_count > DISABLE_CHIP_FAIL_THRESHOLD {
                    warn!(chain = cid, chip = chip_id, "completely disabling chip");
                    chip.disabled = true;
                    self.num_cores -= u32::from(chip.num_cores);
                    continue;
                }
                chip.cooldown_begin = Some(Instant::now());
                continue;
            }

            info!(chain = cid, chip = chip_id, "chip is working again");
            let chip = &mut self.chips[i];
            chip.cooldown_begin = None;
            chip.fail_count = 0;
        }
    }

    /// Queue one work item on a chip. Returns true if a previously
    /// queued slot rolled over, i.e. a whole nonce range finished.
    ///
    /// `queue_slots` is the chip's self-reported busy slots (oldest job
    /// id in the low nibble, newest in the high); overlapping them is
    /// logged but the write proceeds.
    pub async fn set_work(
        &mut self,
        host: &dyn Host,
        chip_id: u8,
        work: WorkItem,
        queue_slots: u8,
    ) -> bool {
        let cid = self.chain_id;
        let idx = (chip_id - 1) as usize;
        let mut range_done = false;

        let slot = self.chips[idx].last_queued_id;
        let job_id = (slot + 1) as u8;
        debug!(
            chain = cid,
            chip = chip_id,
            job_id = job_id,
            state = format!("{:#04x}", queue_slots),
            "queuing job"
        );
        if job_id == (queue_slots & 0x0f) || job_id == (queue_slots >> 4) {
            warn!(
                chain = cid,
                chip = chip_id,
                job_id = job_id,
                state = format!("{:#04x}", queue_slots),
                "job overlap"
            );
        }

        if let Some(prev) = self.chips[idx].work[slot].take() {
            host.work_completed(prev).await;
            range_done = true;
        }

        let target = self.job_target(work.device_diff);
        let frame = protocol::job_frame(chip_id, job_id, &work, target);
        match self.cmd_write_job(chip_id, &frame).await {
            Ok(()) => {
                let chip = &mut self.chips[idx];
                chip.work[slot] = Some(work);
                chip.last_queued_id = (slot + 1) & 3;
            }
            Err(e) => {
                error!(
                    chain = cid,
                    chip = chip_id,
                    job_id = job_id,
                    error = %e,
                    "failed to set work"
                );
                host.work_completed(work).await;
                self.disable_chip(chip_id).await;
            }
        }
        range_done
    }

    /// Poll the chain's result queue once.
    pub async fn get_nonce(&mut self) -> Result<Option<NonceResult>, ChainError> {
        self.cmd_read_result_bcast().await
    }

    /// Discard all queued jobs in the whole chain.
    pub async fn abort_work(&mut self) -> Result<(), ChainError> {
        self.cmd_reset_bcast(RESET_STRATEGY_ABORT).await
    }

    /// Retire every in-flight work item of one chip.
    pub async fn flush_chip(&mut self, host: &dyn Host, i: usize) {
        for slot in 0..4 {
            if let Some(work) = self.chips[i].work[slot].take() {
                host.work_completed(work).await;
            }
        }
        self.chips[i].last_queued_id = 0;
    }

    /// Reset one chip, drop its queued work, and bring it back at a new
    /// clock.
    pub(super) async fn restart_chip(&mut self, host: &dyn Host, i: usize, new_clk_khz: u32) -> bool {
        let chip_id = (i + 1) as u8;
        if let Err(e) = self.cmd_reset(chip_id, RESET_STRATEGY_ABORT).await {
            warn!(
                chain = self.chain_id,
                chip = chip_id,
                error = %e,
                "chip reset failed"
            );
            return false;
        }
        self.flush_chip(host, i).await;
        let ref_clk_khz = self.config.options.ref_clk_khz;
        self.set_pll_config(chip_id, ref_clk_khz, new_clk_khz)
            .await
            .is_ok()
    }

    /// Job target for a work item under the configured difficulty
    /// override; `None` keeps the default difficulty-1 target.
    fn job_target(&mut self, device_diff: f64) -> Option<u32> {
        let od = self.config.options.override_diff;
        if od == 0 {
            return None;
        }
        let mut diff = device_diff;
        if od != -1 && f64::from(od) < diff {
            diff = f64::from(od);
        }
        if let Some((last, bits)) = self.last_target {
            if last == diff {
                return Some(bits);
            }
        }
        let bits = compact_target(diff);
        self.last_target = Some((diff, bits));
        Some(bits)
    }
}

#[cfg(test)]
impl Chain {
    /// Build an initialized chain without driving the bus.
    pub(crate) fn test_fixture(
        spi: SharedSpi,
        num_chips: usize,
        cores_per_chip: u8,
        config: Arc<Config>,
    ) -> Self {
        let now = Instant::now();
        let sys_clk_khz = config.options.sys_clk_khz;
        let chips: Vec<Chip> = (1..=num_chips)
            .map(|id| {
                let mut chip = Chip::new(id as u8, sys_clk_khz, now);
                chip.num_cores = cores_per_chip;
                chip.tune = TuneState::fresh(now, cores_per_chip, sys_clk_khz);
                chip
            })
            .collect();
        Self {
            chain_id: 0,
            spi,
            tx: vec![0; SCRATCH_LEN],
            rx: vec![0; SCRATCH_LEN],
            num_chips,
            num_active_chips: num_chips,
            num_cores: u32::from(cores_per_chip) * num_chips as u32,
            chips,
            sys_clk_khz,
            spi_clk_khz: config.options.spi_clk_khz,
            active_wq: WorkQueue::new(),
            temp: 0,
            last_temp_time: None,
            nonce_ranges_processed: 0,
            config,
            stats: Arc::new(StatsLog::disabled()),
            last_target: None,
        }
    }
}
