//! The per-chain mining device and product detection.
//!
//! [`detect`] probes the supported products (Desk, Blade, Rig, bare
//! single chain) and returns one [`A1Device`] per live chain. The host
//! runs one hashing thread per device and drives it through
//! [`A1Device::scanwork`], [`A1Device::queue_full`] and
//! [`A1Device::flush_work`]; inside a scan tick everything is
//! sequential blocking I/O under the board selector's bus guard (outer)
//! and the chain mutex (inner).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

use crate::asic::a1::protocol::QueueState;
use crate::asic::a1::Chain;
use crate::board::{
    desk, rig, BladeSelector, BoardSelector, DeskSelector, DummySelector, RigSelector,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::hw_trait::{SharedI2c, SharedSpi};
use crate::peripheral::mcp4x::Mcp4x;
use crate::stats::StatsLog;
use crate::tracing::prelude::*;

const TEMP_UPDATE_INTERVAL: Duration = Duration::from_millis(2000);
const TEMP_THROTTLE_SLEEP: Duration = Duration::from_millis(5000);
const IDLE_SLEEP: Duration = Duration::from_millis(120);

/// One registered chain, scheduled by the host as a hashing device.
pub struct A1Device {
    name: &'static str,
    chain_id: usize,
    chain: Mutex<Chain>,
    selector: Arc<dyn BoardSelector>,
    host: Arc<dyn Host>,
    stats: Arc<StatsLog>,
    cutoff_temp: u8,
    work_restart: AtomicBool,
    disabled: AtomicBool,
}

impl A1Device {
    fn new(
        name: &'static str,
        chain: Chain,
        selector: Arc<dyn BoardSelector>,
        host: Arc<dyn Host>,
        stats: Arc<StatsLog>,
        cutoff_temp: u8,
    ) -> Self {
        Self {
            name,
            chain_id: chain.chain_id,
            chain: Mutex::new(chain),
            selector,
            host,
            stats,
            cutoff_temp,
            work_restart: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn chain_id(&self) -> usize {
        self.chain_id
    }

    /// Permanently out of service (no live cores left).
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Ask the scan loop to abandon the tick; cleared by the next
    /// [`flush_work`](Self::flush_work).
    pub fn request_restart(&self) {
        self.work_restart.store(true, Ordering::Relaxed);
    }

    fn restart_requested(&self) -> bool {
        self.work_restart.load(Ordering::Relaxed)
    }

    /// One scheduler tick: harvest results, dispatch queued work, and
    /// return the hashes credited (`nonce ranges * 2^32`).
    pub async fn scanwork(&self) -> i64 {
        if self.is_disabled() || self.restart_requested() {
            return 0;
        }

        let guard = match self.selector.select(self.chain_id).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(chain = self.chain_id, error = %e, "board select failed");
                return 0;
            }
        };
        let mut chain = self.chain.lock().await;
        let cid = chain.chain_id;

        if chain.num_cores == 0 {
            warn!(chain = cid, "no active cores, disabling device");
            self.disabled.store(true, Ordering::Relaxed);
            return 0;
        }
        if let Err(e) = chain.apply_spi_clk().await {
            warn!(chain = cid, error = %e, "failed to set bus speed");
            return 0;
        }
        trace!(chain = cid, "running scanwork");

        let mut sleep_for = IDLE_SLEEP;

        let now = Instant::now();
        let stale_temp = chain
            .last_temp_time
            .map_or(true, |t| t + TEMP_UPDATE_INTERVAL < now);
        if stale_temp {
            chain.temp = self.selector.get_temp(&guard, 0).await;
            chain.last_temp_time = Some(now);
        }

        // harvest phase: drain the chain's result queue
        loop {
            if self.restart_requested() {
                return 0;
            }
            let result = match chain.get_nonce().await {
                Ok(Some(result)) => result,
                Ok(None) => break,
                Err(e) => {
                    debug!(chain = cid, error = %e, "result poll failed");
                    break;
                }
            };
            let (chip_id, job_id, nonce) = (result.chip_id, result.job_id, result.nonce);

            if chip_id < 1 || chip_id as usize > chain.num_active_chips {
                warn!(chain = cid, chip = chip_id, "wrong chip_id in result");
                continue;
            }
            if job_id < 1 || job_id > 4 {
                warn!(chain = cid, chip = chip_id, job = job_id, "wrong result job_id");
                let _ = chain.flush_spi().await;
                continue;
            }

            let idx = (chip_id - 1) as usize;
            let submitted = match chain.chips[idx].work[(job_id - 1) as usize].as_ref() {
                Some(work) => Some((self.host.submit_nonce(work, nonce).await, work.device_diff)),
                None => None,
            };
            let Some((accepted, device_diff)) = submitted else {
                // the slot was flushed since the chip took the job
                warn!(
                    chain = cid,
                    chip = chip_id,
                    nonce = format!("{:#010x}", nonce),
                    "stale nonce"
                );
                chain.chips[idx].stales += 1;
                continue;
            };
            if !accepted {
                let penalty = device_diff as i64;
                chain.nonce_ranges_processed -= penalty;
                warn!(
                    chain = cid,
                    chip = chip_id,
                    nonce = format!("{:#010x}", nonce),
                    penalty = penalty,
                    "invalid nonce"
                );
                chain.add_nonce_bad(self.host.as_ref(), idx).await;
                continue;
            }
            debug!(
                chain = cid,
                chip = chip_id,
                job = job_id,
                nonce = format!("{:#010x}", nonce),
                "nonce accepted"
            );
            chain.add_nonce_good(self.host.as_ref(), idx).await;
        }

        if self.cutoff_temp > 0 && chain.temp > self.cutoff_temp {
            warn!(
                chain = cid,
                temp = chain.temp,
                cutoff = self.cutoff_temp,
                "thermal throttling"
            );
            sleep_for = TEMP_THROTTLE_SLEEP;
        } else {
            // dispatch phase, farthest chip first for equal SPI fairness
            for i in (1..=chain.num_active_chips).rev() {
                if self.restart_requested() {
                    return 0;
                }
                let chip_id = i as u8;
                if chain.is_chip_disabled(chip_id) {
                    continue;
                }
                let status = match chain.cmd_read_reg(chip_id).await {
                    Ok(status) => status,
                    Err(_) => {
                        chain.disable_chip(chip_id).await;
                        continue;
                    }
                };
                let queue_slots = status.queue_slots();
                match status.queue_state() {
                    QueueState::Full => continue,
                    QueueState::Invalid => {
                        error!(chain = cid, chip = chip_id, "invalid queue state");
                        continue;
                    }
                    state => {
                        // an empty front means both slots are free: queue two
                        let rounds = if state == QueueState::Empty { 2 } else { 1 };
                        for _ in 0..rounds {
                            let Some(work) = chain.active_wq.dequeue() else {
                                debug!(chain = cid, chip = chip_id, "work underflow");
                                break;
                            };
                            if chain
                                .set_work(self.host.as_ref(), chip_id, work, queue_slots)
                                .await
                            {
                                chain.chips[i - 1].nonce_ranges_done += 1;
                                chain.nonce_ranges_processed += 1;
                            }
                        }
                        let chip = &chain.chips[i - 1];
                        trace!(
                            chain = cid,
                            chip = chip_id,
                            ranges = chip.nonce_ranges_done,
                            nonces = chip.nonces_found,
                            errors = chip.hw_errors,
                            stales = chip.stales,
                            "job state"
                        );
                    }
                }
            }
            chain.check_disabled_chips().await;
        }

        let mut credited = 0i64;
        if chain.nonce_ranges_processed < 0 {
            debug!(
                chain = cid,
                ranges = chain.nonce_ranges_processed,
                "negative nonce ranges, crediting nothing"
            );
        } else {
            credited = chain.nonce_ranges_processed << 32;
            chain.nonce_ranges_processed = 0;
        }
        drop(chain);
        drop(guard);

        sleep(sleep_for).await;
        credited
    }

    /// Accept one work item from the host, or report the queue full.
    /// The chain buffers two items per active chip.
    pub async fn queue_full(&self) -> bool {
        let mut chain = self.chain.lock().await;
        debug!(
            chain = chain.chain_id,
            queued = chain.active_wq.len(),
            chips = chain.num_active_chips,
            "queue_full"
        );
        if chain.active_wq.len() >= 2 * chain.num_active_chips {
            return true;
        }
        if let Some(work) = self.host.get_queued(self.chain_id).await {
            chain.active_wq.enqueue(work);
        }
        false
    }

    /// Drop all current work: abort the chips' queues, retire every
    /// in-flight item, and drain the pending queue. Chips with an
    /// elapsed clean tuning window take their clock step here instead
    /// (the restart already reset them).
    pub async fn flush_work(&self) {
        let guard = match self.selector.select(self.chain_id).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(chain = self.chain_id, error = %e, "flush: board select failed");
                return;
            }
        };
        let mut chain = self.chain.lock().await;
        let cid = chain.chain_id;
        let _ = chain.apply_spi_clk().await;
        debug!(chain = cid, "running flush_work");

        if chain.abort_work().await.is_err() {
            error!(chain = cid, "failed to abort work in chip chain");
        }
        for i in 0..chain.num_active_chips {
            if chain.check_uptune(self.host.as_ref(), i).await {
                continue;
            }
            chain.flush_chip(self.host.as_ref(), i).await;
        }
        debug!(chain = cid, "flushing queued work");
        while let Some(work) = chain.active_wq.dequeue() {
            self.host.work_completed(work).await;
        }
        drop(chain);
        drop(guard);
        self.work_restart.store(false, Ordering::Relaxed);
    }

    /// Status prefix for the host's device line: chain id, active
    /// chips, active cores, board temperature.
    pub async fn statline(&self) -> String {
        let chain = self.chain.lock().await;
        let temp = if chain.temp != 0 {
            format!("{:2}°C", chain.temp)
        } else {
            "    ".to_string()
        };
        format!(
            " {:2}:{:2}/{:3} {}",
            chain.chain_id, chain.num_active_chips, chain.num_cores, temp
        )
    }

    /// Close the stats log and release the board selector. The SPI and
    /// I2C handles are released when the device is dropped.
    pub async fn thread_shutdown(&self) {
        debug!(chain = self.chain_id, device = self.name, "closing");
        self.stats.close();
        self.selector.exit().await;
    }
}

/// Probe SPI buses and register every live chain as a device.
///
/// Products are tried in fixed order: Desk, Blade, Rig, then a bare
/// single chain on `spi0`. Blade routes odd chains to `spi1`. Returns
/// an error if nothing answers.
pub async fn detect(
    hotplug: bool,
    spi0: SharedSpi,
    spi1: Option<SharedSpi>,
    i2c: Option<SharedI2c>,
    host: Arc<dyn Host>,
    config: Config,
) -> Result<Vec<Arc<A1Device>>> {
    // no hotplug support for SPI
    if hotplug {
        return Ok(Vec::new());
    }
    config.validate()?;
    let config = Arc::new(config);
    let stats = Arc::new(StatsLog::open(config.options.stats_fname.as_deref()));
    debug!("A1 detect");

    let mut ctx = DetectCtx {
        spi0,
        spi1,
        host,
        config,
        stats,
        devices: Vec::new(),
    };

    if let Some(i2c) = i2c {
        let found = detect_desk(&mut ctx, &i2c).await
            || detect_blade(&mut ctx, &i2c).await
            || detect_rig(&mut ctx, &i2c).await;
        if found {
            return Ok(ctx.devices);
        }
    }

    if detect_single_chain(&mut ctx).await {
        return Ok(ctx.devices);
    }

    ctx.stats.close();
    Err(Error::NothingDetected)
}

struct DetectCtx {
    spi0: SharedSpi,
    spi1: Option<SharedSpi>,
    host: Arc<dyn Host>,
    config: Arc<Config>,
    stats: Arc<StatsLog>,
    devices: Vec<Arc<A1Device>>,
}

impl DetectCtx {
    fn register(&mut self, name: &'static str, chain: Chain, selector: Arc<dyn BoardSelector>) {
        let device = A1Device::new(
            name,
            chain,
            selector,
            self.host.clone(),
            self.stats.clone(),
            self.config.options.cutoff_temp,
        );
        self.devices.push(Arc::new(device));
    }
}

async fn detect_desk(ctx: &mut DetectCtx, i2c: &SharedI2c) -> bool {
    let Some(selector) = DeskSelector::probe(i2c.clone()).await else {
        return false;
    };
    let _ = selector.reset_all().await;

    let mut boards = 0;
    for board_id in 0..selector.max_chains() {
        // program the board's trimpot before the chain powers up
        let pot = Mcp4x::new(i2c.clone(), desk::TRIMPOT_ADDRESSES[board_id]);
        if pot.probe().await {
            set_board_wiper(&pot, &ctx.config, board_id).await;
        }

        info!(board = board_id, "checking board");
        let Ok(guard) = selector.select(board_id).await else {
            continue;
        };
        let chain = Chain::init(
            ctx.spi0.clone(),
            board_id,
            ctx.config.clone(),
            ctx.stats.clone(),
        )
        .await;
        drop(guard);

        match chain {
            Ok(chain) => {
                ctx.register("BitmineA1.CCD", chain, selector.clone());
                boards += 1;
            }
            Err(e) => debug!(board = board_id, error = %e, "no chain on board"),
        }
    }
    if boards == 0 {
        return false;
    }
    info!(boards = boards, "detected CoinCraft Desk");
    true
}

async fn detect_blade(ctx: &mut DetectCtx, i2c: &SharedI2c) -> bool {
    let Some(selector) = BladeSelector::probe(i2c.clone()).await else {
        return false;
    };
    let _ = selector.reset_all().await;

    let mut boards = 0;
    for chain_id in 0..selector.max_chains() {
        if ctx.config.chain_masked(chain_id) {
            continue;
        }
        info!(board = chain_id, "checking board");
        let Ok(guard) = selector.select(chain_id).await else {
            continue;
        };
        // odd chains route to the second SPI bus
        let spi = if chain_id & 1 == 1 {
            match &ctx.spi1 {
                Some(spi1) => spi1.clone(),
                None => {
                    debug!(chain = chain_id, "no second SPI bus, using the first");
                    ctx.spi0.clone()
                }
            }
        } else {
            ctx.spi0.clone()
        };
        let chain = Chain::init(spi, chain_id, ctx.config.clone(), ctx.stats.clone()).await;
        drop(guard);

        match chain {
            Ok(chain) => {
                ctx.register("BitmineA1.CCB", chain, selector.clone());
                boards += 1;
            }
            Err(e) => debug!(chain = chain_id, error = %e, "no chain"),
        }
    }
    if boards == 0 {
        return false;
    }
    info!(boards = boards, "detected CoinCraft Blade");
    true
}

async fn detect_rig(ctx: &mut DetectCtx, i2c: &SharedI2c) -> bool {
    let Some(selector) = RigSelector::probe(i2c.clone()).await else {
        return false;
    };
    let _ = selector.reset_all().await;

    let mut chains = 0;
    for chain_id in 0..selector.max_chains() {
        info!(chain = chain_id, "checking RIG chain");
        let Ok(guard) = selector.select(chain_id).await else {
            continue;
        };
        let chain = Chain::init(
            ctx.spi0.clone(),
            chain_id,
            ctx.config.clone(),
            ctx.stats.clone(),
        )
        .await;
        drop(guard);

        let Ok(chain) = chain else {
            continue;
        };

        // the board's two chains share a trimpot; the even chain sets it
        let wiper = ctx.config.options.wiper;
        if wiper != 0 && chain_id & 1 == 0 {
            let pot = Mcp4x::new(i2c.clone(), rig::TRIMPOT_ADDRESS);
            if pot.probe().await {
                let _ = pot.set_wiper(0, wiper).await;
                let _ = pot.set_wiper(1, wiper).await;
                info!(
                    chain = chain_id,
                    wiper = format!("{:#04x}", wiper),
                    "set trimpot wipers"
                );
            } else {
                error!(chain = chain_id, "cannot access trimpot");
            }
        }

        ctx.register("BitmineA1.CCR", chain, selector.clone());
        chains += 1;
    }
    if chains == 0 {
        return false;
    }
    info!(chains = chains, "detected CoinCraft Rig");
    true
}

async fn detect_single_chain(ctx: &mut DetectCtx) -> bool {
    info!("checking single chain");
    let selector = DummySelector::new();
    match Chain::init(ctx.spi0.clone(), 0, ctx.config.clone(), ctx.stats.clone()).await {
        Ok(chain) => {
            info!(
                chips = chain.num_active_chips,
                cores = chain.num_cores,
                "detected single A1 chain"
            );
            ctx.register("BitmineA1.SingleChain", chain, selector);
            true
        }
        Err(e) => {
            debug!(error = %e, "no single chain");
            false
        }
    }
}

async fn set_board_wiper(pot: &Mcp4x, config: &Config, board_id: usize) {
    let wiper = config.wiper_for_board(board_id);
    if wiper == 0 {
        return;
    }
    info!(
        board = board_id,
        wiper = format!("{:#04x}", wiper),
        "setting trimpot wiper"
    );
    if let Err(e) = pot.set_wiper(0, wiper).await {
        warn!(board = board_id, error = %e, "wiper write failed");
    }
}
