//! Shared fakes for driver tests: a scripted SPI port, an I2C bus
//! backed by register arrays, and a recording host.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::host::Host;
use crate::hw_trait::{HwError, I2c, SharedI2c, SharedSpi, Spi};
use crate::job::WorkItem;

// --- SPI ---

enum Step {
    Respond(Vec<u8>),
    Fail,
}

#[derive(Default)]
struct SpiInner {
    steps: VecDeque<Step>,
    writes: Vec<Option<Vec<u8>>>,
    read_lens: Vec<usize>,
    speeds: Vec<u32>,
}

/// An SPI port answering from a queue of scripted responses. Transfers
/// beyond the script read back zeros, like an idle chain.
#[derive(Clone, Default)]
pub struct ScriptedSpi {
    inner: Arc<Mutex<SpiInner>>,
}

impl ScriptedSpi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> SharedSpi {
        Arc::new(tokio::sync::Mutex::new(Box::new(self.clone())))
    }

    /// The next transfer reads back these bytes (zero-padded to the
    /// transfer length).
    pub fn queue_response(&self, bytes: Vec<u8>) {
        self.inner.lock().steps.push_back(Step::Respond(bytes));
    }

    /// The next transfer fails.
    pub fn queue_fail(&self) {
        self.inner.lock().steps.push_back(Step::Fail);
    }

    /// Every observed transmit frame; `None` for half-duplex polls.
    pub fn writes(&self) -> Vec<Option<Vec<u8>>> {
        self.inner.lock().writes.clone()
    }

    /// The receive length of every transfer, in order.
    pub fn read_lens(&self) -> Vec<usize> {
        self.inner.lock().read_lens.clone()
    }

    pub fn transfer_count(&self) -> usize {
        self.inner.lock().read_lens.len()
    }

    pub fn speeds(&self) -> Vec<u32> {
        self.inner.lock().speeds.clone()
    }
}

#[async_trait]
impl Spi for ScriptedSpi {
    async fn transfer(&mut self, tx: Option<&[u8]>, rx: &mut [u8]) -> crate::hw_trait::Result<()> {
        let mut inner = self.inner.lock();
        inner.writes.push(tx.map(|t| t.to_vec()));
        inner.read_lens.push(rx.len());
        match inner.steps.pop_front() {
            Some(Step::Fail) => Err(HwError::Spi("scripted failure".to_string())),
            Some(Step::Respond(bytes)) => {
                rx.fill(0);
                let n = bytes.len().min(rx.len());
                rx[..n].copy_from_slice(&bytes[..n]);
                Ok(())
            }
            None => {
                rx.fill(0);
                Ok(())
            }
        }
    }

    async fn set_speed_khz(&mut self, khz: u32) -> crate::hw_trait::Result<()> {
        self.inner.lock().speeds.push(khz);
        Ok(())
    }
}

/// Queue the two transfers of one command exchange, placing `ack` at
/// the acknowledgement offset for a unicast to `chip_id`.
pub fn exec_ack(spi: &ScriptedSpi, chip_id: u8, data_len: usize, resp_len: usize, ack: &[u8]) {
    assert!(chip_id > 0, "helper covers unicast exchanges only");
    let tx_len = 4 + data_len;
    let poll_len = resp_len + 4 * chip_id as usize - 2;
    let ack_pos = poll_len - resp_len; // absolute offset in the window

    let mut first = vec![0u8; tx_len];
    let mut second = vec![0u8; poll_len];
    for (k, &byte) in ack.iter().enumerate() {
        let abs = ack_pos + k;
        if abs < tx_len {
            first[abs] = byte;
        } else {
            second[abs - tx_len] = byte;
        }
    }
    spi.queue_response(first);
    spi.queue_response(second);
}

/// An 8-byte READ_REG acknowledgement.
pub fn read_reg_payload(
    chip_id: u8,
    pll_echo: &[u8; 2],
    locked: bool,
    qstate: u8,
    qbuff: u8,
    cores: u8,
) -> [u8; 8] {
    [
        0x1a,
        chip_id,
        pll_echo[0],
        pll_echo[1],
        locked as u8,
        qstate,
        qbuff,
        cores,
    ]
}

/// Queue a successful WRITE_JOB exchange for `chip_id`.
pub fn write_job_ack(spi: &ScriptedSpi, chip_id: u8, job_id: u8) {
    let tx_len = 58 + 2;
    let poll_len = 4 * chip_id as usize - 2;
    let ack_pos = poll_len; // the job header echoes at the window tail

    let mut first = vec![0u8; tx_len];
    let mut second = vec![0u8; poll_len];
    let echo = [(job_id << 4) | 0x07, chip_id];
    for (k, &byte) in echo.iter().enumerate() {
        let abs = ack_pos + k;
        if abs < tx_len {
            first[abs] = byte;
        } else {
            second[abs - tx_len] = byte;
        }
    }
    spi.queue_response(first);
    spi.queue_response(second);
}

// --- I2C ---

#[derive(Default)]
struct I2cInner {
    devices: HashMap<u8, Vec<Option<u8>>>,
    writes: Vec<(u8, Vec<u8>)>,
}

/// An I2C bus backed by per-device register arrays. Addresses without a
/// registered device refuse to acknowledge.
#[derive(Clone, Default)]
pub struct FakeI2cBus {
    inner: Arc<Mutex<I2cInner>>,
}

impl FakeI2cBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> SharedI2c {
        Arc::new(tokio::sync::Mutex::new(Box::new(self.clone())))
    }

    /// Register a responding device with all registers readable as 0.
    pub fn add_device(&self, addr: u8) {
        self.inner.lock().devices.insert(addr, vec![Some(0); 256]);
    }

    pub fn set_reg(&self, addr: u8, reg: u8, value: u8) {
        if let Some(regs) = self.inner.lock().devices.get_mut(&addr) {
            regs[reg as usize] = Some(value);
        }
    }

    pub fn reg(&self, addr: u8, reg: u8) -> Option<u8> {
        self.inner
            .lock()
            .devices
            .get(&addr)
            .and_then(|regs| regs[reg as usize])
    }

    /// Every write observed on the bus, in order.
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.inner.lock().writes.clone()
    }

    /// Writes to one address only.
    pub fn writes_to(&self, addr: u8) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn clear_writes(&self) {
        self.inner.lock().writes.clear();
    }

    fn no_ack(addr: u8) -> HwError {
        HwError::I2c {
            addr,
            msg: "no acknowledgment".to_string(),
        }
    }
}

#[async_trait]
impl I2c for FakeI2cBus {
    async fn write(&mut self, addr: u8, data: &[u8]) -> crate::hw_trait::Result<()> {
        let mut inner = self.inner.lock();
        if !inner.devices.contains_key(&addr) {
            return Err(FakeI2cBus::no_ack(addr));
        }
        inner.writes.push((addr, data.to_vec()));
        if data.len() == 2 {
            if let Some(regs) = inner.devices.get_mut(&addr) {
                regs[data[0] as usize] = Some(data[1]);
            }
        }
        Ok(())
    }

    async fn read(&mut self, addr: u8, buffer: &mut [u8]) -> crate::hw_trait::Result<()> {
        let inner = self.inner.lock();
        let Some(regs) = inner.devices.get(&addr) else {
            return Err(FakeI2cBus::no_ack(addr));
        };
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = regs[i].ok_or_else(|| FakeI2cBus::no_ack(addr))?;
        }
        Ok(())
    }

    async fn write_read(
        &mut self,
        addr: u8,
        write: &[u8],
        read: &mut [u8],
    ) -> crate::hw_trait::Result<()> {
        let inner = self.inner.lock();
        let Some(regs) = inner.devices.get(&addr) else {
            return Err(FakeI2cBus::no_ack(addr));
        };
        let base = write.first().copied().unwrap_or(0) as usize;
        for (i, byte) in read.iter_mut().enumerate() {
            *byte = regs
                .get(base + i)
                .copied()
                .flatten()
                .ok_or_else(|| FakeI2cBus::no_ack(addr))?;
        }
        Ok(())
    }
}

// --- Host ---

#[derive(Default)]
struct HostInner {
    queued: VecDeque<WorkItem>,
    submitted: Vec<(u64, u32)>,
    completed: Vec<u64>,
    reject: bool,
}

/// A host that records every interaction.
#[derive(Clone, Default)]
pub struct RecordingHost {
    inner: Arc<Mutex<HostInner>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_work(&self, work: WorkItem) {
        self.inner.lock().queued.push_back(work);
    }

    /// Make `submit_nonce` reject everything from now on.
    pub fn reject_nonces(&self, reject: bool) {
        self.inner.lock().reject = reject;
    }

    /// `(work id, nonce)` pairs offered to the host.
    pub fn submitted(&self) -> Vec<(u64, u32)> {
        self.inner.lock().submitted.clone()
    }

    /// Ids of retired work items, in retirement order.
    pub fn completed(&self) -> Vec<u64> {
        self.inner.lock().completed.clone()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().queued.len()
    }
}

#[async_trait]
impl Host for RecordingHost {
    async fn get_queued(&self, _chain_id: usize) -> Option<WorkItem> {
        self.inner.lock().queued.pop_front()
    }

    async fn submit_nonce(&self, work: &WorkItem, nonce: u32) -> bool {
        let mut inner = self.inner.lock();
        inner.submitted.push((work.id, nonce));
        !inner.reject
    }

    async fn work_completed(&self, work: WorkItem) {
        self.inner.lock().completed.push(work.id);
    }
}

/// A plain test work item.
pub fn test_work(id: u64) -> WorkItem {
    WorkItem {
        id,
        midstate: [0; 32],
        tail: [0; 12],
        device_diff: 1.0,
    }
}
