//! The SPI command layer.
//!
//! Every command is two transfers: the frame itself (full duplex), then
//! a half-duplex poll that keeps the clock running while the frame
//! traverses the chain and the acknowledgement walks back. Each chip
//! adds one chip-cycle (two bytes) of delay in each direction, so:
//!
//! - broadcast: `poll_len = resp_len + 4 * num_chips` (plus a safety
//!   margin of 8 assumed chips while the chain length is unknown)
//! - unicast to chip N: `poll_len = resp_len + 4 * N - 2`
//!
//! The acknowledgement then sits `resp_len` bytes before the end of the
//! combined receive window.

use crate::tracing::hex;
use crate::tracing::prelude::*;

use super::chain::Chain;
use super::protocol::{
    is_result_marker, NonceResult, Opcode, RegStatus, BROADCAST, WRITE_JOB_LENGTH,
};
use super::ChainError;

/// Zero bytes clocked out to drain the pipeline after an error.
const FLUSH_LEN: usize = 64;

/// Extra poll margin while the chain length is still unknown.
const UNKNOWN_CHAIN_POLL: usize = 32;

impl Chain {
    /// Send a command frame and clock the response back. Returns the
    /// offset of the acknowledgement in the receive scratch buffer.
    async fn exec_cmd(
        &mut self,
        cmd: Opcode,
        chip_id: u8,
        data: &[u8],
        resp_len: usize,
    ) -> Result<usize, ChainError> {
        let tx_len = 4 + data.len();
        self.tx[..tx_len].fill(0);
        self.tx[0] = cmd as u8;
        self.tx[1] = chip_id;
        self.tx[2..2 + data.len()].copy_from_slice(data);

        {
            let mut spi = self.spi.lock().await;
            spi.transfer(Some(&self.tx[..tx_len]), &mut self.rx[..tx_len])
                .await?;
        }
        trace!(
            chain = self.chain_id,
            tx = %hex(&self.tx[..tx_len]),
            rx = %hex(&self.rx[..tx_len]),
            "send"
        );

        let mut poll_len = resp_len;
        if chip_id == BROADCAST {
            if self.num_chips == 0 {
                debug!(chain = self.chain_id, "unknown chips in chain, assuming 8");
                poll_len += UNKNOWN_CHAIN_POLL;
            }
            poll_len += 4 * self.num_chips;
        } else {
            poll_len += 4 * chip_id as usize - 2;
        }

        {
            let mut spi = self.spi.lock().await;
            spi.transfer(None, &mut self.rx[tx_len..tx_len + poll_len])
                .await?;
        }
        trace!(
            chain = self.chain_id,
            rx = %hex(&self.rx[tx_len..tx_len + poll_len]),
            "poll"
        );

        // ack_pos = tx_len + poll_len - (tx_len + resp_len)
        Ok(poll_len - resp_len)
    }

    pub(super) async fn cmd_bist_start(&mut self) -> Result<(), ChainError> {
        let ack = self.exec_cmd(Opcode::BistStart, BROADCAST, &[0, 0], 0).await?;
        self.expect_echo(Opcode::BistStart, BROADCAST, ack)
    }

    pub(super) async fn cmd_bist_fix(&mut self) -> Result<(), ChainError> {
        let ack = self.exec_cmd(Opcode::BistFix, BROADCAST, &[], 0).await?;
        self.expect_echo(Opcode::BistFix, BROADCAST, ack)
    }

    /// Broadcast RESET with a strategy byte (doubled on the wire).
    pub(super) async fn cmd_reset_bcast(&mut self, strategy: u8) -> Result<(), ChainError> {
        let ack = self
            .exec_cmd(Opcode::Reset, BROADCAST, &[strategy, strategy], 0)
            .await?;
        self.expect_reset_echo(BROADCAST, ack)
    }

    /// Unicast RESET, used to restart a single chip.
    pub(super) async fn cmd_reset(&mut self, chip_id: u8, strategy: u8) -> Result<(), ChainError> {
        let ack = self
            .exec_cmd(Opcode::Reset, chip_id, &[strategy, strategy], 0)
            .await?;
        self.expect_reset_echo(chip_id, ack)
    }

    pub(super) async fn cmd_write_reg(
        &mut self,
        chip_id: u8,
        reg: &[u8; 6],
    ) -> Result<(), ChainError> {
        let ack = self.exec_cmd(Opcode::WriteReg, chip_id, reg, 0).await?;
        self.expect_echo(Opcode::WriteReg, chip_id, ack)
    }

    pub(crate) async fn cmd_read_reg(&mut self, chip_id: u8) -> Result<RegStatus, ChainError> {
        let ack = self.exec_cmd(Opcode::ReadReg, chip_id, &[], 6).await?;
        let raw: [u8; 8] = [
            self.rx[ack],
            self.rx[ack + 1],
            self.rx[ack + 2],
            self.rx[ack + 3],
            self.rx[ack + 4],
            self.rx[ack + 5],
            self.rx[ack + 6],
            self.rx[ack + 7],
        ];
        if raw[0] != super::protocol::READ_REG_RESP || raw[1] != chip_id {
            debug!(
                chain = self.chain_id,
                chip = chip_id,
                echo = %hex(&raw[..2]),
                "READ_REG failed"
            );
            return Err(ChainError::BadEcho {
                cmd: Opcode::ReadReg,
                chip: chip_id,
                echo: [raw[0], raw[1]],
            });
        }
        Ok(RegStatus::new(raw))
    }

    /// Queue a 58-byte job frame on a chip. Two extra zero bytes push
    /// the command through to the last chip in the chain.
    pub(super) async fn cmd_write_job(
        &mut self,
        chip_id: u8,
        job: &[u8],
    ) -> Result<(), ChainError> {
        let tx_len = WRITE_JOB_LENGTH + 2;
        self.tx[..tx_len].fill(0);
        self.tx[..WRITE_JOB_LENGTH].copy_from_slice(job);

        {
            let mut spi = self.spi.lock().await;
            spi.transfer(Some(&self.tx[..tx_len]), &mut self.rx[..tx_len])
                .await?;
        }
        let poll_len = 4 * chip_id as usize - 2;
        {
            let mut spi = self.spi.lock().await;
            spi.transfer(None, &mut self.rx[tx_len..tx_len + poll_len])
                .await?;
        }
        trace!(
            chain = self.chain_id,
            chip = chip_id,
            rx = %hex(&self.rx[tx_len..tx_len + poll_len]),
            "job poll"
        );

        // ack_pos = tx_len + poll_len - tx_len: the job header echoes back
        let ack = poll_len;
        if self.rx[ack] != self.tx[0] || self.rx[ack + 1] != self.tx[1] {
            debug!(
                chain = self.chain_id,
                chip = chip_id,
                got = %hex(&self.rx[ack..ack + 2]),
                want = %hex(&self.tx[..2]),
                "WRITE_JOB failed"
            );
            return Err(ChainError::BadEcho {
                cmd: Opcode::WriteJob,
                chip: chip_id,
                echo: [self.rx[ack], self.rx[ack + 1]],
            });
        }
        Ok(())
    }

    /// Poll the chain's shared result queue: write an 8-byte prelude,
    /// clock back one chip-cycle per chip, and scan word-wise for the
    /// first READ_RESULT marker. A record with chip id 0 means the
    /// queue is empty.
    pub(super) async fn cmd_read_result_bcast(
        &mut self,
    ) -> Result<Option<NonceResult>, ChainError> {
        const TX_LEN: usize = 8;
        self.tx[..TX_LEN].fill(0);
        self.tx[0] = Opcode::ReadResult as u8;

        {
            let mut spi = self.spi.lock().await;
            spi.transfer(Some(&self.tx[..TX_LEN]), &mut self.rx[..TX_LEN])
                .await?;
        }
        let poll_len = TX_LEN + 4 * self.num_chips;
        {
            let mut spi = self.spi.lock().await;
            spi.transfer(None, &mut self.rx[TX_LEN..TX_LEN + poll_len])
                .await?;
        }

        for i in (0..poll_len).step_by(2) {
            if is_result_marker(self.rx[i]) {
                let record = [
                    self.rx[i],
                    self.rx[i + 1],
                    self.rx[i + 2],
                    self.rx[i + 3],
                    self.rx[i + 4],
                    self.rx[i + 5],
                ];
                let result = NonceResult::from_record(&record);
                if result.chip_id == 0 {
                    trace!(chain = self.chain_id, "output queue empty");
                    return Ok(None);
                }
                return Ok(Some(result));
            }
        }
        error!(chain = self.chain_id, "READ_RESULT found no marker");
        Err(ChainError::NoResultMarker)
    }

    /// Clock out zeros to drain the chain's pipeline after an error.
    pub(crate) async fn flush_spi(&mut self) -> Result<(), ChainError> {
        self.tx[..FLUSH_LEN].fill(0);
        let mut spi = self.spi.lock().await;
        spi.transfer(Some(&self.tx[..FLUSH_LEN]), &mut self.rx[..FLUSH_LEN])
            .await?;
        Ok(())
    }

    fn expect_echo(&self, cmd: Opcode, chip_id: u8, ack: usize) -> Result<(), ChainError> {
        if self.rx[ack] != cmd as u8 {
            debug!(
                chain = self.chain_id,
                chip = chip_id,
                cmd = ?cmd,
                echo = %hex(&self.rx[ack..ack + 2]),
                "command echo mismatch"
            );
            return Err(ChainError::BadEcho {
                cmd,
                chip: chip_id,
                echo: [self.rx[ack], self.rx[ack + 1]],
            });
        }
        Ok(())
    }

    /// RESET echo; tolerated while the chain length is still unknown
    /// (nothing sensible comes back during detection).
    fn expect_reset_echo(&self, chip_id: u8, ack: usize) -> Result<(), ChainError> {
        if self.rx[ack] != Opcode::Reset as u8 && self.num_chips != 0 {
            debug!(
                chain = self.chain_id,
                chip = chip_id,
                echo = %hex(&self.rx[ack..ack + 2]),
                "RESET echo mismatch"
            );
            return Err(ChainError::BadEcho {
                cmd: Opcode::Reset,
                chip: chip_id,
                echo: [self.rx[ack], self.rx[ack + 1]],
            });
        }
        Ok(())
    }
}
