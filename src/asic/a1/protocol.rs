//! A1 wire protocol: command opcodes, frame layouts, and response
//! records.
//!
//! Chips on a chain form a shift register: a frame written at the head
//! takes one chip-cycle (two bytes) to traverse each chip, and the
//! response walks back under the same discipline. The command layer in
//! `commands.rs` appends the clock-through padding; this module defines
//! the frames themselves.

use bytes::{BufMut, BytesMut};

use crate::job::WorkItem;

/// Longest supported daisy chain.
pub const MAX_CHAIN_LENGTH: usize = 64;

/// Broadcast chip id.
pub const BROADCAST: u8 = 0;

/// A WRITE_JOB frame, header through end nonce.
pub const WRITE_JOB_LENGTH: usize = 58;

/// RESET strategy discarding all queued jobs.
pub const RESET_STRATEGY_ABORT: u8 = 0xe5;

/// Compact target for difficulty 1, the default job target.
pub const DIFF1_TARGET_BITS: u32 = 0x1d00ffff;

/// Command opcodes, the first byte of every frame. The second byte is
/// the target chip id, 0 for broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    BistStart = 0x01,
    BistFix = 0x03,
    Reset = 0x04,
    WriteJob = 0x07,
    ReadResult = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0a,
}

/// READ_REG responses echo this opcode instead of `ReadReg`.
pub const READ_REG_RESP: u8 = 0x1a;

/// A chip's 2-bit self-report of its job queue fill level, from the
/// READ_REG status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Both front slots free; queue two jobs.
    Empty,
    /// One slot free.
    OneFree,
    /// Reserved encoding; treat as a protocol error.
    Invalid,
    Full,
}

impl QueueState {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => QueueState::Empty,
            1 => QueueState::OneFree,
            2 => QueueState::Invalid,
            _ => QueueState::Full,
        }
    }
}

/// The eight-byte acknowledgement of a READ_REG command.
#[derive(Debug, Clone, Copy)]
pub struct RegStatus {
    raw: [u8; 8],
}

impl RegStatus {
    pub fn new(raw: [u8; 8]) -> Self {
        Self { raw }
    }

    /// The last written PLL register bytes, echoed back.
    pub fn pll_echo(&self) -> [u8; 2] {
        [self.raw[2], self.raw[3]]
    }

    pub fn pll_locked(&self) -> bool {
        self.raw[4] & 1 == 1
    }

    pub fn queue_state(&self) -> QueueState {
        QueueState::from_bits(self.raw[5])
    }

    /// Busy job ids: oldest in the low nibble, newest in the high.
    pub fn queue_slots(&self) -> u8 {
        self.raw[6]
    }

    /// Live core count as reported by BIST.
    pub fn core_count(&self) -> u8 {
        self.raw[7]
    }
}

/// A nonce record from READ_RESULT: `{job_id:4, cmd:4, chip_id:8,
/// nonce:32}` with the nonce big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceResult {
    pub job_id: u8,
    pub chip_id: u8,
    pub nonce: u32,
}

impl NonceResult {
    pub fn from_record(record: &[u8; 6]) -> Self {
        Self {
            job_id: record[0] >> 4,
            chip_id: record[1],
            nonce: u32::from_be_bytes([record[2], record[3], record[4], record[5]]),
        }
    }
}

/// Does a response word open a READ_RESULT record?
pub fn is_result_marker(byte: u8) -> bool {
    byte & 0x0f == Opcode::ReadResult as u8
}

/// Build a 58-byte WRITE_JOB frame.
///
/// `job_id` is the chip's 1..=4 slot index. `target` replaces the
/// default difficulty-1 compact target when the driver overrides the
/// job difficulty.
pub fn job_frame(chip_id: u8, job_id: u8, work: &WorkItem, target: Option<u32>) -> BytesMut {
    debug_assert!((1..=4).contains(&job_id));

    let mut frame = BytesMut::with_capacity(WRITE_JOB_LENGTH);
    frame.put_u8((job_id << 4) | Opcode::WriteJob as u8);
    frame.put_u8(chip_id);

    // Midstate goes out byte-reversed as one 256-bit word.
    frame.extend(work.midstate.iter().rev());

    // Header tail: three little-endian words converted to big-endian.
    for word in work.tail.chunks_exact(4) {
        frame.put_u32(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
    }

    frame.put_u32(0); // start nonce
    frame.put_u32_le(target.unwrap_or(DIFF1_TARGET_BITS));
    frame.put_u32(0xffff_ffff); // end nonce

    debug_assert_eq!(frame.len(), WRITE_JOB_LENGTH);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work() -> WorkItem {
        let mut midstate = [0u8; 32];
        for (i, b) in midstate.iter_mut().enumerate() {
            *b = i as u8;
        }
        WorkItem {
            id: 1,
            midstate,
            tail: [
                0x11, 0x22, 0x33, 0x44, // merkle tail
                0x55, 0x66, 0x77, 0x88, // ntime
                0x99, 0xaa, 0xbb, 0xcc, // nbits
            ],
            device_diff: 1.0,
        }
    }

    #[test]
    fn job_frame_layout() {
        let frame = job_frame(3, 2, &work(), None);
        assert_eq!(frame.len(), WRITE_JOB_LENGTH);

        // header: job_id in the high nibble over the opcode
        assert_eq!(frame[0], (2 << 4) | 0x07);
        assert_eq!(frame[1], 3);

        // midstate byte-reversed: first wire byte is the last midstate byte
        assert_eq!(frame[2], 31);
        assert_eq!(frame[33], 0);

        // header words byte-swapped from little-endian source
        assert_eq!(&frame[34..38], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&frame[38..42], &[0x88, 0x77, 0x66, 0x55]);
        assert_eq!(&frame[42..46], &[0xcc, 0xbb, 0xaa, 0x99]);

        // start nonce, difficulty-1 target (little-endian), end nonce
        assert_eq!(&frame[46..50], &[0, 0, 0, 0]);
        assert_eq!(&frame[50..54], &[0xff, 0xff, 0x00, 0x1d]);
        assert_eq!(&frame[54..58], &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn job_frame_target_override() {
        let frame = job_frame(1, 1, &work(), Some(0x1c00ffff));
        assert_eq!(&frame[50..54], &[0xff, 0xff, 0x00, 0x1c]);
    }

    #[test]
    fn nonce_result_record() {
        let record = [(3 << 4) | 0x08, 5, 0xde, 0xad, 0xbe, 0xef];
        let result = NonceResult::from_record(&record);
        assert_eq!(result.job_id, 3);
        assert_eq!(result.chip_id, 5);
        assert_eq!(result.nonce, 0xdeadbeef);
    }

    #[test]
    fn result_marker() {
        assert!(is_result_marker(0x08));
        assert!(is_result_marker(0x38));
        assert!(!is_result_marker(0x04));
        assert!(!is_result_marker(0x00));
    }

    #[test]
    fn queue_state_bits() {
        assert_eq!(QueueState::from_bits(0), QueueState::Empty);
        assert_eq!(QueueState::from_bits(1), QueueState::OneFree);
        assert_eq!(QueueState::from_bits(2), QueueState::Invalid);
        assert_eq!(QueueState::from_bits(3), QueueState::Full);
        // only the low two bits count
        assert_eq!(QueueState::from_bits(0xfd), QueueState::OneFree);
    }

    #[test]
    fn reg_status_fields() {
        let status = RegStatus::new([0x1a, 2, 0x42, 0x32, 0x01, 0x01, 0x21, 32]);
        assert_eq!(status.pll_echo(), [0x42, 0x32]);
        assert!(status.pll_locked());
        assert_eq!(status.queue_state(), QueueState::OneFree);
        assert_eq!(status.queue_slots(), 0x21);
        assert_eq!(status.core_count(), 32);
    }
}
