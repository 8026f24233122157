//! Structural validation of candidate frames.
//!
//! Acceptance is decided by the status high nibble and the declared payload
//! length only. Checksum failures and the ADC error flag are counted for
//! diagnostics but do not reject a frame: the firmware is known to raise the
//! ADC flag on otherwise usable samples.

use std::ops::AddAssign;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::protocol::{checksum_batch, OFFSET_LENGTH, OFFSET_SEQUENCE, OFFSET_STATUS};

/// Status flags reported in the high nibble; any of them marks the frame bad.
pub const STATUS_ERROR_MASK: u8 = 0xF0;

/// ADC error flag in the status byte.
pub const STATUS_ADC_ERROR: u8 = 0x08;

/// Frame defect counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub bad_status: u64,
    pub bad_length: u64,
    pub bad_checksum: u64,
    pub bad_sequence: u64,
    pub adc_error: u64,
}

impl ErrorStats {
    pub fn total(&self) -> u64 {
        self.bad_status + self.bad_length + self.bad_checksum + self.bad_sequence + self.adc_error
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for ErrorStats {
    fn add_assign(&mut self, rhs: Self) {
        self.bad_status += rhs.bad_status;
        self.bad_length += rhs.bad_length;
        self.bad_checksum += rhs.bad_checksum;
        self.bad_sequence += rhs.bad_sequence;
        self.adc_error += rhs.adc_error;
    }
}

/// Result of validating one batch of candidate frames.
#[derive(Debug, Clone, Default)]
pub struct Validation<'a> {
    /// Frames that passed the status and length checks, in arrival order.
    pub accepted: Vec<&'a [u8]>,
    pub stats: ErrorStats,
}

impl Validation<'_> {
    pub fn has_valid_data(&self) -> bool {
        !self.accepted.is_empty()
    }
}

/// Checks candidate frames against the payload length fixed at handshake time.
#[derive(Debug, Clone, Copy)]
pub struct MessageValidator {
    expected_payload_len: usize,
}

impl MessageValidator {
    pub fn new(expected_payload_len: usize) -> Self {
        Self {
            expected_payload_len,
        }
    }

    /// Validate a batch. Every counter except `bad_sequence` is computed
    /// over the whole batch; sequence continuity only over accepted frames.
    pub fn validate<'a, F: AsRef<[u8]>>(&self, frames: &'a [F]) -> Validation<'a> {
        let frames: Vec<&'a [u8]> = frames.iter().map(AsRef::as_ref).collect();
        let crcs = checksum_batch(&frames);

        let mut stats = ErrorStats::default();
        let mut accepted = Vec::with_capacity(frames.len());

        for (frame, crc) in frames.iter().zip(&crcs) {
            // The aligner only hands over full frames; anything shorter is treated as a length fault.
            let (Some(&status), Some(&length)) =
                (frame.get(OFFSET_STATUS), frame.get(OFFSET_LENGTH))
            else {
                stats.bad_length += 1;
                continue;
            };

            let status_ok = status & STATUS_ERROR_MASK == 0;
            let length_ok = length as usize == self.expected_payload_len;

            stats.bad_status += u64::from(!status_ok);
            stats.bad_length += u64::from(!length_ok);
            stats.bad_checksum += u64::from(*crc != 0);
            stats.adc_error += u64::from(status & STATUS_ADC_ERROR != 0);

            if status_ok && length_ok {
                accepted.push(*frame);
            }
        }

        stats.bad_sequence = count_sequence_breaks(&accepted);

        if !stats.is_clean() {
            debug!(
                "frame defects in batch of {} ({} accepted): {:?}",
                frames.len(),
                accepted.len(),
                stats
            );
        }

        Validation { accepted, stats }
    }
}

/// Count frames whose sequence byte differs from `first + index` (mod 256).
fn count_sequence_breaks(accepted: &[&[u8]]) -> u64 {
    let Some(first) = accepted.first().map(|f| f[OFFSET_SEQUENCE]) else {
        return 0;
    };
    accepted
        .iter()
        .enumerate()
        .filter(|(i, frame)| frame[OFFSET_SEQUENCE] != first.wrapping_add(*i as u8))
        .count() as u64
}
