//! Channel selection and payload decoding.
//!
//! A data frame payload holds the differential (bioamp) samples first, as
//! signed 16-bit little-endian counts, then the single-ended (GPI) samples
//! as unsigned 16-bit little-endian counts. Only channels enabled in the
//! masks written during the handshake are transmitted.

use std::ops::Range;

use log::warn;
use ndarray::Array2;

use crate::protocol::OFFSET_PAYLOAD;

/// Number of physical channels addressable by each 16-bit mask.
pub const CHANNELS_PER_MASK: usize = 16;

/// Differential gain in volts per count (range [-2.5, 2.5) V).
pub const DEFAULT_GAIN_DIFFERENTIAL: f64 = 0.00489;

/// Single-ended gain; samples are scaled by `raw / 1024 * gain`.
pub const DEFAULT_GAIN_SINGLE_ENDED: f64 = 0.00489;

/// Single-ended full scale used for normalisation.
pub const SINGLE_ENDED_FULL_SCALE: f64 = 1024.0;

/// Active channels, fixed for the life of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    differential_mask: u16,
    single_ended_mask: u16,
    differential: Vec<usize>,
    single_ended: Vec<usize>,
}

impl ChannelMap {
    pub fn from_masks(differential_mask: u16, single_ended_mask: u16) -> Self {
        Self {
            differential_mask,
            single_ended_mask,
            differential: mask_to_indices(differential_mask),
            single_ended: mask_to_indices(single_ended_mask),
        }
    }

    /// Physical differential channel numbers, ascending.
    pub fn differential(&self) -> &[usize] {
        &self.differential
    }

    /// Physical single-ended channel numbers, ascending.
    pub fn single_ended(&self) -> &[usize] {
        &self.single_ended
    }

    pub fn differential_count(&self) -> usize {
        self.differential.len()
    }

    pub fn single_ended_count(&self) -> usize {
        self.single_ended.len()
    }

    pub fn total(&self) -> usize {
        self.differential.len() + self.single_ended.len()
    }

    /// Buffer columns holding differential samples.
    pub fn differential_columns(&self) -> Range<usize> {
        0..self.differential.len()
    }

    /// Buffer columns holding single-ended samples.
    pub fn single_ended_columns(&self) -> Range<usize> {
        self.differential.len()..self.total()
    }

    /// Value written to the active-channels parameter: single-ended mask in the high half.
    pub fn channel_config(&self) -> u32 {
        (u32::from(self.single_ended_mask) << 16) | u32::from(self.differential_mask)
    }

    pub fn payload_size(&self) -> usize {
        crate::protocol::payload_size(self.differential_count(), self.single_ended_count())
    }

    pub fn frame_size(&self) -> usize {
        crate::protocol::frame_size(self.differential_count(), self.single_ended_count())
    }

    /// Column labels, e.g. `DE0`, `DE3`, `SE1`.
    pub fn labels(&self) -> Vec<String> {
        self.differential
            .iter()
            .map(|n| format!("DE{n}"))
            .chain(self.single_ended.iter().map(|n| format!("SE{n}")))
            .collect()
    }
}

fn mask_to_indices(mask: u16) -> Vec<usize> {
    (0..CHANNELS_PER_MASK)
        .filter(|&n| mask & (1u16 << n) != 0)
        .collect()
}

/// Decoded samples in volts, one row per frame.
#[derive(Debug, Clone)]
pub struct Samples {
    /// `[frames x differential_count]`
    pub differential: Array2<f64>,
    /// `[frames x single_ended_count]`
    pub single_ended: Array2<f64>,
}

impl Samples {
    pub fn len(&self) -> usize {
        self.differential.nrows().max(self.single_ended.nrows())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Converts accepted frames to physical units.
#[derive(Debug, Clone, Copy)]
pub struct SignalExtractor {
    differential_count: usize,
    single_ended_count: usize,
    gain_differential: f64,
    gain_single_ended: f64,
}

impl SignalExtractor {
    pub fn new(map: &ChannelMap, gain_differential: f64, gain_single_ended: f64) -> Self {
        Self {
            differential_count: map.differential_count(),
            single_ended_count: map.single_ended_count(),
            gain_differential,
            gain_single_ended,
        }
    }

    /// Decode frames that passed validation, one row per frame. Frames too
    /// short to hold every active channel are dropped.
    pub fn extract(&self, frames: &[&[u8]]) -> Samples {
        let se_start = OFFSET_PAYLOAD + 2 * self.differential_count;
        let needed = se_start + 2 * self.single_ended_count;
        let full: Vec<&[u8]> = frames.iter().copied().filter(|f| f.len() >= needed).collect();
        if full.len() < frames.len() {
            warn!(
                "dropped {} CPCH frames shorter than {} bytes",
                frames.len() - full.len(),
                needed
            );
        }
        let frames = full;
        let rows = frames.len();

        let differential = Array2::from_shape_fn((rows, self.differential_count), |(r, c)| {
            let at = OFFSET_PAYLOAD + 2 * c;
            let raw = i16::from_le_bytes([frames[r][at], frames[r][at + 1]]);
            f64::from(raw) * self.gain_differential
        });

        let single_ended = Array2::from_shape_fn((rows, self.single_ended_count), |(r, c)| {
            let at = se_start + 2 * c;
            let raw = u16::from_le_bytes([frames[r][at], frames[r][at + 1]]);
            f64::from(raw) / SINGLE_ENDED_FULL_SCALE * self.gain_single_ended
        });

        Samples {
            differential,
            single_ended,
        }
    }
}
