//! Frame alignment over an unframed byte stream.
//!
//! The only delimiter the headstage offers is the start marker (128), and
//! that value is just as likely to show up inside a payload. Alignment
//! therefore guesses boundaries from the spacing of start markers: a real
//! frame start is followed by another one exactly `frame_size` bytes later.
//! The guess is approximate. A dropped frame that leaves a gap which is not
//! a multiple of the frame size, combined with a payload byte of 128 at the
//! right distance, can still misalign; checksum, length and sequence checks
//! downstream catch what this pass lets through.

use log::debug;

use crate::protocol::START_MARKER;

/// Output of one alignment pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Alignment {
    /// Byte offsets of accepted frame starts, ascending and `frame_size` apart.
    pub offsets: Vec<usize>,
    /// Candidate frames, copied out of the input.
    pub frames: Vec<Vec<u8>>,
    /// Unconsumed bytes to prepend to the next read.
    pub remainder: Vec<u8>,
}

impl Alignment {
    /// Total bytes in the aligned frames.
    pub fn aligned_bytes(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }
}

/// Splits a byte stream into fixed-size candidate frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameAligner {
    frame_size: usize,
}

impl FrameAligner {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Align `data` (carried remainder already prepended).
    pub fn align(&self, data: &[u8]) -> Alignment {
        let size = self.frame_size;
        if size == 0 || data.len() < size {
            return Self::unaligned(data);
        }

        let last_start = data.len() - size;
        let candidates = data
            .iter()
            .enumerate()
            .filter(|&(i, &b)| b == START_MARKER && i <= last_start)
            .map(|(i, _)| i);

        // Deleting the first mis-spaced candidate and rescanning from the top
        // converges to the same set as this single forward pass: each
        // candidate survives iff it sits exactly one frame after the last
        // survivor.
        let mut offsets: Vec<usize> = Vec::new();
        for offset in candidates {
            match offsets.last() {
                Some(&prev) if offset - prev != size => {}
                _ => offsets.push(offset),
            }
        }

        let Some(&last) = offsets.last() else {
            if !data.contains(&START_MARKER) {
                debug!(
                    "no start marker in {} bytes, keeping them for the next read",
                    data.len()
                );
            }
            return Self::unaligned(data);
        };

        let frames = offsets
            .iter()
            .map(|&start| data[start..start + size].to_vec())
            .collect();
        let remainder = data[last + size..].to_vec();

        Alignment {
            offsets,
            frames,
            remainder,
        }
    }

    fn unaligned(data: &[u8]) -> Alignment {
        Alignment {
            offsets: Vec::new(),
            frames: Vec::new(),
            remainder: data.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_data_frame;

    const PAYLOAD_LEN: usize = 8;
    const FRAME: usize = PAYLOAD_LEN + 6;

    fn frames(n: u8) -> Vec<u8> {
        (0..n)
            .flat_map(|seq| encode_data_frame(0, seq, &[seq, 1, 2, 3, 4, 5, 6, seq]))
            .collect()
    }

    #[test]
    fn aligned_input_yields_every_frame() {
        let stream = frames(10);
        let out = FrameAligner::new(FRAME).align(&stream);
        assert_eq!(out.frames.len(), 10);
        assert!(out.remainder.is_empty());
        assert_eq!(out.aligned_bytes(), stream.len());
        for (i, frame) in out.frames.iter().enumerate() {
            assert_eq!(frame[3], i as u8);
        }
    }

    #[test]
    fn leading_garbage_byte_is_skipped() {
        let mut stream = vec![0x55];
        stream.extend(frames(6));
        let out = FrameAligner::new(FRAME).align(&stream);
        assert_eq!(out.frames.len(), 6);
        assert_eq!(out.offsets[0], 1);
        assert!(out.remainder.is_empty());
    }

    #[test]
    fn partial_trailing_frame_becomes_remainder() {
        let stream = frames(3);
        let cut = stream.len() - 4;
        let out = FrameAligner::new(FRAME).align(&stream[..cut]);
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.remainder, stream[2 * FRAME..cut].to_vec());

        // The next read completes it.
        let mut next = out.remainder.clone();
        next.extend_from_slice(&stream[cut..]);
        let out = FrameAligner::new(FRAME).align(&next);
        assert_eq!(out.frames.len(), 1);
        assert!(out.remainder.is_empty());
    }

    #[test]
    fn no_marker_keeps_everything() {
        let data = vec![1u8; 40];
        let out = FrameAligner::new(FRAME).align(&data);
        assert!(out.frames.is_empty());
        assert_eq!(out.remainder, data);
    }

    #[test]
    fn marker_without_room_keeps_everything() {
        let mut data = vec![0u8; 20];
        data[10] = START_MARKER;
        let out = FrameAligner::new(FRAME).align(&data);
        assert!(out.frames.is_empty());
        assert_eq!(out.remainder, data);
    }

    #[test]
    fn coincidental_marker_inside_payload_is_dropped() {
        // Second payload byte of frame 0 is 128, six bytes after the true start.
        let mut stream = encode_data_frame(0, 0, &[0, START_MARKER, 0, 0, 0, 0, 0, 0]);
        stream.extend(encode_data_frame(0, 1, &[0; PAYLOAD_LEN]));
        stream.extend(encode_data_frame(0, 2, &[0; PAYLOAD_LEN]));
        let out = FrameAligner::new(FRAME).align(&stream);
        assert_eq!(out.offsets, vec![0, FRAME, 2 * FRAME]);
    }

    #[test]
    fn mis_spaced_tail_is_carried_over() {
        let mut stream = frames(2);
        stream.extend_from_slice(&[9, 9, 9]);
        let tail = frames(2);
        stream.extend_from_slice(&tail);

        let aligner = FrameAligner::new(FRAME);
        let out = aligner.align(&stream);
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.remainder.len(), 3 + tail.len());

        let out = aligner.align(&out.remainder);
        assert_eq!(out.frames.len(), 2);
        assert!(out.remainder.is_empty());
    }
}
