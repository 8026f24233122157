//! CPCH wire protocol: command encoding and the CRC-8 checksum.
//!
//! Outbound commands are short byte strings `[msg_id]`, `[msg_id, param_id]`
//! or `[msg_id, param_id, u32 LE]`, each followed by one checksum byte.
//! Inbound data frames carry the same checksum in their last byte.
//!
//! The checksum is a non-reflected CRC-8 with generator `0b1_0100_1101`
//! (0x14D) and zero initial remainder. Because nothing is XORed on output, a
//! message with its checksum appended checksums to zero, which is how both
//! handshake replies and data frames are validated.

use once_cell::sync::Lazy;

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// CRC generator polynomial including the implicit x^8 term.
pub const CRC_POLYNOMIAL: u16 = 0b1_0100_1101;

// Host -> device message ids
pub const MSG_START_STREAMING: u8 = 1;
pub const MSG_STOP_STREAMING: u8 = 2;
pub const MSG_STATUS_REQUEST: u8 = 3;
pub const MSG_CONFIG_WRITE: u8 = 4;
pub const MSG_CONFIG_READ: u8 = 5;

// Device -> host message ids
pub const MSG_DATA: u8 = 128;
pub const MSG_STOP_STREAMING_RESPONSE: u8 = 129;
pub const MSG_STATUS_DATA: u8 = 130;
pub const MSG_CONFIG_READ_RESPONSE: u8 = 131;
pub const MSG_CONFIG_WRITE_RESPONSE: u8 = 132;

// Parameters for configuration read/write
pub const PARAM_RESERVED: u8 = 0;
pub const PARAM_DEVICE_ID: u8 = 1;
pub const PARAM_ACTIVE_CHANNELS: u8 = 2;

/// Success flag in a configuration write response.
pub const CONFIG_WRITE_SUCCESS: u8 = 1;

/// Start-of-frame marker. Same value as [`MSG_DATA`]; it can also occur in payloads.
pub const START_MARKER: u8 = MSG_DATA;

/// Header bytes in a data frame: marker, reserved, status, sequence, length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Header plus the trailing checksum byte.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + 1;

// Byte offsets within a data frame
pub const OFFSET_STATUS: usize = 2;
pub const OFFSET_SEQUENCE: usize = 3;
pub const OFFSET_LENGTH: usize = 4;
pub const OFFSET_PAYLOAD: usize = FRAME_HEADER_LEN;

/// Length of a configuration read response: id, param, u32, checksum.
pub const CONFIG_READ_RESPONSE_LEN: usize = 7;

/// Length of a configuration write response: id, success flag, checksum.
pub const CONFIG_WRITE_RESPONSE_LEN: usize = 3;

static CRC_TABLE: Lazy<[u8; 256]> = Lazy::new(build_crc_table);

fn build_crc_table() -> [u8; 256] {
    let poly = (CRC_POLYNOMIAL & 0xFF) as u8;
    let mut table = [0u8; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut crc = i as u8;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
        }
        *entry = crc;
    }
    table
}

// ============================================================================
// Checksum
// ============================================================================

/// Checksum of `bytes`. Returns 0 for a message that already ends in its own checksum.
pub fn checksum(bytes: &[u8]) -> u8 {
    let table = &*CRC_TABLE;
    bytes
        .iter()
        .fold(0u8, |crc, &byte| table[(crc ^ byte) as usize])
}

/// Checksum many equal-length frames at once, walking the frames column by column.
///
/// Produces the same values as calling [`checksum`] on each frame. Frames
/// shorter than the first are checksummed over their own length only.
pub fn checksum_batch(frames: &[&[u8]]) -> Vec<u8> {
    let table = &*CRC_TABLE;
    let mut crcs = vec![0u8; frames.len()];
    let width = frames.first().map_or(0, |f| f.len());
    for col in 0..width {
        for (crc, frame) in crcs.iter_mut().zip(frames) {
            if let Some(&byte) = frame.get(col) {
                *crc = table[(*crc ^ byte) as usize];
            }
        }
    }
    crcs
}

/// True when a message, including its trailing checksum byte, checksums to zero.
#[inline]
pub fn is_checksum_valid(message: &[u8]) -> bool {
    !message.is_empty() && checksum(message) == 0
}

// ============================================================================
// Commands
// ============================================================================

/// A decoded host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub msg_id: u8,
    pub param_id: Option<u8>,
    pub payload: Option<u32>,
}

/// Encode a command and append its checksum.
///
/// A payload always travels after a parameter id; if `payload` is given
/// without one, [`PARAM_RESERVED`] is sent in its place.
pub fn encode(msg_id: u8, param_id: Option<u8>, payload: Option<u32>) -> Vec<u8> {
    let mut msg = Vec::with_capacity(7);
    msg.push(msg_id);
    match (param_id, payload) {
        (Some(param), None) => msg.push(param),
        (param, Some(value)) => {
            msg.push(param.unwrap_or(PARAM_RESERVED));
            msg.extend_from_slice(&value.to_le_bytes());
        }
        (None, None) => {}
    }
    msg.push(checksum(&msg));
    msg
}

/// Decode a checksummed command produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Command> {
    if !matches!(bytes.len(), 2 | 3 | 7) {
        return Err(DriverError::Protocol(format!(
            "command length {} is not 2, 3 or 7 bytes",
            bytes.len()
        )));
    }
    if checksum(bytes) != 0 {
        return Err(DriverError::Protocol(format!(
            "command checksum mismatch: {:02X?}",
            bytes
        )));
    }

    let param_id = (bytes.len() >= 3).then(|| bytes[1]);
    let payload = (bytes.len() == 7)
        .then(|| u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]));
    Ok(Command {
        msg_id: bytes[0],
        param_id,
        payload,
    })
}

pub fn encode_start() -> Vec<u8> {
    encode(MSG_START_STREAMING, None, None)
}

pub fn encode_stop() -> Vec<u8> {
    encode(MSG_STOP_STREAMING, None, None)
}

pub fn encode_status_request() -> Vec<u8> {
    encode(MSG_STATUS_REQUEST, None, None)
}

pub fn encode_config_read(param_id: u8) -> Vec<u8> {
    encode(MSG_CONFIG_READ, Some(param_id), None)
}

pub fn encode_config_write(param_id: u8, value: u32) -> Vec<u8> {
    encode(MSG_CONFIG_WRITE, Some(param_id), Some(value))
}

/// Payload size in bytes for the given channel counts (2 bytes per sample).
#[inline]
pub fn payload_size(differential: usize, single_ended: usize) -> usize {
    2 * (differential + single_ended)
}

/// Full data frame size for the given channel counts.
#[inline]
pub fn frame_size(differential: usize, single_ended: usize) -> usize {
    FRAME_OVERHEAD + payload_size(differential, single_ended)
}

/// Build a checksummed data frame. Used by the simulator and in tests.
pub fn encode_data_frame(status: u8, sequence: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.push(START_MARKER);
    frame.push(0);
    frame.push(status);
    frame.push(sequence);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame
}
