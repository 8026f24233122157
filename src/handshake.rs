//! Connect-time configuration exchange.
//!
//! Runs once per connection, on the caller's thread, before any streaming:
//! stop whatever the device is doing, read its id, write the channel mask
//! and read it back. Unrequested channels are simply not transmitted, so
//! the read-back is what guarantees the frame layout the driver expects.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::errors::{HandshakeError, HandshakeStep, Result};
use crate::protocol::{
    checksum, encode_config_read, encode_config_write, encode_stop, is_checksum_valid,
    CONFIG_READ_RESPONSE_LEN, CONFIG_WRITE_RESPONSE_LEN, CONFIG_WRITE_SUCCESS,
    MSG_CONFIG_READ_RESPONSE, MSG_CONFIG_WRITE_RESPONSE, PARAM_ACTIVE_CHANNELS, PARAM_DEVICE_ID,
};
use crate::signal::ChannelMap;
use crate::transport::Transport;

/// Delay between polls while draining stale input after STOP.
const DRAIN_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on drain polls, so a device that never stops cannot hang connect.
const MAX_DRAIN_POLLS: usize = 50;

/// What the device reported during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: u32,
    pub channel_config: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    pub drain_delay: Duration,
    pub max_drain_polls: usize,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            drain_delay: DRAIN_DELAY,
            max_drain_polls: MAX_DRAIN_POLLS,
        }
    }
}

impl Handshake {
    pub fn run<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        map: &ChannelMap,
    ) -> Result<DeviceInfo> {
        transport.write(&encode_stop())?;
        self.drain(transport)?;

        // Device id
        transport.write(&encode_config_read(PARAM_DEVICE_ID))?;
        let reply = transport.read_bytes(CONFIG_READ_RESPONSE_LEN)?;
        if reply.is_empty() {
            return Err(HandshakeError::NoResponse.into());
        }
        let device_id = check_read_response(&reply, HandshakeStep::ReadDeviceId, PARAM_DEVICE_ID)?;
        info!("CPCH device id = {}", device_id);

        // Active channels
        let channel_config = map.channel_config();
        transport.write(&encode_config_write(PARAM_ACTIVE_CHANNELS, channel_config))?;
        let reply = transport.read_bytes(CONFIG_WRITE_RESPONSE_LEN)?;
        check_write_response(&reply)?;

        transport.write(&encode_config_read(PARAM_ACTIVE_CHANNELS))?;
        let reply = transport.read_bytes(CONFIG_READ_RESPONSE_LEN)?;
        let echoed = check_read_response(
            &reply,
            HandshakeStep::ReadBackChannels,
            PARAM_ACTIVE_CHANNELS,
        )?;
        if echoed != channel_config {
            return Err(HandshakeError::ConfigMismatch {
                expected: channel_config,
                got: echoed,
            }
            .into());
        }

        info!(
            "CPCH configured: channel config {:#010X}, {} differential and {} single-ended inputs",
            channel_config,
            map.differential_count(),
            map.single_ended_count()
        );
        Ok(DeviceInfo {
            device_id,
            channel_config,
        })
    }

    /// Discard input until the port reports nothing waiting.
    fn drain<T: Transport + ?Sized>(&self, transport: &mut T) -> Result<()> {
        let mut discarded = 0usize;
        for _ in 0..self.max_drain_polls {
            thread::sleep(self.drain_delay);
            if transport.bytes_waiting()? == 0 {
                break;
            }
            discarded += transport.read_available()?.len();
        }
        if discarded > 0 {
            debug!("discarded {} stale bytes after STOP", discarded);
        }
        Ok(())
    }
}

fn check_read_response(reply: &[u8], step: HandshakeStep, param_id: u8) -> Result<u32> {
    if reply.len() != CONFIG_READ_RESPONSE_LEN {
        return Err(HandshakeError::WrongLength {
            step,
            expected: CONFIG_READ_RESPONSE_LEN,
            got: reply.len(),
        }
        .into());
    }
    if reply[0] != MSG_CONFIG_READ_RESPONSE {
        return Err(HandshakeError::WrongMessageId {
            step,
            expected: MSG_CONFIG_READ_RESPONSE,
            got: reply[0],
        }
        .into());
    }
    if reply[1] != param_id {
        return Err(HandshakeError::WrongParamId {
            step,
            expected: param_id,
            got: reply[1],
        }
        .into());
    }
    if !is_checksum_valid(reply) {
        return Err(HandshakeError::BadChecksum { step }.into());
    }
    Ok(u32::from_le_bytes([reply[2], reply[3], reply[4], reply[5]]))
}

fn check_write_response(reply: &[u8]) -> Result<()> {
    let step = HandshakeStep::WriteChannels;
    if reply.len() != CONFIG_WRITE_RESPONSE_LEN {
        return Err(HandshakeError::WrongLength {
            step,
            expected: CONFIG_WRITE_RESPONSE_LEN,
            got: reply.len(),
        }
        .into());
    }
    if reply[0] != MSG_CONFIG_WRITE_RESPONSE {
        return Err(HandshakeError::WrongMessageId {
            step,
            expected: MSG_CONFIG_WRITE_RESPONSE,
            got: reply[0],
        }
        .into());
    }
    if !is_checksum_valid(reply) {
        return Err(HandshakeError::BadChecksum { step }.into());
    }
    if reply[1] != CONFIG_WRITE_SUCCESS {
        return Err(HandshakeError::WriteRejected { flag: reply[1] }.into());
    }
    Ok(())
}

/// Checksummed configuration read response, as the device sends it.
pub fn config_read_response(param_id: u8, value: u32) -> Vec<u8> {
    let mut reply = vec![MSG_CONFIG_READ_RESPONSE, param_id];
    reply.extend_from_slice(&value.to_le_bytes());
    reply.push(checksum(&reply));
    reply
}

/// Checksummed configuration write response, as the device sends it.
pub fn config_write_response(flag: u8) -> Vec<u8> {
    let mut reply = vec![MSG_CONFIG_WRITE_RESPONSE, flag];
    reply.push(checksum(&reply));
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DriverError;
    use crate::transport::MemoryTransport;

    fn quick() -> Handshake {
        Handshake {
            drain_delay: Duration::ZERO,
            max_drain_polls: 3,
        }
    }

    fn scripted(echoed: u32) -> MemoryTransport {
        let t = MemoryTransport::new();
        // Stale stream bytes released by STOP, then discarded by the drain.
        t.queue_reply(vec![0x80, 0x00, 0x00, 0x11, 0x04]);
        t.queue_reply(config_read_response(PARAM_DEVICE_ID, 42));
        t.queue_reply(config_write_response(CONFIG_WRITE_SUCCESS));
        t.queue_reply(config_read_response(PARAM_ACTIVE_CHANNELS, echoed));
        t
    }

    fn handshake_error(result: Result<DeviceInfo>) -> HandshakeError {
        match result {
            Err(DriverError::Handshake(e)) => e,
            other => panic!("expected handshake error, got {other:?}"),
        }
    }

    #[test]
    fn configures_device_and_reads_back() {
        let map = ChannelMap::from_masks(0x000F, 0x0003);
        let mut t = scripted(map.channel_config());

        let info = quick().run(&mut t, &map).unwrap();
        assert_eq!(info.device_id, 42);
        assert_eq!(info.channel_config, 0x0003_000F);
        assert_eq!(
            t.writes(),
            vec![
                encode_stop(),
                encode_config_read(PARAM_DEVICE_ID),
                encode_config_write(PARAM_ACTIVE_CHANNELS, 0x0003_000F),
                encode_config_read(PARAM_ACTIVE_CHANNELS),
            ]
        );
        assert_eq!(t.pending_inbound(), 0);
    }

    #[test]
    fn silent_device_reports_no_response() {
        let map = ChannelMap::from_masks(1, 0);
        let mut t = MemoryTransport::new();
        assert_eq!(
            handshake_error(quick().run(&mut t, &map)),
            HandshakeError::NoResponse
        );
    }

    #[test]
    fn short_id_reply_is_rejected() {
        let map = ChannelMap::from_masks(1, 0);
        let t = MemoryTransport::new();
        t.queue_reply(Vec::new());
        t.queue_reply(vec![MSG_CONFIG_READ_RESPONSE, PARAM_DEVICE_ID, 0]);
        let mut owned = t.clone();
        assert_eq!(
            handshake_error(quick().run(&mut owned, &map)),
            HandshakeError::WrongLength {
                step: HandshakeStep::ReadDeviceId,
                expected: CONFIG_READ_RESPONSE_LEN,
                got: 3,
            }
        );
    }

    #[test]
    fn corrupted_id_reply_fails_checksum() {
        let map = ChannelMap::from_masks(1, 0);
        let t = MemoryTransport::new();
        let mut reply = config_read_response(PARAM_DEVICE_ID, 7);
        reply[3] ^= 0x10;
        t.queue_reply(Vec::new());
        t.queue_reply(reply);
        let mut owned = t.clone();
        assert_eq!(
            handshake_error(quick().run(&mut owned, &map)),
            HandshakeError::BadChecksum {
                step: HandshakeStep::ReadDeviceId
            }
        );
    }

    #[test]
    fn rejected_write_stops_handshake() {
        let map = ChannelMap::from_masks(1, 0);
        let t = MemoryTransport::new();
        t.queue_reply(Vec::new());
        t.queue_reply(config_read_response(PARAM_DEVICE_ID, 1));
        t.queue_reply(config_write_response(0));
        let mut owned = t.clone();
        assert_eq!(
            handshake_error(quick().run(&mut owned, &map)),
            HandshakeError::WriteRejected { flag: 0 }
        );
        // No read-back after a rejected write.
        assert_eq!(t.writes().len(), 3);
    }

    #[test]
    fn mismatched_read_back_is_an_error() {
        let map = ChannelMap::from_masks(0x00FF, 0);
        let mut t = scripted(0x0000_000F);
        assert_eq!(
            handshake_error(quick().run(&mut t, &map)),
            HandshakeError::ConfigMismatch {
                expected: 0x0000_00FF,
                got: 0x0000_000F,
            }
        );
    }

    #[test]
    fn response_helpers_carry_valid_checksums() {
        assert_eq!(config_write_response(1), vec![132, 1, checksum(&[132, 1])]);
        assert_eq!(checksum(&config_read_response(PARAM_ACTIVE_CHANNELS, 0xFFFF)), 0);
    }
}
