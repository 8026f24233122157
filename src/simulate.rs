//! In-process headstage.
//!
//! Answers the configuration exchange like the firmware does and, once
//! started, produces data frames at the configured sample rate from the
//! wall clock. Each channel carries a sine wave; differential channels are
//! centred on zero, single-ended ones on mid-scale.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::time::Instant;

use log::{debug, info, warn};

use crate::errors::{DriverError, Result};
use crate::handshake::{config_read_response, config_write_response};
use crate::protocol::{
    decode, encode, encode_data_frame, CONFIG_WRITE_SUCCESS, MSG_CONFIG_READ, MSG_CONFIG_WRITE,
    MSG_START_STREAMING, MSG_STATUS_DATA, MSG_STATUS_REQUEST, MSG_STOP_STREAMING,
    MSG_STOP_STREAMING_RESPONSE, PARAM_ACTIVE_CHANNELS, PARAM_DEVICE_ID,
};
use crate::signal::ChannelMap;
use crate::transport::Transport;

pub const SIMULATED_DEVICE_ID: u32 = 0x0C0C_0001;

/// Byte injected when corruption is enabled. Deliberately not the start marker.
const GARBAGE_BYTE: u8 = 0x55;

const DIFFERENTIAL_AMPLITUDE: f64 = 1000.0;
const SINGLE_ENDED_MIDSCALE: f64 = 512.0;
const SINGLE_ENDED_AMPLITUDE: f64 = 256.0;

#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    pub device_id: u32,
    pub sample_rate: f64,
    /// Insert one garbage byte before every Nth frame.
    pub garbage_every: Option<u64>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            device_id: SIMULATED_DEVICE_ID,
            sample_rate: 1000.0,
            garbage_every: None,
        }
    }
}

pub struct SimulatedHeadstage {
    options: SimulatorOptions,
    map: ChannelMap,
    started: Option<Instant>,
    emitted: u64,
    sequence: u8,
    outbound: VecDeque<u8>,
    closed: bool,
}

impl SimulatedHeadstage {
    pub fn new(options: SimulatorOptions) -> Self {
        Self {
            options,
            map: ChannelMap::from_masks(0, 0),
            started: None,
            emitted: 0,
            sequence: 0,
            outbound: VecDeque::new(),
            closed: false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.started.is_some()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.emitted
    }

    /// Active channels as last written by the host.
    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(DriverError::NotReady("simulated headstage is closed".into()));
        }
        Ok(())
    }

    /// Queue every frame that is due by now.
    fn pump(&mut self) {
        let Some(started) = self.started else {
            return;
        };
        let due = (started.elapsed().as_secs_f64() * self.options.sample_rate) as u64;
        while self.emitted < due {
            if let Some(n) = self.options.garbage_every {
                if n > 0 && self.emitted > 0 && self.emitted % n == 0 {
                    self.outbound.push_back(GARBAGE_BYTE);
                }
            }
            let frame = self.frame(self.emitted);
            self.outbound.extend(frame);
            self.emitted += 1;
            self.sequence = self.sequence.wrapping_add(1);
        }
    }

    fn frame(&self, index: u64) -> Vec<u8> {
        let t = index as f64 / self.options.sample_rate;
        let mut payload = Vec::with_capacity(self.map.payload_size());
        for &ch in self.map.differential() {
            let value = DIFFERENTIAL_AMPLITUDE * (2.0 * PI * tone_hz(ch) * t).sin();
            payload.extend_from_slice(&(value.round() as i16).to_le_bytes());
        }
        for &ch in self.map.single_ended() {
            let value =
                SINGLE_ENDED_MIDSCALE + SINGLE_ENDED_AMPLITUDE * (2.0 * PI * tone_hz(ch) * t).sin();
            payload.extend_from_slice(&(value.round() as u16).to_le_bytes());
        }
        encode_data_frame(0, self.sequence, &payload)
    }

    fn handle(&mut self, bytes: &[u8]) {
        let command = match decode(bytes) {
            Ok(command) => command,
            Err(e) => {
                warn!("simulated headstage ignoring command: {}", e);
                return;
            }
        };

        match (command.msg_id, command.param_id) {
            (MSG_START_STREAMING, _) => {
                info!(
                    "simulated headstage streaming {} channels at {} Hz",
                    self.map.total(),
                    self.options.sample_rate
                );
                self.started = Some(Instant::now());
                self.emitted = 0;
            }
            (MSG_STOP_STREAMING, _) => {
                self.pump();
                self.started = None;
                self.outbound
                    .extend(encode(MSG_STOP_STREAMING_RESPONSE, None, None));
            }
            (MSG_STATUS_REQUEST, _) => {
                self.outbound.extend(encode(MSG_STATUS_DATA, Some(0), None));
            }
            (MSG_CONFIG_READ, Some(PARAM_DEVICE_ID)) => {
                self.outbound
                    .extend(config_read_response(PARAM_DEVICE_ID, self.options.device_id));
            }
            (MSG_CONFIG_READ, Some(PARAM_ACTIVE_CHANNELS)) => {
                let value = self.map.channel_config();
                self.outbound
                    .extend(config_read_response(PARAM_ACTIVE_CHANNELS, value));
            }
            (MSG_CONFIG_WRITE, Some(PARAM_ACTIVE_CHANNELS)) => {
                let value = command.payload.unwrap_or_default();
                self.map = ChannelMap::from_masks(value as u16, (value >> 16) as u16);
                debug!("simulated headstage channel config {:#010X}", value);
                self.outbound
                    .extend(config_write_response(CONFIG_WRITE_SUCCESS));
            }
            (MSG_CONFIG_WRITE, _) => {
                self.outbound.extend(config_write_response(0));
            }
            (msg_id, param_id) => {
                debug!(
                    "simulated headstage: no reply for msg {} param {:?}",
                    msg_id, param_id
                );
            }
        }
    }
}

/// Distinct tone per physical channel, 10 Hz apart starting at 40 Hz.
fn tone_hz(channel: usize) -> f64 {
    40.0 + 10.0 * channel as f64
}

impl Transport for SimulatedHeadstage {
    fn read_available(&mut self) -> Result<Vec<u8>> {
        self.check_open()?;
        self.pump();
        Ok(self.outbound.drain(..).collect())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.check_open()?;
        self.pump();
        let n = len.min(self.outbound.len());
        Ok(self.outbound.drain(..n).collect())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_open()?;
        self.handle(bytes);
        Ok(())
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        self.check_open()?;
        self.pump();
        Ok(self.outbound.len())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.started = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::align::FrameAligner;
    use crate::handshake::Handshake;
    use crate::protocol::{encode_start, encode_stop};
    use crate::validate::MessageValidator;

    fn configured(map: &ChannelMap, options: SimulatorOptions) -> SimulatedHeadstage {
        let mut sim = SimulatedHeadstage::new(options);
        let quick = Handshake {
            drain_delay: Duration::ZERO,
            max_drain_polls: 3,
        };
        let info = quick.run(&mut sim, map).unwrap();
        assert_eq!(info.device_id, SIMULATED_DEVICE_ID);
        sim
    }

    #[test]
    fn answers_handshake_and_echoes_config() {
        let map = ChannelMap::from_masks(0x0F0F, 0x0001);
        let sim = configured(&map, SimulatorOptions::default());
        assert_eq!(sim.channel_map(), &map);
        assert!(!sim.is_streaming());
    }

    #[test]
    fn streams_valid_frames_after_start() {
        let map = ChannelMap::from_masks(0x000F, 0x0003);
        let mut sim = configured(&map, SimulatorOptions::default());
        sim.write(&encode_start()).unwrap();
        thread::sleep(Duration::from_millis(30));

        let bytes = sim.read_available().unwrap();
        let alignment = FrameAligner::new(map.frame_size()).align(&bytes);
        assert!(alignment.frames.len() >= 20);
        assert!(alignment.remainder.is_empty());

        let validation = MessageValidator::new(map.payload_size()).validate(&alignment.frames);
        assert_eq!(validation.accepted.len(), alignment.frames.len());
        assert!(validation.stats.is_clean());
    }

    #[test]
    fn garbage_bytes_are_injected_between_frames() {
        let map = ChannelMap::from_masks(0x0003, 0);
        let options = SimulatorOptions {
            garbage_every: Some(4),
            ..SimulatorOptions::default()
        };
        let mut sim = configured(&map, options);
        sim.write(&encode_start()).unwrap();
        thread::sleep(Duration::from_millis(20));
        let bytes = sim.read_available().unwrap();

        let frames = sim.frames_emitted() as usize;
        let garbage = (frames - 1) / 4;
        assert_eq!(bytes.len(), frames * map.frame_size() + garbage);
    }

    #[test]
    fn stop_halts_the_stream() {
        let map = ChannelMap::from_masks(0x0001, 0);
        let mut sim = configured(&map, SimulatorOptions::default());
        sim.write(&encode_start()).unwrap();
        thread::sleep(Duration::from_millis(5));
        sim.write(&encode_stop()).unwrap();
        sim.read_available().unwrap();
        let emitted = sim.frames_emitted();

        thread::sleep(Duration::from_millis(5));
        assert_eq!(sim.bytes_waiting().unwrap(), 0);
        assert_eq!(sim.frames_emitted(), emitted);
    }

    #[test]
    fn closed_simulator_refuses_io() {
        let mut sim = SimulatedHeadstage::new(SimulatorOptions::default());
        sim.close().unwrap();
        assert!(sim.write(&encode_stop()).is_err());
        assert!(sim.read_available().is_err());
    }
}
