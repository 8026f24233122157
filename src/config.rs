use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::signal::{ChannelMap, DEFAULT_GAIN_DIFFERENTIAL, DEFAULT_GAIN_SINGLE_ENDED};

/// Serial baud rate of the RS-485 adaptor; the port must support it.
pub const DEFAULT_BAUD_RATE: u32 = 921_600;

/// Post-filter applied to windows returned by `get_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub enabled: bool,
    pub order: usize,
    pub cutoff_hz: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            order: 3,
            cutoff_hz: 20.0,
        }
    }
}

/// Everything needed to open, configure and stream from one headstage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadstageConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// Bioamp (differential) channels, bit n enables channel n.
    pub differential_mask: u16,
    /// GPI (single-ended) channels, bit n enables channel n.
    pub single_ended_mask: u16,
    /// Buffer height in samples.
    pub num_samples: usize,
    pub sample_frequency: f64,
    pub gain_differential: f64,
    pub gain_single_ended: f64,
    pub loop_period_ms: u64,
    pub rate_window_secs: f64,
    /// Run the receive loop on a background thread (otherwise `start` blocks).
    pub stream_on_thread: bool,
    /// Stop the receive loop after this long; unbounded when `None`.
    pub stream_duration_secs: Option<f64>,
    pub filter: FilterConfig,
    /// Raw bytes are appended here when set.
    pub raw_log_path: Option<PathBuf>,
}

impl Default for HeadstageConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 1000,
            differential_mask: 0xFFFF,
            single_ended_mask: 0xFFFF,
            num_samples: 3000,
            sample_frequency: 1000.0,
            gain_differential: DEFAULT_GAIN_DIFFERENTIAL,
            gain_single_ended: DEFAULT_GAIN_SINGLE_ENDED,
            loop_period_ms: 20,
            rate_window_secs: 5.0,
            stream_on_thread: true,
            stream_duration_secs: None,
            filter: FilterConfig::default(),
            raw_log_path: None,
        }
    }
}

impl HeadstageConfig {
    pub fn with_masks(differential_mask: u16, single_ended_mask: u16) -> Self {
        Self {
            differential_mask,
            single_ended_mask,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_samples == 0 {
            return Err(DriverError::Config("num_samples must be positive".into()));
        }
        if self.differential_mask == 0 && self.single_ended_mask == 0 {
            return Err(DriverError::Config("no channels selected".into()));
        }
        if !(self.sample_frequency > 0.0) {
            return Err(DriverError::Config(format!(
                "sample_frequency {} must be positive",
                self.sample_frequency
            )));
        }
        if self.filter.enabled && self.filter.cutoff_hz >= self.sample_frequency / 2.0 {
            return Err(DriverError::Config(format!(
                "filter cutoff {} Hz at or above Nyquist ({} Hz)",
                self.filter.cutoff_hz,
                self.sample_frequency / 2.0
            )));
        }
        Ok(())
    }

    pub fn channel_map(&self) -> ChannelMap {
        ChannelMap::from_masks(self.differential_mask, self.single_ended_mask)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn loop_period(&self) -> Duration {
        Duration::from_millis(self.loop_period_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs_f64(self.rate_window_secs.max(0.0))
    }

    pub fn stream_duration(&self) -> Option<Duration> {
        self.stream_duration_secs
            .map(|s| Duration::from_secs_f64(s.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_every_channel() {
        let cfg = HeadstageConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.channel_map().total(), 32);
        assert_eq!(cfg.loop_period(), Duration::from_millis(20));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: HeadstageConfig =
            serde_json::from_str(r#"{"port": "COM9", "differential_mask": 255, "single_ended_mask": 0}"#)
                .unwrap();
        assert_eq!(cfg.port, "COM9");
        assert_eq!(cfg.channel_map().differential_count(), 8);
        assert_eq!(cfg.channel_map().single_ended_count(), 0);
        assert_eq!(cfg.num_samples, 3000);
        assert_eq!(cfg.filter, FilterConfig::default());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut cfg = HeadstageConfig::with_masks(0, 0);
        assert!(matches!(cfg.validate(), Err(DriverError::Config(_))));

        cfg.differential_mask = 1;
        cfg.num_samples = 0;
        assert!(cfg.validate().is_err());

        cfg.num_samples = 10;
        cfg.filter.cutoff_hz = 500.0;
        assert!(cfg.validate().is_err());

        cfg.filter.enabled = false;
        assert!(cfg.validate().is_ok());
    }
}
