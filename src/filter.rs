//! Zero-phase Butterworth high-pass applied to windows returned by `get_data`.
//!
//! Design and filtering come from `sci-rs`: `butter_dyn` produces the
//! second-order sections and `sosfiltfilt_dyn` runs them forwards then
//! backwards with odd-extension padding and steady-state initial conditions.

use ndarray::{Array2, Axis};
use sci_rs::signal::filter::design::{
    butter_dyn, DigitalFilter, FilterBandType, FilterOutputType, Sos, SosFormatFilter,
};
use sci_rs::signal::filter::sosfiltfilt_dyn;

use crate::config::FilterConfig;
use crate::errors::{DriverError, Result};

/// Butterworth high-pass as a cascade of second-order sections.
#[derive(Debug, Clone)]
pub struct HighPass {
    sos: Vec<Sos<f64>>,
}

impl HighPass {
    pub fn butterworth(order: usize, cutoff_hz: f64, sample_rate: f64) -> Result<Self> {
        if order == 0 {
            return Err(DriverError::Filter("order must be at least 1".into()));
        }
        if !(cutoff_hz > 0.0 && cutoff_hz < sample_rate / 2.0) {
            return Err(DriverError::Filter(format!(
                "cutoff {cutoff_hz} Hz outside (0, {}) Hz",
                sample_rate / 2.0
            )));
        }

        let design = butter_dyn(
            order,
            vec![cutoff_hz],
            Some(FilterBandType::Highpass),
            Some(false),
            Some(FilterOutputType::Sos),
            Some(sample_rate),
        );
        match design {
            DigitalFilter::Sos(SosFormatFilter { sos }) if !sos.is_empty() => Ok(Self { sos }),
            _ => Err(DriverError::Filter(format!(
                "no second-order sections for order {order} at {cutoff_hz} Hz"
            ))),
        }
    }

    pub fn from_config(config: &FilterConfig, sample_rate: f64) -> Result<Self> {
        Self::butterworth(config.order, config.cutoff_hz, sample_rate)
    }

    pub fn sections(&self) -> usize {
        self.sos.len()
    }

    /// Longest window left unfiltered: the odd extension needs more samples
    /// than the pad on each side.
    pub fn min_len(&self) -> usize {
        3 * (2 * self.sos.len() + 1)
    }

    /// Zero-phase filter one channel. Windows of `min_len()` samples or
    /// fewer come back unchanged.
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        if signal.len() <= self.min_len() {
            return signal.to_vec();
        }
        sosfiltfilt_dyn(signal.iter(), &self.sos)
    }

    /// Zero-phase filter each column of a `[samples x channels]` window.
    pub fn filtfilt_columns(&self, window: &Array2<f64>) -> Array2<f64> {
        let mut out = window.clone();
        for mut column in out.axis_iter_mut(Axis(1)) {
            let filtered = self.filtfilt(&column.to_vec());
            for (dst, src) in column.iter_mut().zip(filtered) {
                *dst = src;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn tone(freq: f64, fs: f64, n: usize, offset: f64) -> Vec<f64> {
        (0..n)
            .map(|i| offset + (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    #[test]
    fn third_order_has_two_sections() {
        let hp = HighPass::butterworth(3, 20.0, 1000.0).unwrap();
        assert_eq!(hp.sections(), 2);
        assert_eq!(hp.min_len(), 15);
    }

    #[test]
    fn constant_input_is_removed() {
        let hp = HighPass::butterworth(3, 20.0, 1000.0).unwrap();
        let out = hp.filtfilt(&vec![1.5; 500]);
        assert_eq!(out.len(), 500);
        assert!(out.iter().all(|y| y.abs() < 1e-6), "{:?}", &out[..5]);
    }

    #[test]
    fn offset_is_stripped_and_passband_kept() {
        let fs = 1000.0;
        let input = tone(150.0, fs, 2000, 2.0);
        let hp = HighPass::butterworth(3, 20.0, fs).unwrap();
        let out = hp.filtfilt(&input);

        let middle = &out[500..1500];
        let mean = middle.iter().sum::<f64>() / middle.len() as f64;
        let peak = middle.iter().fold(0.0f64, |m, y| m.max(y.abs()));
        assert!(mean.abs() < 0.01, "mean {mean}");
        assert!((peak - 1.0).abs() < 0.02, "peak {peak}");
    }

    #[test]
    fn short_windows_pass_through() {
        let hp = HighPass::butterworth(3, 20.0, 1000.0).unwrap();
        assert_eq!(hp.filtfilt(&[3.0]), vec![3.0]);
        assert_eq!(hp.filtfilt(&[4.0, 4.0, 4.0]), vec![4.0, 4.0, 4.0]);
        assert!(hp.filtfilt(&[]).is_empty());
        let edge = vec![2.0; hp.min_len()];
        assert_eq!(hp.filtfilt(&edge), edge);
    }

    #[test]
    fn rejects_cutoff_above_nyquist() {
        assert!(HighPass::butterworth(3, 600.0, 1000.0).is_err());
        assert!(HighPass::butterworth(3, 0.0, 1000.0).is_err());
        assert!(HighPass::butterworth(0, 20.0, 1000.0).is_err());
    }

    #[test]
    fn columns_are_filtered_independently() {
        let n = 300;
        let fs = 1000.0;
        let sine = tone(150.0, fs, n, 0.0);
        let mut window = Array2::zeros((n, 2));
        for i in 0..n {
            window[[i, 0]] = 5.0;
            window[[i, 1]] = sine[i];
        }
        let hp = HighPass::butterworth(3, 20.0, fs).unwrap();
        let out = hp.filtfilt_columns(&window);
        assert_eq!(out.dim(), (n, 2));
        assert!(out.column(0).iter().all(|y| y.abs() < 1e-6));
        let peak = out
            .column(1)
            .iter()
            .skip(100)
            .take(100)
            .fold(0.0f64, |m, y| m.max(y.abs()));
        assert!((peak - 1.0).abs() < 0.05, "peak {peak}");
        assert_eq!(window[[0, 0]], 5.0);
    }
}
