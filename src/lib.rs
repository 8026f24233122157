//! Driver for the CPC headstage (CPCH), a multi-channel EMG amplifier
//! streaming fixed-size checksummed frames over an RS-485 serial link.
//!
//! The pipeline is: bytes from a [`Transport`] are split into candidate
//! frames by the [`FrameAligner`], filtered by the [`MessageValidator`],
//! decoded by the [`SignalExtractor`] and rolled into a [`SampleBuffer`].
//! [`Headstage`] ties the stages together, runs the handshake and owns the
//! receive thread.
//!
//! # Example
//!
//! ```no_run
//! use cpch::{Headstage, HeadstageConfig};
//!
//! let config = HeadstageConfig {
//!     port: "/dev/ttyUSB0".into(),
//!     ..HeadstageConfig::with_masks(0x00FF, 0x0000)
//! };
//! let mut headstage = Headstage::open(config)?;
//! headstage.start()?;
//! let window = headstage.get_data(Some(500), None)?; // [500 x 8], high-pass filtered
//! println!("{} {:?}", headstage.status_text(), window.dim());
//! headstage.close()?;
//! # Ok::<(), cpch::DriverError>(())
//! ```

pub mod align;
pub mod buffer;
pub mod config;
pub mod errors;
pub mod filter;
pub mod handshake;
pub mod headstage;
pub mod logging;
pub mod protocol;
pub mod rawlog;
pub mod signal;
pub mod simulate;
pub mod source;
pub mod stats;
pub mod transport;
pub mod validate;

pub use align::{Alignment, FrameAligner};
pub use buffer::SampleBuffer;
pub use config::{FilterConfig, HeadstageConfig};
pub use errors::*;
pub use filter::HighPass;
pub use handshake::{DeviceInfo, Handshake};
pub use headstage::{DriverState, Headstage};
pub use rawlog::{read_raw_log, RawByteLog, RawLogEntry, TextRawLog};
pub use signal::{ChannelMap, Samples, SignalExtractor};
pub use simulate::{SimulatedHeadstage, SimulatorOptions};
pub use source::{SignalSource, SourceKind};
pub use stats::RateStats;
pub use transport::{MemoryTransport, SerialTransport, Transport};
pub use validate::{ErrorStats, MessageValidator, Validation};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use pyo3::exceptions::{
        PyConnectionError, PyIOError, PyRuntimeError, PyTimeoutError, PyValueError,
    };
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    use crate::config::{HeadstageConfig, DEFAULT_BAUD_RATE};
    use crate::errors::DriverError;
    use crate::headstage::Headstage;
    use crate::logging;
    use crate::simulate::{SimulatedHeadstage, SimulatorOptions};
    use crate::source::SourceKind;
    use crate::transport::{SerialTransport, Transport};

    fn to_py_err(e: DriverError) -> PyErr {
        let msg = e.to_string();
        match e {
            DriverError::Io(_) | DriverError::Serial(_) => PyIOError::new_err(msg),
            DriverError::Handshake(_) => PyConnectionError::new_err(msg),
            DriverError::Timeout(_) => PyTimeoutError::new_err(msg),
            DriverError::Config(_) | DriverError::Filter(_) => PyValueError::new_err(msg),
            DriverError::Protocol(_) | DriverError::NotReady(_) => PyRuntimeError::new_err(msg),
        }
    }

    /// CPC headstage on a serial port.
    ///
    /// Example:
    ///     >>> hs = Headstage("/dev/ttyUSB0", differential_mask=0x00FF, single_ended_mask=0)
    ///     >>> hs.start()
    ///     >>> window = hs.get_data(500)   # 500 rows x 8 channels, filtered
    ///     >>> print(hs.status_text())
    ///     >>> hs.close()
    #[pyclass(name = "Headstage", unsendable)]
    struct PyHeadstage {
        inner: Headstage<Box<dyn Transport>>,
    }

    #[pymethods]
    impl PyHeadstage {
        /// Open the serial port. The device is configured on `connect()`,
        /// or lazily by the first `start()` / `get_data()`.
        #[new]
        #[pyo3(signature = (port, differential_mask=0xFFFF, single_ended_mask=0xFFFF, num_samples=3000))]
        fn new(
            port: &str,
            differential_mask: u16,
            single_ended_mask: u16,
            num_samples: usize,
        ) -> PyResult<Self> {
            let config = HeadstageConfig {
                port: port.to_string(),
                num_samples,
                ..HeadstageConfig::with_masks(differential_mask, single_ended_mask)
            };
            let transport = SerialTransport::from_config(&config).map_err(to_py_err)?;
            Ok(Self {
                inner: Headstage::new(Box::new(transport), config),
            })
        }

        /// In-process simulated headstage, for testing without hardware.
        #[staticmethod]
        #[pyo3(signature = (differential_mask=0xFFFF, single_ended_mask=0xFFFF, num_samples=3000))]
        fn simulated(differential_mask: u16, single_ended_mask: u16, num_samples: usize) -> Self {
            let config = HeadstageConfig {
                num_samples,
                ..HeadstageConfig::with_masks(differential_mask, single_ended_mask)
            };
            let transport: Box<dyn Transport> =
                Box::new(SimulatedHeadstage::new(SimulatorOptions::default()));
            Self {
                inner: Headstage::new(transport, config).with_kind(SourceKind::Simulated),
            }
        }

        /// Run the configuration handshake.
        ///
        /// Raises:
        ///     ConnectionError: If the device answers wrongly or not at all
        fn connect(&mut self) -> PyResult<()> {
            self.inner.connect().map_err(to_py_err)
        }

        fn start(&mut self) -> PyResult<()> {
            self.inner.start().map_err(to_py_err)
        }

        fn stop(&mut self) -> PyResult<()> {
            self.inner.stop().map_err(to_py_err)
        }

        /// Newest samples as rows of channel values (volts), high-pass filtered.
        ///
        /// Args:
        ///     num_samples: Rows to return (default and maximum: buffer height)
        ///     channels: Column indices (default: all)
        #[pyo3(signature = (num_samples=None, channels=None))]
        fn get_data(
            &mut self,
            num_samples: Option<usize>,
            channels: Option<Vec<usize>>,
        ) -> PyResult<Vec<Vec<f64>>> {
            let window = self
                .inner
                .get_data(num_samples, channels.as_deref())
                .map_err(to_py_err)?;
            Ok(window.outer_iter().map(|row| row.to_vec()).collect())
        }

        fn status_text(&self) -> String {
            self.inner.status_text()
        }

        /// Cumulative frame defect counters plus the candidate frame total.
        fn error_stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
            let stats = self.inner.error_totals();
            let d = PyDict::new(py);
            d.set_item("bad_status", stats.bad_status)?;
            d.set_item("bad_length", stats.bad_length)?;
            d.set_item("bad_checksum", stats.bad_checksum)?;
            d.set_item("bad_sequence", stats.bad_sequence)?;
            d.set_item("adc_error", stats.adc_error)?;
            d.set_item("total_messages", self.inner.total_messages())?;
            Ok(d)
        }

        fn reset_error_stats(&self) {
            self.inner.reset_error_stats();
        }

        /// Column labels such as `DE0` or `SE3`; empty before `connect()`.
        fn channel_labels(&self) -> Vec<String> {
            self.inner
                .channel_map()
                .map(|map| map.labels())
                .unwrap_or_default()
        }

        fn close(&mut self) -> PyResult<()> {
            self.inner.close().map_err(to_py_err)
        }

        fn __repr__(&self) -> String {
            format!(
                "Headstage(kind={}, state={:?})",
                crate::source::SignalSource::kind(&self.inner),
                self.inner.state()
            )
        }
    }

    /// Forward Rust log records to Python's `logging`.
    #[pyfunction]
    fn init_logging(py: Python<'_>) -> PyResult<()> {
        logging::init_python_logging(py)
    }

    /// Set the forwarded log level ("error" .. "trace"); `None` re-reads `CPCH_LOG`.
    #[pyfunction]
    #[pyo3(signature = (level=None))]
    fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        logging::set_python_log_level(py, level)
    }

    #[pymodule]
    fn cpch(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add_class::<PyHeadstage>()?;
        m.add_function(wrap_pyfunction!(init_logging, m)?)?;
        m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

        m.add("DEFAULT_BAUD_RATE", DEFAULT_BAUD_RATE)?;
        m.add("DEFAULT_NUM_SAMPLES", HeadstageConfig::default().num_samples)?;

        Ok(())
    }
}
