//! Logging setup.
//!
//! The driver only ever logs through the `log` facade. Binaries install
//! `env_logger` with [`init_rust_logging`]; the Python extension instead
//! forwards records into Python's `logging` module.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

/// Checked before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "CPCH_LOG";

static RUST_LOG_ONCE: Once = Once::new();

/// Level from `CPCH_LOG`, then `RUST_LOG`, else `info`.
pub fn env_level() -> LevelFilter {
    let from_env = std::env::var(LOG_ENV_VAR)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok();
    parse_level(from_env.as_deref()).unwrap_or(LevelFilter::Info)
}

pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Install the stderr logger. Later calls are no-ops.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let level = env_level();
        let env = Env::default().default_filter_or(level.to_string().to_lowercase());
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

#[cfg(feature = "python")]
pub use python::{init_python_logging, reset_python_logging_cache, set_python_log_level};

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;
    use std::sync::Once;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use parking_lot::Mutex;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, parse_level};

    static BRIDGE_ONCE: Once = Once::new();
    static BRIDGE: OnceCell<&'static PyBridge> = OnceCell::new();

    /// Python numeric level for a `log` level.
    fn python_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    struct PyBridge {
        ceiling: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        /// Dotted target -> (most verbose level the Python logger accepts, logger).
        loggers: Mutex<HashMap<String, (LevelFilter, Py<PyAny>)>>,
    }

    impl PyBridge {
        fn new(py: Python<'_>, ceiling: LevelFilter) -> PyResult<Self> {
            Ok(Self {
                ceiling: Mutex::new(ceiling),
                logging: py.import("logging")?.into(),
                loggers: Mutex::new(HashMap::new()),
            })
        }

        fn accepted_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
                let enabled = logger
                    .call_method1("isEnabledFor", (python_level(level),))?
                    .is_truthy()?;
                if enabled {
                    return Ok(level.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        fn logger(&self, py: Python<'_>, target: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut loggers = self.loggers.lock();
            if let Some((level, logger)) = loggers.get(target) {
                return Ok((*level, logger.clone_ref(py)));
            }
            let logger = self
                .logging
                .bind(py)
                .getattr("getLogger")?
                .call1((target,))?;
            let level = Self::accepted_level(&logger)?;
            let logger = logger.unbind();
            loggers.insert(target.to_string(), (level, logger.clone_ref(py)));
            Ok((level, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let (accepted, logger) = self.logger(py, &target)?;
            let level = record.level().to_level_filter();
            if level > accepted || level > *self.ceiling.lock() {
                return Ok(());
            }

            let logger = logger.bind(py);
            let none = py.None();
            let py_record = logger.call_method1(
                "makeRecord",
                (
                    target.as_str(),
                    python_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (py_record,))?;
            Ok(())
        }
    }

    impl Log for PyBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *self.ceiling.lock()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    fn install(py: Python<'_>, level: LevelFilter) -> PyResult<&'static PyBridge> {
        BRIDGE
            .get_or_try_init(|| {
                PyBridge::new(py, level).map(|bridge| &*Box::leak(Box::new(bridge)))
            })
            .copied()
    }

    /// Route Rust log records into Python's `logging`. Safe to call repeatedly.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let bridge = install(py, level)?;
        BRIDGE_ONCE.call_once(|| {
            if log::set_logger(bridge).is_ok() {
                log::set_max_level(level);
            }
        });
        Ok(())
    }

    /// Forget cached Python loggers, e.g. after reconfiguring Python logging.
    pub fn reset_python_logging_cache() {
        if let Some(bridge) = BRIDGE.get() {
            bridge.loggers.lock().clear();
        }
    }

    /// Set the most verbose level forwarded to Python. `None` re-reads the environment.
    pub fn set_python_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = parse_level(level).unwrap_or_else(env_level);
        let bridge = install(py, level)?;
        *bridge.ceiling.lock() = level;
        reset_python_logging_cache();
        log::set_max_level(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_level(Some("DEBUG")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some(" warn ")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some("off")), Some(LevelFilter::Off));
        assert_eq!(parse_level(Some("cpch=debug")), None);
        assert_eq!(parse_level(None), None);
    }

    #[test]
    fn init_is_idempotent() {
        init_rust_logging();
        init_rust_logging();
        log::info!("logging initialised twice without panicking");
    }
}
