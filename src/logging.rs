use std::sync::Once;

use env_logger::Env;
use log::{Level, LevelFilter};

static INIT: Once = Once::new();

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "SPECTRO_DAQ_LOG";

fn env_level() -> LevelFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Accepts `error`..`trace` and `off`, case-insensitively.
pub fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Initialize stderr logging based on `SPECTRO_DAQ_LOG`/`RUST_LOG`.
/// An explicit `level` overrides the environment. Later calls are no-ops.
pub fn init_logging(level: Option<LevelFilter>) {
    INIT.call_once(|| {
        let mut builder = match level {
            Some(level) => {
                let mut builder = env_logger::Builder::new();
                builder.filter_level(level);
                builder
            }
            None => env_logger::Builder::from_env(
                Env::default().filter_or(LOG_ENV, level_to_str(env_level())),
            ),
        };
        // An embedding application may already have installed a logger.
        let _ = builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

/// Numeric level of Python's `logging` module; trace maps below DEBUG.
#[cfg_attr(not(feature = "python"), allow(dead_code))]
fn python_level(level: Level) -> u32 {
    match level {
        Level::Error => 40,
        Level::Warn => 30,
        Level::Info => 20,
        Level::Debug => 10,
        Level::Trace => 5,
    }
}

#[cfg_attr(not(feature = "python"), allow(dead_code))]
fn python_logger_name(target: &str) -> String {
    target.replace("::", ".")
}

#[cfg(feature = "python")]
pub use self::python_bridge::{init_python_logging, set_python_log_level};

/// Forwards `log` records to Python's `logging`, one Python logger per Rust
/// module path (`spectro_daq::engine` becomes `spectro_daq.engine`), so a
/// host configures engine output with its usual handlers.
#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, PoisonError};

    use log::{LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::PyModule;

    use super::{env_level, python_level, python_logger_name};

    static BRIDGE: OnceCell<&'static PyLogBridge> = OnceCell::new();

    struct PyLogBridge {
        level: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    impl PyLogBridge {
        fn new(py: Python<'_>, level: LevelFilter) -> PyResult<Self> {
            Ok(Self {
                level: Mutex::new(level),
                logging: py.import("logging")?.unbind(),
                loggers: Mutex::new(HashMap::new()),
            })
        }

        fn level(&self) -> LevelFilter {
            *self.level.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn logger(&self, py: Python<'_>, name: &str) -> PyResult<Py<PyAny>> {
            let cached = self
                .loggers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .map(|logger| logger.clone_ref(py));
            if let Some(logger) = cached {
                return Ok(logger);
            }
            // The cache lock is not held here: getLogger may let another
            // thread take the GIL and log.
            let logger = self
                .logging
                .bind(py)
                .call_method1("getLogger", (name,))?
                .unbind();
            self.loggers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_string(), logger.clone_ref(py));
            Ok(logger)
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let name = python_logger_name(record.target());
            let logger = self.logger(py, &name)?;
            let logger = logger.bind(py);
            let level = python_level(record.level());
            if logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
                logger.call_method1("log", (level, record.args().to_string()))?;
            }
            Ok(())
        }
    }

    impl Log for PyLogBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            // A failing handler must not surface in unrelated Python code.
            Python::attach(|py| {
                let _ = self.forward(py, record);
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Safe to call repeatedly; if
    /// another logger was installed first, it stays in place.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let bridge = *BRIDGE.get_or_try_init(|| {
            PyLogBridge::new(py, env_level())
                .map(|bridge| -> &'static PyLogBridge { Box::leak(Box::new(bridge)) })
        })?;
        if log::set_logger(bridge).is_ok() {
            log::set_max_level(bridge.level());
        }
        Ok(())
    }

    /// Minimum level forwarded to Python. `None` falls back to
    /// `SPECTRO_DAQ_LOG`/`RUST_LOG`.
    pub fn set_python_log_level(level: Option<LevelFilter>) {
        let level = level.unwrap_or_else(env_level);
        if let Some(bridge) = BRIDGE.get() {
            *bridge.level.lock().unwrap_or_else(PoisonError::into_inner) = level;
        }
        log::set_max_level(level);
    }
}
