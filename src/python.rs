//! Python bindings (`--features python`).
//!
//! A Python UI drives the engine the same way the CLI does: switch modes,
//! request single samples, and poll for new stream samples on its own
//! timer. The engine's tokio runtime lives inside the `Engine` object.
//!
//! Blocking calls release the GIL, since the acquisition threads log
//! through Python's `logging` and need it to make progress.

use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::blocking::BlockingEngine;
use crate::config::{DaqConfig, DEFAULT_BAUD_RATE};
use crate::engine::{EngineStatus, Mode, StopReason};
use crate::errors::DaqError;
use crate::logging::{init_python_logging, parse_level, set_python_log_level};
use crate::parser::ValueDecoder;
use crate::reader::ReadStrategy;
use crate::series::{Sample, SeriesCursor};

fn to_py_err(e: DaqError) -> PyErr {
    match e {
        DaqError::Connection { .. } | DaqError::Handshake(_) | DaqError::LinkClosed(_) => {
            PyConnectionError::new_err(e.to_string())
        }
        DaqError::Timeout(_) => PyTimeoutError::new_err(e.to_string()),
        DaqError::Config(_) => PyValueError::new_err(e.to_string()),
        DaqError::Io(_) | DaqError::Serial(_) => PyIOError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

fn parse_mode(mode: &str) -> PyResult<Mode> {
    match mode.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
        "stream" | "streaming" => Ok(Mode::Streaming),
        "on_demand" => Ok(Mode::OnDemand),
        other => Err(PyValueError::new_err(format!(
            "unknown mode {other:?}, expected \"stream\" or \"on-demand\""
        ))),
    }
}

/// One reading (dataclass-like).
///
/// Attributes:
///     timestamp_ms: Device clock in milliseconds.
///     value: Volts or absorbance, depending on the configured quantity.
#[pyclass(name = "Sample", frozen, eq)]
#[derive(Clone, PartialEq)]
struct PySample {
    #[pyo3(get)]
    timestamp_ms: u64,
    #[pyo3(get)]
    value: f64,
}

#[pymethods]
impl PySample {
    #[new]
    fn new(timestamp_ms: u64, value: f64) -> Self {
        PySample {
            timestamp_ms,
            value,
        }
    }

    fn __repr__(&self) -> String {
        format!(
            "Sample(timestamp_ms={}, value={})",
            self.timestamp_ms, self.value
        )
    }

    /// Timestamp in seconds.
    #[getter]
    fn seconds(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("timestamp_ms", self.timestamp_ms)?;
        dict.set_item("value", self.value)?;
        Ok(dict)
    }
}

impl From<Sample> for PySample {
    fn from(s: Sample) -> Self {
        PySample {
            timestamp_ms: s.timestamp_ms,
            value: s.value,
        }
    }
}

fn to_py_samples(samples: Vec<Sample>) -> Vec<PySample> {
    samples.into_iter().map(PySample::from).collect()
}

/// Acquisition engine bound to one serial device.
///
/// Example:
///     >>> engine = Engine("/dev/ttyACM0", quantity="absorbance")
///     >>> engine.set_mode("stream")
///     >>> new = engine.new_samples()   # call from a periodic callback
///     >>> engine.set_mode("on-demand")
///     >>> engine.request_single_sample()
///     >>> engine.shutdown()
#[pyclass(name = "Engine", unsendable)]
struct PyEngine {
    inner: BlockingEngine,
    cursor: SeriesCursor,
}

#[pymethods]
impl PyEngine {
    /// Open the port, handshake, and start the acquisition loop.
    ///
    /// Args:
    ///     port: Serial device path (e.g. "/dev/ttyACM0" or "COM3").
    ///     baud_rate: Default 115200.
    ///     sample_delay_ms: Streaming interval. Default 20.
    ///     quantity: "voltage" or "absorbance".
    ///     strategy: "count" (blocking line reads) or "drain" (read what is queued).
    ///     n_reads_per_chunk: Lines per streaming chunk. Default 4.
    ///     warmup_reads: Lines discarded after each stream start. Default 5.
    ///
    /// Raises:
    ///     ConnectionError: If the port cannot be opened or the handshake fails.
    #[new]
    #[pyo3(signature = (port, baud_rate=DEFAULT_BAUD_RATE, sample_delay_ms=20, quantity="voltage", strategy="count", n_reads_per_chunk=4, warmup_reads=5))]
    fn new(
        py: Python<'_>,
        port: &str,
        baud_rate: u32,
        sample_delay_ms: u64,
        quantity: &str,
        strategy: &str,
        n_reads_per_chunk: usize,
        warmup_reads: usize,
    ) -> PyResult<Self> {
        let decoder = match quantity {
            "voltage" => ValueDecoder::Voltage,
            "absorbance" => ValueDecoder::Absorbance,
            other => return Err(PyValueError::new_err(format!("unknown quantity {other:?}"))),
        };
        let strategy = match strategy {
            "count" => ReadStrategy::Count,
            "drain" => ReadStrategy::Drain,
            other => return Err(PyValueError::new_err(format!("unknown strategy {other:?}"))),
        };
        let config = DaqConfig {
            port: Some(port.to_string()),
            baud_rate,
            sample_delay_ms,
            n_reads_per_chunk,
            warmup_reads,
            strategy,
            decoder,
            ..DaqConfig::default()
        };

        let inner = py
            .detach(|| BlockingEngine::connect(config))
            .map_err(to_py_err)?;
        Ok(PyEngine {
            inner,
            cursor: SeriesCursor::start(),
        })
    }

    /// Switch between "stream" and "on-demand".
    fn set_mode(&self, py: Python<'_>, mode: &str) -> PyResult<()> {
        let mode = parse_mode(mode)?;
        let inner = &self.inner;
        py.detach(|| inner.set_mode(mode)).map_err(to_py_err)
    }

    /// Current mode as a string.
    #[getter]
    fn mode(&self) -> &'static str {
        match self.inner.mode() {
            Mode::Streaming => "stream",
            Mode::OnDemand => "on-demand",
        }
    }

    /// Fetch one sample (latest streamed sample while streaming).
    ///
    /// Raises:
    ///     TimeoutError: If the device does not answer in time.
    fn request_single_sample(&self, py: Python<'_>) -> PyResult<PySample> {
        let inner = &self.inner;
        py.detach(|| inner.request_single_sample())
            .map(PySample::from)
            .map_err(to_py_err)
    }

    /// Every streamed sample since the last reset.
    fn snapshot(&self) -> Vec<PySample> {
        to_py_samples(self.inner.engine().snapshot())
    }

    /// Every single-sample result since the last on-demand reset.
    fn on_demand_snapshot(&self) -> Vec<PySample> {
        to_py_samples(self.inner.engine().on_demand_snapshot())
    }

    /// Streamed samples not returned by a previous call.
    fn new_samples(&mut self) -> Vec<PySample> {
        to_py_samples(self.cursor.next_batch(self.inner.engine().series()))
    }

    /// Clear the stream series.
    fn reset(&mut self) {
        self.inner.engine().reset();
    }

    /// Clear the on-demand series.
    fn reset_on_demand(&self) {
        self.inner.engine().reset_on_demand();
    }

    #[getter]
    fn is_open(&self, py: Python<'_>) -> bool {
        let inner = &self.inner;
        py.detach(|| inner.is_open())
    }

    /// None while running, otherwise why the loop stopped.
    #[getter]
    fn stop_reason(&self) -> Option<String> {
        match self.inner.status() {
            EngineStatus::Running => None,
            EngineStatus::Stopped(StopReason::Shutdown) => Some("shutdown".into()),
            EngineStatus::Stopped(StopReason::LinkClosed(reason)) => Some(reason),
        }
    }

    /// Stop streaming, end the loop, and release the port.
    fn shutdown(&mut self, py: Python<'_>) -> PyResult<()> {
        let inner = &mut self.inner;
        py.detach(|| inner.shutdown()).map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        format!(
            "Engine(mode={}, samples={})",
            self.mode(),
            self.inner.engine().series().len()
        )
    }
}

impl Drop for PyEngine {
    /// Same cleanup as `shutdown()`, for engines the host just lets go of.
    fn drop(&mut self) {
        let inner = &mut self.inner;
        let result = Python::attach(|py| py.detach(|| inner.shutdown()));
        if let Err(e) = result {
            log::warn!("engine dropped after failure: {}", e);
        }
    }
}

/// Set the minimum level of engine logs forwarded to Python's `logging`.
///
/// Args:
///     level: "error", "warn", "info", "debug", "trace" or "off". None
///         restores the level from SPECTRO_DAQ_LOG/RUST_LOG.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(level: Option<&str>) -> PyResult<()> {
    let level = match level {
        Some(s) => Some(
            parse_level(s)
                .ok_or_else(|| PyValueError::new_err(format!("unknown log level {s:?}")))?,
        ),
        None => None,
    };
    set_python_log_level(level);
    Ok(())
}

/// The Python module definition
#[pymodule]
fn spectro_daq(m: &Bound<'_, PyModule>) -> PyResult<()> {
    init_python_logging(m.py())?;

    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add_class::<PyEngine>()?;
    m.add_class::<PySample>()?;

    m.add("DEFAULT_BAUD_RATE", DEFAULT_BAUD_RATE)?;
    m.add("DEFAULT_SAMPLE_DELAY_MS", DaqConfig::default().sample_delay_ms)?;

    Ok(())
}
