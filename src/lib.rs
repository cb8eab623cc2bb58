//! Serial acquisition engine for Arduino-based measurement rigs.
//!
//! The firmware answers single-byte commands and emits ASCII records of the
//! form `<time_ms>,<value>\r\n`, either one per request or continuously at
//! a configured interval. This crate provides the host side:
//!
//! - [`link`]: the serial connection, handshake and bounded blocking reads,
//! - [`protocol`]: opcodes and the stream-delay payload,
//! - [`reader`] and [`parser`]: chunked reads that tolerate partial and
//!   corrupted lines without losing or duplicating records,
//! - [`engine`]: the acquisition loop and the handle a UI talks to,
//!   with [`blocking`] wrapping it for hosts that have no async runtime,
//! - [`series`]: the shared sample buffer the UI polls.
//!
//! # Modes
//!
//! In on-demand mode the engine reads only when asked for a sample. In
//! streaming mode it sends the sample delay and the start command, skips a
//! few warm-up lines, and then collects continuously until the mode changes
//! back, at which point the device is told to stop right away.
//!
//! Values are decoded by a [`ValueDecoder`]: volts from a 10-bit ADC code,
//! absorbance from thousandths, or any closure.

pub mod blocking;
pub mod config;
pub mod engine;
pub mod errors;
pub mod link;
pub mod logging;
pub mod mock;
pub mod parser;
pub mod protocol;
pub mod reader;
pub mod series;

#[cfg(feature = "python")]
mod python;

pub use blocking::BlockingEngine;
pub use config::DaqConfig;
pub use engine::{Engine, EngineStatus, Mode, StopReason};
pub use errors::*;
pub use link::{Channel, Link, SerialChannel};
pub use parser::{parse, ParsedChunk, ValueDecoder};
pub use protocol::{Command, OpcodeTable};
pub use reader::{ChunkReader, ReadStrategy};
pub use series::{Sample, SeriesCursor, SeriesStore};
