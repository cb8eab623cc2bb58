//! Engine configuration.
//!
//! Every field has a default that suits the stock sketches at 115200 baud,
//! so a TOML file only needs the keys it changes:
//!
//! ```toml
//! port = "/dev/ttyACM0"
//! sample_delay_ms = 10
//! decoder = "absorbance"
//! strategy = "drain"
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DaqError, Result};
use crate::parser::ValueDecoder;
use crate::protocol::OpcodeTable;
use crate::reader::{ChunkReader, ReadStrategy};

pub const DEFAULT_BAUD_RATE: u32 = 115200;
/// Upper bound for any configured timeout or delay.
pub const MAX_TIMEOUT_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Serial device, e.g. `/dev/ttyACM0` or `COM3`.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Bound on every ordinary blocking read.
    pub read_timeout_ms: u64,
    /// Read timeout while waiting for handshake replies.
    pub handshake_timeout_ms: u64,
    /// Pause after reopening the port, while the board resets.
    pub settle_delay_ms: u64,
    pub handshake_exchanges: u32,
    /// Interval between streamed samples, sent to the device on every stream start.
    pub sample_delay_ms: u64,
    /// Lines thrown away after each stream start. Pacing/cleanliness only.
    pub warmup_reads: usize,
    pub n_reads_per_chunk: usize,
    /// Fraction of one chunk's worth of time the loop sleeps between cycles.
    pub pacing_factor: f64,
    pub strategy: ReadStrategy,
    pub decoder: ValueDecoder,
    pub opcodes: OpcodeTable,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 1000,
            handshake_timeout_ms: 2000,
            settle_delay_ms: 1000,
            handshake_exchanges: 2,
            sample_delay_ms: 20,
            warmup_reads: 5,
            n_reads_per_chunk: 4,
            pacing_factor: 0.8,
            strategy: ReadStrategy::Count,
            decoder: ValueDecoder::Voltage,
            opcodes: OpcodeTable::default(),
        }
    }
}

impl DaqConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| DaqError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| DaqError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_reads_per_chunk == 0 {
            return Err(DaqError::Config("n_reads_per_chunk must be at least 1".into()));
        }
        if self.sample_delay_ms == 0 {
            return Err(DaqError::Config("sample_delay_ms must be at least 1".into()));
        }
        if self.read_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(DaqError::Config("timeouts must be non-zero".into()));
        }
        let limits = [
            ("read_timeout_ms", self.read_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("settle_delay_ms", self.settle_delay_ms),
            ("sample_delay_ms", self.sample_delay_ms),
        ];
        if let Some((name, value)) = limits.iter().find(|(_, v)| *v > MAX_TIMEOUT_MS) {
            return Err(DaqError::Config(format!(
                "{name} must be at most {MAX_TIMEOUT_MS}, got {value}"
            )));
        }
        if !(self.pacing_factor.is_finite() && self.pacing_factor > 0.0) {
            return Err(DaqError::Config(format!(
                "pacing_factor must be positive, got {}",
                self.pacing_factor
            )));
        }
        if self.opcodes.has_collisions() {
            return Err(DaqError::Config("opcode table maps two commands to one byte".into()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Sleep between loop cycles: `pacing_factor x n_reads_per_chunk x sample_delay`.
    pub fn pacing_interval(&self) -> Duration {
        let chunk_ms = self.n_reads_per_chunk as f64 * self.sample_delay_ms as f64;
        Duration::from_micros((self.pacing_factor * chunk_ms * 1000.0).round() as u64)
    }

    pub fn chunk_reader(&self) -> ChunkReader {
        ChunkReader::new(self.strategy, self.n_reads_per_chunk)
    }
}
