//! Chunked reads with carry-over.
//!
//! A chunk is the carry-over from the previous cycle followed by whatever
//! was read this cycle. It holds zero or more complete records and possibly
//! an unterminated tail, which the parser hands back for the next chunk.

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::link::Link;

/// How a chunk is pulled off the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStrategy {
    /// Take whatever is queued, once. Never blocks for data that has not
    /// arrived, so a chunk may hold no complete record.
    Drain,
    /// Perform `n_reads_per_chunk` line reads, blocking (up to the link
    /// timeout each) until that many lines arrive.
    #[default]
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReader {
    pub strategy: ReadStrategy,
    pub n_reads_per_chunk: usize,
}

impl ChunkReader {
    pub fn new(strategy: ReadStrategy, n_reads_per_chunk: usize) -> Self {
        Self {
            strategy,
            n_reads_per_chunk,
        }
    }

    /// Return `carry_over` followed by the newly read bytes.
    pub fn read_chunk(&self, link: &mut Link, carry_over: Vec<u8>) -> Result<Vec<u8>> {
        let fresh = match self.strategy {
            ReadStrategy::Drain => link.read_available()?,
            ReadStrategy::Count => link.read_lines(self.n_reads_per_chunk)?,
        };
        let mut raw = carry_over;
        raw.extend(fresh);
        Ok(raw)
    }
}
