//! Command vocabulary shared with the acquisition firmware.
//!
//! Every command is a single opcode byte. Only `SetStreamDelay` carries a
//! payload: the delay in milliseconds as decimal ASCII, terminated by `'x'`.
//! The firmware does not reliably keep the delay across stream toggles, so
//! the engine sends it again before every `StartStream`.

use serde::{Deserialize, Serialize};

/// Line delimiter the firmware terminates every reply with.
pub const LINE_DELIMITER: &[u8] = b"\r\n";

/// Byte that ends a blocking line read.
pub const LINE_END: u8 = b'\n';

/// Terminator of the `SetStreamDelay` payload.
pub const DELAY_TERMINATOR: u8 = b'x';

/// Commands understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Device replies with a readiness line.
    Handshake,
    /// Device replies with exactly one `<time>,<value>` line.
    SingleSampleRequest,
    /// Device stops continuous emission.
    StopStream,
    /// Device starts continuous emission at the configured delay.
    StartStream,
    /// Followed by the delay payload, see [`encode_stream_delay`].
    SetStreamDelay,
}

/// Opcode byte for each [`Command`].
///
/// The defaults match the stock sketches; a rig flashed with a different
/// table can override it from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcodeTable {
    pub handshake: u8,
    pub single_sample_request: u8,
    pub stop_stream: u8,
    pub start_stream: u8,
    pub set_stream_delay: u8,
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self {
            handshake: 0,
            single_sample_request: 1,
            stop_stream: 2,
            start_stream: 3,
            set_stream_delay: 4,
        }
    }
}

impl OpcodeTable {
    pub fn opcode(&self, command: Command) -> u8 {
        match command {
            Command::Handshake => self.handshake,
            Command::SingleSampleRequest => self.single_sample_request,
            Command::StopStream => self.stop_stream,
            Command::StartStream => self.start_stream,
            Command::SetStreamDelay => self.set_stream_delay,
        }
    }

    /// Reverse lookup, used by the mock device to interpret what it receives.
    pub fn command(&self, opcode: u8) -> Option<Command> {
        [
            Command::Handshake,
            Command::SingleSampleRequest,
            Command::StopStream,
            Command::StartStream,
            Command::SetStreamDelay,
        ]
        .into_iter()
        .find(|&c| self.opcode(c) == opcode)
    }

    /// True when two commands share a byte, which the firmware cannot tell apart.
    pub fn has_collisions(&self) -> bool {
        let mut seen = [false; 256];
        [
            self.handshake,
            self.single_sample_request,
            self.stop_stream,
            self.start_stream,
            self.set_stream_delay,
        ]
        .into_iter()
        .any(|op| std::mem::replace(&mut seen[op as usize], true))
    }
}

/// Encode the `SetStreamDelay` payload: decimal milliseconds then `'x'`.
pub fn encode_stream_delay(delay_ms: u64) -> Vec<u8> {
    let mut payload = delay_ms.to_string().into_bytes();
    payload.push(DELAY_TERMINATOR);
    payload
}

/// Decode a `SetStreamDelay` payload. Returns `None` unless the bytes are
/// ASCII digits followed by exactly one terminator.
pub fn decode_stream_delay(payload: &[u8]) -> Option<u64> {
    let (digits, rest) = payload.split_at(payload.iter().position(|&b| b == DELAY_TERMINATOR)?);
    if rest.len() != 1 || digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
