//! Scripted stand-in for the acquisition firmware.
//!
//! [`MockDevice`] implements [`Channel`] and answers opcodes the way the
//! sketches do: a readiness line for the handshake, one record per sample
//! request, and a record per read while streaming. Every command it
//! receives is logged so tests can check what the engine sent, and the
//! device can be unplugged mid-run.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::errors::{DaqError, Result};
use crate::link::Channel;
use crate::protocol::{decode_stream_delay, Command, OpcodeTable, DELAY_TERMINATOR};

const HANDSHAKE_REPLY: &[u8] = b"Message received.\r\n";
const DEFAULT_DELAY_MS: u64 = 20;
/// Records made available per `bytes_to_read` call while streaming.
const STREAM_BURST: usize = 3;

#[derive(Debug)]
struct MockState {
    opcodes: OpcodeTable,
    written: Vec<u8>,
    commands: Vec<Command>,
    delay_payload: Option<Vec<u8>>,
    output: VecDeque<u8>,
    streaming: bool,
    stream_delay_ms: Option<u64>,
    clock_ms: u64,
    code: u64,
    timeout: Duration,
    open: bool,
    plugged_in: bool,
    silent: bool,
    end_of_stream: bool,
    reopens: usize,
}

impl MockState {
    fn emit_record(&mut self) {
        let line = format!("{},{}\r\n", self.clock_ms, self.code);
        self.output.extend(line.into_bytes());
        self.clock_ms += self.stream_delay_ms.unwrap_or(DEFAULT_DELAY_MS);
        self.code = (self.code + 37) % 1024;
    }

    fn receive(&mut self, byte: u8) {
        if let Some(payload) = self.delay_payload.as_mut() {
            payload.push(byte);
            if byte == DELAY_TERMINATOR {
                let payload = self.delay_payload.take().unwrap_or_default();
                self.stream_delay_ms = decode_stream_delay(&payload);
            }
            return;
        }

        let Some(command) = self.opcodes.command(byte) else {
            return;
        };
        self.commands.push(command);
        match command {
            Command::Handshake if !self.silent => self.output.extend(HANDSHAKE_REPLY),
            Command::Handshake => {}
            Command::SingleSampleRequest if !self.silent => self.emit_record(),
            Command::SingleSampleRequest => {}
            Command::StopStream => self.streaming = false,
            Command::StartStream => self.streaming = true,
            Command::SetStreamDelay => self.delay_payload = Some(Vec::new()),
        }
    }
}

/// Cloneable handle to one simulated device; all clones share state.
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                opcodes: OpcodeTable::default(),
                written: Vec::new(),
                commands: Vec::new(),
                delay_payload: None,
                output: VecDeque::new(),
                streaming: false,
                stream_delay_ms: None,
                clock_ms: 0,
                code: 0,
                timeout: Duration::from_millis(100),
                open: true,
                plugged_in: true,
                silent: false,
                end_of_stream: false,
                reopens: 0,
            })),
        }
    }

    /// A device that never answers requests.
    pub fn silent(self) -> Self {
        self.with_state(|s| s.silent = true);
        self
    }

    /// Reads on an empty queue return `Ok(0)` instead of timing out.
    pub fn end_of_stream(self) -> Self {
        self.with_state(|s| s.end_of_stream = true);
        self
    }

    pub fn with_opcodes(self, opcodes: OpcodeTable) -> Self {
        self.with_state(|s| s.opcodes = opcodes);
        self
    }

    /// Queue raw bytes as if the device had sent them.
    pub fn push_output(&self, bytes: &[u8]) {
        self.with_state(|s| s.output.extend(bytes));
    }

    /// Simulate the cable being pulled.
    pub fn disconnect(&self) {
        self.with_state(|s| {
            s.plugged_in = false;
            s.open = false;
        });
    }

    /// Every byte written to the device.
    pub fn written(&self) -> Vec<u8> {
        self.with_state(|s| s.written.clone())
    }

    /// Commands recognised so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.with_state(|s| s.commands.clone())
    }

    pub fn count(&self, command: Command) -> usize {
        self.with_state(|s| s.commands.iter().filter(|&&c| c == command).count())
    }

    pub fn stream_delay_ms(&self) -> Option<u64> {
        self.with_state(|s| s.stream_delay_ms)
    }

    pub fn is_streaming(&self) -> bool {
        self.with_state(|s| s.streaming)
    }

    /// Timestamp the next emitted record will carry.
    pub fn clock_ms(&self) -> u64 {
        self.with_state(|s| s.clock_ms)
    }

    pub fn reopens(&self) -> usize {
        self.with_state(|s| s.reopens)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn check_io(state: &MockState) -> io::Result<()> {
        if !state.plugged_in {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
        } else if !state.open {
            Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"))
        } else {
            Ok(())
        }
    }
}

impl Read for MockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_state(|s| -> io::Result<usize> {
            MockDevice::check_io(s)?;
            if s.output.is_empty() && s.streaming {
                s.emit_record();
            }
            if s.output.is_empty() && s.end_of_stream {
                return Ok(0);
            }
            if s.output.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(s.output.len());
            for (slot, byte) in buf.iter_mut().zip(s.output.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        })
    }
}

impl Write for MockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_state(|s| -> io::Result<usize> {
            MockDevice::check_io(s)?;
            s.written.extend_from_slice(buf);
            for &byte in buf {
                s.receive(byte);
            }
            Ok(buf.len())
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_state(|s| MockDevice::check_io(s))
    }
}

impl Channel for MockDevice {
    fn timeout(&self) -> Duration {
        self.with_state(|s| s.timeout)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.with_state(|s| s.timeout = timeout);
        Ok(())
    }

    fn bytes_to_read(&self) -> Result<usize> {
        self.with_state(|s| -> Result<usize> {
            MockDevice::check_io(s)?;
            if s.output.is_empty() && s.streaming {
                for _ in 0..STREAM_BURST {
                    s.emit_record();
                }
            }
            Ok(s.output.len())
        })
    }

    fn clear_input(&self) -> Result<()> {
        self.with_state(|s| -> Result<()> {
            MockDevice::check_io(s)?;
            s.output.clear();
            Ok(())
        })
    }

    fn reopen(&mut self) -> Result<()> {
        self.with_state(|s| -> Result<()> {
            if !s.plugged_in {
                return Err(DaqError::Connection {
                    port: "mock".into(),
                    source: serialport::Error::new(
                        serialport::ErrorKind::NoDevice,
                        "mock device unplugged",
                    ),
                });
            }
            s.open = true;
            s.streaming = false;
            s.output.clear();
            s.reopens += 1;
            Ok(())
        })
    }

    fn close(&mut self) {
        self.with_state(|s| s.open = false);
    }

    fn is_open(&self) -> bool {
        self.with_state(|s| s.open && s.plugged_in)
    }
}
