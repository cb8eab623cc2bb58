//! Byte-stream link to the acquisition firmware.
//!
//! [`Link`] owns a [`Channel`] (a serial port in production, a scripted
//! device in tests) and provides the handful of blocking primitives the
//! engine is built from. Every read is bounded by the link timeout, so a
//! stalled device can delay a caller but never hang it.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serialport::{ClearBuffer, SerialPort};

use crate::errors::{DaqError, Result};
use crate::protocol::{Command, OpcodeTable, LINE_END};

/// Timeout used while draining bytes that are already queued.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Transport the link talks through.
pub trait Channel: Read + Write + Send {
    fn timeout(&self) -> Duration;
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    /// Bytes received and not yet read.
    fn bytes_to_read(&self) -> Result<usize>;
    /// Discard everything received so far.
    fn clear_input(&self) -> Result<()>;
    /// Close (if needed) and open the underlying device again.
    fn reopen(&mut self) -> Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

// ============================================================================
// Serial port transport
// ============================================================================

/// [`Channel`] backed by a `serialport` device.
pub struct SerialChannel {
    path: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialChannel {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let mut channel = Self {
            path: path.to_string(),
            baud_rate,
            timeout,
            port: None,
        };
        channel.reopen()?;
        Ok(channel)
    }

    fn port(&self) -> io::Result<&dyn SerialPort> {
        self.port
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))
    }

    fn port_mut(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port_mut()?.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port_mut()?.flush()
    }
}

impl Channel for SerialChannel {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn bytes_to_read(&self) -> Result<usize> {
        Ok(self.port()?.bytes_to_read()? as usize)
    }

    fn clear_input(&self) -> Result<()> {
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        self.close();
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|source| DaqError::Connection {
                port: self.path.clone(),
                source,
            })?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the handle releases the device.
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

// ============================================================================
// Link
// ============================================================================

/// Blocking command/response primitives over a [`Channel`].
pub struct Link {
    channel: Box<dyn Channel>,
    opcodes: OpcodeTable,
    open: bool,
}

impl Link {
    /// Open a serial device.
    pub fn open(port: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let channel = SerialChannel::open(port, baud_rate, timeout)?;
        info!("opened {} at {} baud", port, baud_rate);
        Ok(Self::from_channel(Box::new(channel)))
    }

    /// Wrap an already-open transport.
    pub fn from_channel(channel: Box<dyn Channel>) -> Self {
        let open = channel.is_open();
        Self {
            channel,
            opcodes: OpcodeTable::default(),
            open,
        }
    }

    pub fn with_opcodes(mut self, opcodes: OpcodeTable) -> Self {
        self.opcodes = opcodes;
        self
    }

    pub fn opcodes(&self) -> &OpcodeTable {
        &self.opcodes
    }

    /// Reset the device connection and confirm the firmware answers.
    ///
    /// The channel is reopened (which resets most boards), given `settle` to
    /// boot, flushed, and then sent the handshake opcode `exchanges` times,
    /// reading one line after each. The first reply after a reset is not
    /// reliable, hence more than one exchange. Only the last reply has to be
    /// a complete line. The previous read timeout is restored on every path.
    pub fn handshake(&mut self, settle: Duration, timeout: Duration, exchanges: u32) -> Result<()> {
        self.channel.close();
        self.channel.reopen()?;
        self.open = true;
        thread::sleep(settle);

        let previous = self.timeout();
        self.set_timeout(timeout)?;
        let outcome = self.exchange_handshakes(exchanges.max(1));
        let restored = self.set_timeout(previous);

        let reply = outcome?;
        restored?;
        debug!("handshake reply: {}", String::from_utf8_lossy(&reply).trim());
        Ok(())
    }

    fn exchange_handshakes(&mut self, exchanges: u32) -> Result<Vec<u8>> {
        let _ = self.read_available()?;
        self.channel.clear_input()?;

        let mut reply = Vec::new();
        for _ in 0..exchanges {
            self.send(Command::Handshake, &[])?;
            reply = self.read_line()?;
        }
        if reply.last() != Some(&LINE_END) {
            return Err(DaqError::Handshake(format!(
                "no complete reply within {:?} (got {:?})",
                self.timeout(),
                String::from_utf8_lossy(&reply)
            )));
        }
        Ok(reply)
    }

    /// Send a command from the opcode table.
    pub fn send(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        let opcode = self.opcodes.opcode(command);
        self.write_command(opcode, payload)
    }

    /// Write an opcode byte followed by `payload`. No acknowledgement is awaited.
    pub fn write_command(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut message = Vec::with_capacity(1 + payload.len());
        message.push(opcode);
        message.extend_from_slice(payload);

        let written = self
            .channel
            .write_all(&message)
            .and_then(|_| self.channel.flush());
        written.map_err(|e| self.fail(e))
    }

    /// Read exactly what is queued right now. Empty when nothing is waiting.
    pub fn read_available(&mut self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let queued = match self.channel.bytes_to_read() {
            Ok(n) => n,
            Err(DaqError::Io(e)) => return Err(self.fail(e)),
            Err(e) => return Err(e),
        };
        if queued == 0 {
            return Ok(Vec::new());
        }

        let previous = self.timeout();
        self.set_timeout(DRAIN_TIMEOUT)?;
        let read = self.read_up_to(queued);
        let restored = self.set_timeout(previous);
        let buf = read?;
        restored?;
        Ok(buf)
    }

    fn read_up_to(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.channel.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Read up to and including the next `\n`.
    ///
    /// On timeout the partial line is returned as is (possibly empty); the
    /// caller decides whether an unterminated line is an error.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        // A timeout too large to add to `now` leaves the channel's own
        // timeout as the only bound.
        let deadline = Instant::now().checked_add(self.timeout());
        let mut line = Vec::with_capacity(32);
        let mut byte = [0u8; 1];

        loop {
            match self.channel.read(&mut byte) {
                // End of stream: nothing more will arrive for this line.
                Ok(0) => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == LINE_END {
                        break;
                    }
                }
                Err(e) if is_timeout(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e)),
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
        }
        Ok(line)
    }

    /// `n` consecutive [`read_line`](Self::read_line) calls, concatenated.
    pub fn read_lines(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        for _ in 0..n {
            raw.extend(self.read_line()?);
        }
        Ok(raw)
    }

    pub fn clear_input(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.channel.clear_input()
    }

    pub fn timeout(&self) -> Duration {
        self.channel.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.channel.set_timeout(timeout)
    }

    pub fn is_open(&self) -> bool {
        self.open && self.channel.is_open()
    }

    /// Release the device. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.open {
            debug!("closing link");
        }
        self.open = false;
        self.channel.close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DaqError::LinkClosed("link is not open".into()))
        }
    }

    /// An I/O failure other than a timeout means the device is gone.
    fn fail(&mut self, e: io::Error) -> DaqError {
        warn!("link failure, closing: {}", e);
        self.close();
        DaqError::LinkClosed(e.to_string())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn read_line_includes_delimiter() {
        let device = MockDevice::new();
        device.push_output(b"1,2\r\n3,4\r\n");
        let mut link = Link::from_channel(Box::new(device.clone()));

        assert_eq!(link.read_line().unwrap(), b"1,2\r\n");
        assert_eq!(link.read_lines(2).unwrap(), b"3,4\r\n");
    }

    #[test]
    fn read_available_drains_queue_only() {
        let device = MockDevice::new();
        let mut link = Link::from_channel(Box::new(device.clone()));
        assert!(link.read_available().unwrap().is_empty());

        device.push_output(b"10,5\r\n11");
        let before = link.timeout();
        assert_eq!(link.read_available().unwrap(), b"10,5\r\n11");
        assert_eq!(link.timeout(), before);
    }

    #[test]
    fn write_command_sends_opcode_then_payload() {
        let device = MockDevice::new();
        let mut link = Link::from_channel(Box::new(device.clone()));
        link.write_command(4, b"20x").unwrap();
        assert_eq!(device.written(), vec![4, b'2', b'0', b'x']);
        assert_eq!(device.stream_delay_ms(), Some(20));
    }

    #[test]
    fn handshake_restores_timeout() {
        let device = MockDevice::new();
        let mut link = Link::from_channel(Box::new(device.clone()));
        let before = link.timeout();
        link.handshake(Duration::ZERO, Duration::from_millis(200), 2)
            .unwrap();
        assert_eq!(link.timeout(), before);
        assert_eq!(device.commands(), vec![Command::Handshake, Command::Handshake]);
    }

    #[test]
    fn silent_device_fails_handshake() {
        let device = MockDevice::new().silent();
        let mut link = Link::from_channel(Box::new(device.clone()));
        let err = link
            .handshake(Duration::ZERO, Duration::from_millis(20), 2)
            .unwrap_err();
        assert!(matches!(err, DaqError::Handshake(_)));
    }

    #[test]
    fn read_line_stops_at_end_of_stream() {
        let device = MockDevice::new().end_of_stream();
        device.push_output(b"12,3");
        let mut link = Link::from_channel(Box::new(device.clone()));
        link.set_timeout(Duration::MAX).unwrap();

        let started = Instant::now();
        assert_eq!(link.read_line().unwrap(), b"12,3");
        assert!(link.read_line().unwrap().is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(link.is_open());
    }

    #[test]
    fn io_failure_closes_link() {
        let device = MockDevice::new();
        let mut link = Link::from_channel(Box::new(device.clone()));
        device.disconnect();
        assert!(matches!(link.read_line(), Err(DaqError::LinkClosed(_))));
        assert!(!link.is_open());

        link.close();
        link.close();
        assert!(matches!(
            link.write_command(2, &[]),
            Err(DaqError::LinkClosed(_))
        ));
    }
}
