//! Byte transports the driver reads from and writes to.
//!
//! The driver never assumes reads are message aligned: a read returns
//! whatever the port has buffered, which may end mid-frame.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::config::HeadstageConfig;
use crate::errors::{DriverError, Result};

pub trait Transport: Send {
    /// Everything currently buffered, possibly nothing. Does not wait for more.
    fn read_available(&mut self) -> Result<Vec<u8>>;

    /// Up to `len` bytes, waiting no longer than the transport's read timeout.
    /// A short result means the device stopped sending.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>>;

    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    fn bytes_waiting(&mut self) -> Result<usize>;

    fn close(&mut self) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_available(&mut self) -> Result<Vec<u8>> {
        (**self).read_available()
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        (**self).read_bytes(len)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes)
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        (**self).bytes_waiting()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

// ============================================================================
// Serial port
// ============================================================================

/// 8N1 serial link without flow control.
pub struct SerialTransport {
    path: String,
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()?;
        info!("CPCH port opened: {} @ {} baud", path, baud_rate);

        Ok(Self {
            path: path.to_string(),
            port: Some(port),
            timeout,
        })
    }

    pub fn from_config(config: &HeadstageConfig) -> Result<Self> {
        Self::open(&config.port, config.baud_rate, config.read_timeout())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| DriverError::NotReady(format!("serial port {} is closed", self.path)))
    }
}

/// A port that stops accepting or yielding bytes surfaces as `Timeout`.
fn port_error(path: &str, op: &str, e: std::io::Error) -> DriverError {
    if e.kind() == ErrorKind::TimedOut {
        DriverError::Timeout(format!("{op} on {path}"))
    } else {
        DriverError::Io(e)
    }
}

impl Transport for SerialTransport {
    fn read_available(&mut self) -> Result<Vec<u8>> {
        let path = self.path.clone();
        let port = self.port()?;
        let waiting = port.bytes_to_read()? as usize;
        let mut buf = vec![0u8; waiting];
        if waiting > 0 {
            port.read_exact(&mut buf).map_err(|e| port_error(&path, "read", e))?;
        }
        Ok(buf)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let port = self.port()?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() > deadline {
                break;
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let path = self.path.clone();
        let port = self.port()?;
        port.write_all(bytes)
            .and_then(|()| port.flush())
            .map_err(|e| port_error(&path, "write", e))
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        Ok(self.port()?.bytes_to_read()? as usize)
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            info!("CPCH port closed: {}", self.path);
        }
        Ok(())
    }
}

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    inbound: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    closed: bool,
}

/// Scripted in-process transport.
///
/// Clones share state, so a test can keep a handle while the driver owns
/// another. Each `write` releases the next queued reply into the inbound
/// stream; bytes pushed with [`MemoryTransport::push_inbound`] are readable
/// immediately.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        self.state.lock().inbound.extend(bytes);
    }

    /// Queue a reply released by the next write that has no reply yet.
    pub fn queue_reply(&self, reply: Vec<u8>) {
        self.state.lock().replies.push_back(reply);
    }

    /// Every buffer written so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub fn pending_inbound(&self) -> usize {
        self.state.lock().inbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_open(state: &MemoryState) -> Result<()> {
        if state.closed {
            return Err(DriverError::NotReady("memory transport is closed".into()));
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn read_available(&mut self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        Ok(state.inbound.drain(..).collect())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        let n = len.min(state.inbound.len());
        Ok(state.inbound.drain(..n).collect())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.written.push(bytes.to_vec());
        if let Some(reply) = state.replies.pop_front() {
            debug!("memory transport releasing {} reply bytes", reply.len());
            state.inbound.extend(reply);
        }
        Ok(())
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        let state = self.state.lock();
        Self::check_open(&state)?;
        Ok(state.inbound.len())
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
