// Byte-oriented link to the board

use serialport::{self, SerialPort};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::info;

use super::protocol::Result;

/// Blocking read timeout once readiness has been seen
const READ_TIMEOUT_MS: u64 = 100;

/// How often the input queue is checked while waiting for readiness
const READY_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Serial-like connection used by the control loop
pub trait Transport {
    /// Write bytes, returning how many were accepted
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Read up to `buf.len()` bytes
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Block until input is available or `timeout` passes, true if readable
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;
}

/// Transport over a serial port device
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open a serial device at the given baud rate
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        info!("Opening AMC serial port {} at {} baud", device, baud);
        let port = serialport::new(device, baud)
            .timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(bytes.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    // serialport has no readiness API to hand to a poller, so this checks
    // the input queue every READY_POLL_INTERVAL until the deadline
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.port.bytes_to_read()? > 0 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(READY_POLL_INTERVAL.min(deadline - now));
        }
    }
}
