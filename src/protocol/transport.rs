use anyhow::{anyhow, Result};
use std::{
    io::{self, Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::config::SerialSettings;

/// Delay between two drain reads so a burst from the board lands in one chunk.
const DRAIN_SETTLE: Duration = Duration::from_millis(100);

/// Byte-level access to the sensor board link.
///
/// The serial port is the production implementation; tests plug in a
/// simulated board. All calls are blocking and bounded by the port timeout.
pub trait Transport: Send {
    /// Number of bytes waiting in the input buffer.
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Drop anything still waiting in the input buffer.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Drive the DTR line, used as a reset line on boards wired that way.
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        SerialPort::bytes_to_read(self.as_ref())
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(self, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.write_data_terminal_ready(level)
            .map_err(io::Error::from)
    }
}

/// Open the sensor board serial device with fixed 8N1 framing.
pub fn open_serial(settings: &SerialSettings) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(&settings.port, settings.baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(settings.read_timeout_ms));
    // The transfer program reopens the device during an upgrade.
    #[cfg(unix)]
    let builder = builder.exclusive(false);

    builder
        .open()
        .map_err(|err| anyhow!("Failed to open port {}: {err}", settings.port))
}

/// Drain everything the board has sent so far.
///
/// Keeps reading while bytes are waiting, pausing briefly between chunks so a
/// message arriving in several bursts is returned in one piece when possible.
pub fn read_available(transport: &mut dyn Transport) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut count = transport.bytes_to_read()?;
    while count > 0 {
        let start = data.len();
        data.resize(start + count, 0);
        match transport.read(&mut data[start..]) {
            Ok(n) => data.truncate(start + n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                data.truncate(start);
                break;
            }
            Err(e) => return Err(e),
        }
        std::thread::sleep(DRAIN_SETTLE);
        count = transport.bytes_to_read()?;
    }
    Ok(data)
}
