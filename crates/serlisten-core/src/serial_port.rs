use parking_lot::Mutex;
use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::channel::{ReadOutcome, SerialChannel};
use crate::error::ChannelError;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: serialport::DataBits,
    pub parity: serialport::Parity,
    pub stop_bits: serialport::StopBits,
    pub flow_control: serialport::FlowControl,
    /// Upper bound on how long one `read_byte` waits, and therefore on how
    /// long `stop` may wait for the listener to notice cancellation.
    pub read_timeout: Duration,
}

impl SerialConfig {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 9_600,
            data_bits: serialport::DataBits::Eight,
            parity: serialport::Parity::None,
            stop_bits: serialport::StopBits::One,
            flow_control: serialport::FlowControl::None,
            read_timeout: Duration::from_millis(50),
        }
    }
}

struct PortIo {
    port: Box<dyn SerialPort>,
    pending: VecDeque<u8>,
}

/// A [`SerialChannel`] over a real port.
///
/// Reads and writes share one lock around the port handle, so they never
/// overlap. A blocked read holds the lock for at most `read_timeout`.
pub struct SerialPortChannel {
    name: String,
    io: Mutex<PortIo>,
}

impl SerialPortChannel {
    pub fn open(cfg: &SerialConfig) -> Result<Self, ChannelError> {
        let port = serialport::new(&cfg.port_name, cfg.baud_rate)
            .data_bits(cfg.data_bits)
            .parity(cfg.parity)
            .stop_bits(cfg.stop_bits)
            .flow_control(cfg.flow_control)
            .timeout(cfg.read_timeout)
            .open()
            .map_err(|source| ChannelError::Open {
                port: cfg.port_name.clone(),
                source,
            })?;

        log::info!(
            "opened {} at {} baud ({:?}, {:?}, {:?})",
            cfg.port_name,
            cfg.baud_rate,
            cfg.data_bits,
            cfg.parity,
            cfg.stop_bits
        );

        Ok(Self::from_port(cfg.port_name.clone(), port))
    }

    /// Wraps an already opened port; its configured timeout becomes the
    /// poll interval.
    pub fn from_port(name: String, port: Box<dyn SerialPort>) -> Self {
        Self {
            name,
            io: Mutex::new(PortIo {
                port,
                pending: VecDeque::with_capacity(READ_CHUNK),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn is_idle(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

impl SerialChannel for SerialPortChannel {
    fn read_byte(&self) -> Result<ReadOutcome, ChannelError> {
        let mut state = self.io.lock();

        if state.pending.is_empty() {
            let mut buf = [0u8; READ_CHUNK];
            match state.port.read(&mut buf) {
                Ok(0) => return Ok(ReadOutcome::Idle),
                Ok(n) => state.pending.extend(&buf[..n]),
                Err(e) if is_idle(e.kind()) => return Ok(ReadOutcome::Idle),
                Err(e) => return Err(ChannelError::Read(e)),
            }
        }

        match state.pending.pop_front() {
            Some(value) => Ok(ReadOutcome::Byte {
                value,
                more: !state.pending.is_empty(),
            }),
            None => Ok(ReadOutcome::Idle),
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<usize, ChannelError> {
        let mut state = self.io.lock();
        loop {
            match state.port.write(bytes) {
                Ok(n) => {
                    log::trace!("{}: wrote {n} of {} bytes", self.name, bytes.len());
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChannelError::Write(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_classic_terminal_settings() {
        let cfg = SerialConfig::new("COM7");
        assert_eq!(cfg.port_name, "COM7");
        assert_eq!(cfg.baud_rate, 9_600);
        assert_eq!(cfg.data_bits, serialport::DataBits::Eight);
        assert_eq!(cfg.parity, serialport::Parity::None);
        assert_eq!(cfg.stop_bits, serialport::StopBits::One);
        assert_eq!(cfg.flow_control, serialport::FlowControl::None);
        assert_eq!(cfg.read_timeout, Duration::from_millis(50));
    }

    #[test]
    fn timeouts_are_not_errors() {
        assert!(is_idle(io::ErrorKind::TimedOut));
        assert!(is_idle(io::ErrorKind::WouldBlock));
        assert!(!is_idle(io::ErrorKind::BrokenPipe));
        assert!(!is_idle(io::ErrorKind::PermissionDenied));
    }

    #[test]
    fn opening_a_missing_port_reports_its_name() {
        let cfg = SerialConfig::new("/dev/serlisten-does-not-exist");
        match SerialPortChannel::open(&cfg) {
            Err(ChannelError::Open { port, .. }) => {
                assert_eq!(port, "/dev/serlisten-does-not-exist")
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a port that should not exist"),
        }
    }
}
