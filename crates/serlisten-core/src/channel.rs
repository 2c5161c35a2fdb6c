//! The byte-level contract between the listener and whatever owns the port.
//!
//! A channel exposes exactly one serialized I/O path. Implementations may
//! (and [`SerialPortChannel`](crate::SerialPortChannel) does) make a write on
//! one thread wait for a read in progress on another and vice versa, so the
//! link is effectively half-duplex:
//!
//! - large writes delay callback delivery until they finish;
//! - a read waiting for data delays writes by up to one poll interval.
//!
//! Callers that need responsive reception should split large payloads into
//! small chunks (see [`write_chunks`](crate::write_chunks)).

use std::io;

use crate::error::ChannelError;

/// Result of one non-fatal `read_byte` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One byte; `more` is set when at least one further byte can be read
    /// without waiting.
    Byte { value: u8, more: bool },
    /// Nothing arrived within the channel's poll interval.
    Idle,
}

pub trait SerialChannel: Send + Sync {
    /// Called once by the listener thread before its first read.
    fn prepare(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Waits up to the channel's poll interval for a byte.
    ///
    /// Timeouts are reported as [`ReadOutcome::Idle`]; an `Err` always means
    /// the channel is unusable for reading.
    fn read_byte(&self) -> Result<ReadOutcome, ChannelError>;

    /// Performs a single write and returns how many bytes were accepted.
    fn write(&self, bytes: &[u8]) -> Result<usize, ChannelError>;

    fn write_all(&self, mut bytes: &[u8]) -> Result<(), ChannelError> {
        while !bytes.is_empty() {
            match self.write(bytes)? {
                0 => {
                    return Err(ChannelError::Write(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "channel accepted no bytes",
                    )))
                }
                n => bytes = &bytes[n..],
            }
        }
        Ok(())
    }
}
