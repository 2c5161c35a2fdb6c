//! An in-memory [`SerialChannel`] for tests and demos.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use crate::channel::{ReadOutcome, SerialChannel};
use crate::error::ChannelError;

#[derive(Default)]
struct State {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    read_failure: Option<io::ErrorKind>,
    write_failure: Option<io::ErrorKind>,
    prepared: usize,
}

/// Inbound bytes are queued with [`feed`](Self::feed); outbound bytes are
/// captured and available through [`written`](Self::written).
///
/// `read_byte` waits up to the poll interval for data, so a listener over an
/// empty channel keeps observing cancellation.
pub struct MemoryChannel {
    state: Mutex<State>,
    arrived: Condvar,
    poll_interval: Duration,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(10))
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            arrived: Condvar::new(),
            poll_interval,
        }
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.state.lock().inbound.extend(bytes);
        self.arrived.notify_all();
    }

    /// The next `read_byte` fails with `kind` instead of returning data.
    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        self.state.lock().read_failure = Some(kind);
        self.arrived.notify_all();
    }

    /// Every subsequent write fails with `kind`; `None` restores writes.
    pub fn fail_writes(&self, kind: Option<io::ErrorKind>) {
        self.state.lock().write_failure = kind;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().inbound.len()
    }

    /// How many times a listener has called `prepare` on this channel.
    pub fn prepare_count(&self) -> usize {
        self.state.lock().prepared
    }
}

impl SerialChannel for MemoryChannel {
    fn prepare(&self) -> Result<(), ChannelError> {
        self.state.lock().prepared += 1;
        Ok(())
    }

    fn read_byte(&self) -> Result<ReadOutcome, ChannelError> {
        let mut state = self.state.lock();
        if state.inbound.is_empty() && state.read_failure.is_none() {
            self.arrived.wait_for(&mut state, self.poll_interval);
        }

        if let Some(kind) = state.read_failure.take() {
            return Err(ChannelError::Read(io::Error::new(kind, "injected read failure")));
        }

        Ok(match state.inbound.pop_front() {
            Some(value) => ReadOutcome::Byte {
                value,
                more: !state.inbound.is_empty(),
            },
            None => ReadOutcome::Idle,
        })
    }

    fn write(&self, bytes: &[u8]) -> Result<usize, ChannelError> {
        let mut state = self.state.lock();
        if let Some(kind) = state.write_failure {
            return Err(ChannelError::Write(io::Error::new(kind, "injected write failure")));
        }
        state.written.extend_from_slice(bytes);
        Ok(bytes.len())
    }
}
