use std::collections::TryReserveError;
use std::io;

/// Failure to add a handler. The registry is left exactly as it was.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("cannot grow callback registry: {0}")]
    OutOfMemory(#[from] TryReserveError),
}

/// Caller mistakes around `start`/`stop`. None of them corrupt listener state.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("listener is already running")]
    AlreadyRunning,
    #[error("listener was never started")]
    NotRunning,
    #[error("failed to spawn listener thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial read failed: {0}")]
    Read(#[source] io::Error),
    #[error("serial write failed: {0}")]
    Write(#[source] io::Error),
}

impl ChannelError {
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::Open { source, .. } => io::Error::from(source.clone()).kind(),
            Self::Read(e) | Self::Write(e) => e.kind(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
