//! Core functionalities: background serial listener, handler registry,
//! channel abstraction and chunked writes.

pub mod channel;
pub mod error;
pub mod listener;
pub mod mock;
pub mod registry;
pub mod serial_port;
pub mod text;
pub mod writer;

pub use channel::{ReadOutcome, SerialChannel};
pub use error::{ChannelError, Error, LifecycleError, RegistrationError, Result};
pub use listener::{Listener, ListenerConfig, ListenerEvent, ListenerHandle, ListenerState};
pub use mock::MemoryChannel;
pub use registry::{CallbackRegistry, EntryId, Handler};
pub use serial_port::{SerialConfig, SerialPortChannel};
pub use text::{LineAssembler, TextEncoding};
pub use writer::{write_bytes, write_chunks, write_file, DEFAULT_CHUNK_SIZE};

/// Version of this crate, for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
