use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::channel::SerialChannel;
use crate::error::{ChannelError, Result};

/// Chunk size used by [`write_file`] callers that have no preference.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Copies `reader` to `channel` in chunks of at most `chunk_size` bytes and
/// returns the number of bytes written.
///
/// Small chunks let the listener thread get at the port between writes.
/// A failed write aborts the copy; nothing is retried.
pub fn write_chunks<R: Read>(
    channel: &dyn SerialChannel,
    mut reader: R,
    chunk_size: usize,
) -> Result<usize> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0;

    loop {
        let filled = fill(&mut reader, &mut buf)?;
        if filled == 0 {
            break;
        }
        channel.write_all(&buf[..filled])?;
        total += filled;
        log::trace!("sent chunk of {filled} byte(s), {total} total");
        if filled < buf.len() {
            break;
        }
    }

    Ok(total)
}

/// Sends the contents of the file at `path` through [`write_chunks`].
pub fn write_file(
    channel: &dyn SerialChannel,
    path: impl AsRef<Path>,
    chunk_size: usize,
) -> Result<usize> {
    let path = path.as_ref();
    let file = File::open(path)?;
    log::info!("sending {}", path.display());
    let sent = write_chunks(channel, file, chunk_size)?;
    log::info!("sent {sent} byte(s) from {}", path.display());
    Ok(sent)
}

/// Writes `bytes` in one go, reporting how many were accepted.
pub fn write_bytes(channel: &dyn SerialChannel, bytes: &[u8]) -> Result<usize, ChannelError> {
    channel.write_all(bytes)?;
    Ok(bytes.len())
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
