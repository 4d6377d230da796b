//! Bounded reads from files, readers and borrowed descriptors.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

/// Read at most `limit` bytes from `r`.
pub fn read_prefix(r: &mut impl Read, limit: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(limit.min(64 * 1024));
    r.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Read at most `limit` bytes from the start of the file at `path`.
pub fn read_path(path: &Path, limit: usize) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    read_prefix(&mut file, limit)
}

/// Read at most `limit` bytes from the current position of a borrowed
/// descriptor. The descriptor stays open and, when it is seekable, its
/// position is put back afterwards.
#[cfg(unix)]
pub fn read_descriptor(fd: std::os::fd::BorrowedFd<'_>, limit: usize) -> io::Result<Vec<u8>> {
    let mut file = File::from(fd.try_clone_to_owned()?);
    let start = file.stream_position().ok();
    let buf = read_prefix(&mut file, limit)?;
    if let Some(pos) = start {
        if let Err(e) = file.seek(SeekFrom::Start(pos)) {
            debug!(error = %e, "could not restore descriptor position");
        }
    }
    Ok(buf)
}
