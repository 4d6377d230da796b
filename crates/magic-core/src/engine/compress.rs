//! Decompression of wrapped content.

use std::io::Read;

use flate2::read::MultiGzDecoder;
use tracing::debug;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b, 0x08];

/// Inflate gzip data, keeping at most `limit` bytes of output. A stream
/// that breaks off part-way still yields what was decoded before the
/// failure. Returns `None` for non-gzip input or when nothing decodes.
pub(crate) fn gunzip(buf: &[u8], limit: usize) -> Option<Vec<u8>> {
    if !buf.starts_with(GZIP_MAGIC) {
        return None;
    }

    let mut decoder = MultiGzDecoder::new(buf).take(limit as u64);
    let mut out = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, decoded = out.len(), "gzip stream ended early");
                if out.is_empty() {
                    return None;
                }
                break;
            }
        }
    }
    Some(out)
}
