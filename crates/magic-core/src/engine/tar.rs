//! Tar header recognition by checksum.

const RECORD: usize = 512;
const CHKSUM: std::ops::Range<usize> = 148..156;
const MAGIC: std::ops::Range<usize> = 257..265;

/// Flavour of a recognised tar header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TarKind {
    /// Pre-POSIX header without magic.
    V7,
    Posix,
    Gnu,
}

impl TarKind {
    pub(crate) fn description(self) -> &'static str {
        match self {
            Self::V7 => "tar archive",
            Self::Posix => "POSIX tar archive",
            Self::Gnu => "POSIX tar archive (GNU)",
        }
    }
}

/// Inspect the first record of `buf`. The stored checksum must equal the
/// byte sum of the header with the checksum field read as spaces.
pub(crate) fn detect(buf: &[u8]) -> Option<TarKind> {
    let header = buf.get(..RECORD)?;
    let stored = parse_octal(&header[CHKSUM])?;

    let computed: u64 = header
        .iter()
        .enumerate()
        .map(|(i, &b)| if CHKSUM.contains(&i) { b' ' as u64 } else { b as u64 })
        .sum();
    // An all-zero record is an end-of-archive marker, not a header.
    if stored != computed || header[0] == 0 {
        return None;
    }

    let magic = &header[MAGIC];
    Some(if magic == b"ustar  \0" {
        TarKind::Gnu
    } else if magic.starts_with(b"ustar\0") {
        TarKind::Posix
    } else {
        TarKind::V7
    })
}

/// Octal number padded with spaces or NULs.
fn parse_octal(field: &[u8]) -> Option<u64> {
    let digits: Vec<u8> = field
        .iter()
        .copied()
        .skip_while(|b| *b == b' ')
        .take_while(|b| (b'0'..=b'7').contains(b))
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits
        .iter()
        .try_fold(0u64, |acc, d| acc.checked_mul(8)?.checked_add((d - b'0') as u64))
}

/// Build a single-entry header, used by tests across the crate.
#[cfg(test)]
pub(crate) fn sample_header(name: &str, magic: &[u8; 8]) -> Vec<u8> {
    let mut h = vec![0u8; RECORD];
    h[..name.len()].copy_from_slice(name.as_bytes());
    h[100..107].copy_from_slice(b"0000644");
    h[124..135].copy_from_slice(b"00000000005");
    h[156] = b'0';
    h[MAGIC].copy_from_slice(magic);
    let sum: u64 = h
        .iter()
        .enumerate()
        .map(|(i, &b)| if CHKSUM.contains(&i) { b' ' as u64 } else { b as u64 })
        .sum();
    let field = format!("{sum:06o}\0 ");
    h[CHKSUM].copy_from_slice(field.as_bytes());
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_and_gnu_headers() {
        assert_eq!(detect(&sample_header("a.txt", b"ustar\x0000")), Some(TarKind::Posix));
        assert_eq!(detect(&sample_header("a.txt", b"ustar  \0")), Some(TarKind::Gnu));
        assert_eq!(detect(&sample_header("a.txt", &[0; 8])), Some(TarKind::V7));
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut h = sample_header("a.txt", b"ustar\x0000");
        h[0] = b'b';
        assert_eq!(detect(&h), None);
    }

    #[test]
    fn test_short_or_empty_rejected() {
        assert_eq!(detect(&[0u8; 100]), None);
        assert_eq!(detect(&[0u8; 1024]), None);
    }

    #[test]
    fn test_parse_octal() {
        assert_eq!(parse_octal(b"  0644\0 "), Some(0o644));
        assert_eq!(parse_octal(b"\0\0\0\0"), None);
    }
}
