//! Character-set guessing and plain-text descriptions.

/// Lines longer than this are reported as "very long".
const MAX_LINE_LEN: usize = 300;

/// Lines scanned for language tokens.
const TOKEN_LINES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Encoding {
    Ascii,
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
    Iso8859,
    ExtendedAscii,
}

impl Encoding {
    fn describe(self) -> &'static str {
        match self {
            Self::Ascii => "ASCII",
            Self::Utf8 => "UTF-8 Unicode",
            Self::Utf8Bom => "UTF-8 Unicode (with BOM)",
            Self::Utf16Le => "Little-endian UTF-16 Unicode",
            Self::Utf16Be => "Big-endian UTF-16 Unicode",
            Self::Iso8859 => "ISO-8859",
            Self::ExtendedAscii => "Non-ISO extended-ASCII",
        }
    }

    pub(crate) fn charset(self) -> &'static str {
        match self {
            Self::Ascii => "us-ascii",
            Self::Utf8 | Self::Utf8Bom => "utf-8",
            Self::Utf16Le => "utf-16le",
            Self::Utf16Be => "utf-16be",
            Self::Iso8859 => "iso-8859-1",
            Self::ExtendedAscii => "unknown-8bit",
        }
    }
}

/// A plain-text classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TextMatch {
    pub description: String,
    pub mime: &'static str,
    pub encoding: Encoding,
}

/// BEL through CR, ESC and printable ASCII.
fn is_text_byte(b: u8) -> bool {
    matches!(b, 0x07..=0x0d | 0x1b | 0x20..=0x7e)
}

/// Guess the character encoding of `buf`, `None` for binary data.
pub(crate) fn detect_encoding(buf: &[u8]) -> Option<Encoding> {
    if buf.is_empty() {
        return None;
    }
    if let Some(rest) = buf.strip_prefix(b"\xef\xbb\xbf") {
        return looks_utf8(rest).then_some(Encoding::Utf8Bom);
    }
    if let Some(rest) = buf.strip_prefix(b"\xff\xfe") {
        return looks_utf16(rest, false).then_some(Encoding::Utf16Le);
    }
    if let Some(rest) = buf.strip_prefix(b"\xfe\xff") {
        return looks_utf16(rest, true).then_some(Encoding::Utf16Be);
    }
    if buf.iter().all(|&b| is_text_byte(b)) {
        return Some(Encoding::Ascii);
    }
    if looks_utf8(buf) {
        return Some(Encoding::Utf8);
    }
    if buf.iter().all(|&b| is_text_byte(b) || b >= 0xa0) {
        return Some(Encoding::Iso8859);
    }
    if buf.iter().all(|&b| is_text_byte(b) || b >= 0x80) {
        return Some(Encoding::ExtendedAscii);
    }
    None
}

/// Valid UTF-8 with no control characters. A sequence cut off at the end
/// of the window is tolerated.
fn looks_utf8(buf: &[u8]) -> bool {
    let valid = match std::str::from_utf8(buf) {
        Ok(s) => s,
        Err(e) if e.error_len().is_none() => {
            match std::str::from_utf8(&buf[..e.valid_up_to()]) {
                Ok(s) => s,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };
    valid
        .chars()
        .all(|c| !c.is_ascii() || is_text_byte(c as u8))
}

fn looks_utf16(buf: &[u8], big_endian: bool) -> bool {
    let units = buf.chunks_exact(2).map(|p| {
        if big_endian {
            u16::from_be_bytes([p[0], p[1]])
        } else {
            u16::from_le_bytes([p[0], p[1]])
        }
    });
    char::decode_utf16(units).all(|r| match r {
        Ok(c) if c.is_ascii() => is_text_byte(c as u8),
        Ok(c) => !c.is_control(),
        Err(_) => false,
    })
}

/// Classify `buf` as text. `tokens` enables source-language hints.
pub(crate) fn classify(buf: &[u8], tokens: bool) -> Option<TextMatch> {
    let encoding = detect_encoding(buf)?;

    let mut description = String::new();
    let mut mime = "text/plain";
    if tokens && matches!(encoding, Encoding::Ascii | Encoding::Utf8 | Encoding::Utf8Bom) {
        if let Some((lang, lang_mime)) = language_hint(buf) {
            description.push_str(lang);
            description.push_str(", ");
            mime = lang_mime;
        }
    }
    description.push_str(encoding.describe());
    description.push_str(" text");

    // Line structure is only meaningful for byte-oriented encodings.
    if !matches!(encoding, Encoding::Utf16Le | Encoding::Utf16Be) {
        description.push_str(&line_notes(buf));
    }

    Some(TextMatch {
        description,
        mime,
        encoding,
    })
}

fn line_notes(buf: &[u8]) -> String {
    let (mut crlf, mut cr, mut lf) = (0usize, 0usize, 0usize);
    let mut longest = 0usize;
    let mut current = 0usize;
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'\r' if buf.get(i + 1) == Some(&b'\n') => {
                crlf += 1;
                i += 1;
                longest = longest.max(current);
                current = 0;
            }
            b'\r' => {
                cr += 1;
                longest = longest.max(current);
                current = 0;
            }
            b'\n' => {
                lf += 1;
                longest = longest.max(current);
                current = 0;
            }
            _ => current += 1,
        }
        i += 1;
    }
    longest = longest.max(current);

    let mut notes = String::new();
    if longest > MAX_LINE_LEN {
        notes.push_str(", with very long lines");
    }
    let terminators: Vec<&str> = [(crlf, "CRLF"), (cr, "CR"), (lf, "LF")]
        .into_iter()
        .filter(|(n, _)| *n > 0)
        .map(|(_, name)| name)
        .collect();
    match terminators.as_slice() {
        [] => notes.push_str(", with no line terminators"),
        ["LF"] => {}
        names => {
            notes.push_str(", with ");
            notes.push_str(&names.join(", "));
            notes.push_str(" line terminators");
        }
    }
    notes
}

/// First-word tokens that identify a source language.
fn language_hint(buf: &[u8]) -> Option<(&'static str, &'static str)> {
    const TOKENS: &[(&str, &str, &str)] = &[
        ("#include", "C source", "text/x-c"),
        ("#define", "C source", "text/x-c"),
        ("#ifdef", "C source", "text/x-c"),
        ("#ifndef", "C source", "text/x-c"),
        ("#pragma", "C source", "text/x-c"),
        ("msgid", "GNU gettext message catalogue", "text/x-po"),
        ("msgstr", "GNU gettext message catalogue", "text/x-po"),
        ("dnl", "M4 macro processor script", "text/x-m4"),
    ];

    for line in buf.split(|&b| b == b'\n').take(TOKEN_LINES) {
        let line = line.trim_ascii_start();
        let word_end = line
            .iter()
            .position(|b| b.is_ascii_whitespace())
            .unwrap_or(line.len());
        let word = &line[..word_end];
        if let Some((_, lang, mime)) = TOKENS.iter().find(|(t, _, _)| t.as_bytes() == word) {
            return Some((*lang, *mime));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(buf: &[u8]) -> Option<String> {
        classify(buf, true).map(|m| m.description)
    }

    #[test]
    fn test_ascii() {
        assert_eq!(describe(b"hello\nworld\n").as_deref(), Some("ASCII text"));
        assert_eq!(
            classify(b"hello\n", true).unwrap().encoding.charset(),
            "us-ascii"
        );
    }

    #[test]
    fn test_line_terminators() {
        assert_eq!(
            describe(b"a\r\nb\r\n").as_deref(),
            Some("ASCII text, with CRLF line terminators")
        );
        assert_eq!(
            describe(b"a\rb\r").as_deref(),
            Some("ASCII text, with CR line terminators")
        );
        assert_eq!(
            describe(b"no newline").as_deref(),
            Some("ASCII text, with no line terminators")
        );
        assert_eq!(
            describe(b"a\r\nb\n").as_deref(),
            Some("ASCII text, with CRLF, LF line terminators")
        );
        let long = [b'x'; 400];
        assert_eq!(
            describe(&long).as_deref(),
            Some("ASCII text, with very long lines, with no line terminators")
        );
    }

    #[test]
    fn test_unicode_encodings() {
        assert_eq!(
            describe("caf\u{e9}\n".as_bytes()).as_deref(),
            Some("UTF-8 Unicode text")
        );
        assert_eq!(
            describe(b"\xef\xbb\xbfhi\n").as_deref(),
            Some("UTF-8 Unicode (with BOM) text")
        );
        let le: Vec<u8> = b"\xff\xfeh\0i\0".to_vec();
        let m = classify(&le, true).unwrap();
        assert_eq!(m.description, "Little-endian UTF-16 Unicode text");
        assert_eq!(m.encoding.charset(), "utf-16le");
        let be: Vec<u8> = b"\xfe\xff\0h\0i".to_vec();
        assert_eq!(
            describe(&be).as_deref(),
            Some("Big-endian UTF-16 Unicode text")
        );
    }

    #[test]
    fn test_eight_bit_encodings() {
        assert_eq!(
            describe(b"caf\xe9\n").as_deref(),
            Some("ISO-8859 text")
        );
        assert_eq!(
            describe(b"caf\x85\n").as_deref(),
            Some("Non-ISO extended-ASCII text")
        );
    }

    #[test]
    fn test_binary_is_not_text() {
        assert_eq!(describe(b"\x1f\x8b"), None);
        assert_eq!(describe(b"abc\0def"), None);
        assert_eq!(detect_encoding(b""), None);
    }

    #[test]
    fn test_language_tokens() {
        let m = classify(b"/* x */\n#include <stdio.h>\nint main;\n", true).unwrap();
        assert_eq!(m.description, "C source, ASCII text");
        assert_eq!(m.mime, "text/x-c");

        let m = classify(b"#include <stdio.h>\n", false).unwrap();
        assert_eq!(m.description, "ASCII text");
        assert_eq!(m.mime, "text/plain");

        let m = classify(b"msgid \"\"\nmsgstr \"\"\n", true).unwrap();
        assert_eq!(m.mime, "text/x-po");
    }

    #[test]
    fn test_truncated_utf8_tail_tolerated() {
        let mut buf = "h\u{e9}llo".as_bytes().to_vec();
        buf.extend_from_slice(&[0xe2, 0x82]);
        assert_eq!(detect_encoding(&buf), Some(Encoding::Utf8));
    }
}
