//! Detection pipeline over a loaded database.
//!
//! A buffer is tried against, in order: gzip unwrapping (with `COMPRESS`),
//! tar headers, soft magic rules, the text classifier, and finally the
//! `data` fallback. The first stage that produces output in the requested
//! [`OutputMode`] wins unless `CONTINUE` asks for every result.

mod compress;
mod eval;
mod format;
mod tar;
mod text;

use std::fmt;

use magic_rules::SignatureDatabase;
use serde::Serialize;
use tracing::debug;

use crate::flags::{MagicFlags, OutputMode};
use crate::params::Params;
use eval::{Match, SoftMagic};

const OCTET_STREAM: &str = "application/octet-stream";
const BINARY_CHARSET: &str = "binary";
const UNKNOWN_APPLE: &str = "UNKNUNKN";
const UNKNOWN_EXT: &str = "???";
const CONTINUE_SEPARATOR: &str = "\n- ";

/// Outcome of a detection, tagged with the kind of string it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Detection {
    Description(String),
    /// A MIME type, a charset, or both.
    Mime(String),
    Extension(String),
    Apple(String),
}

impl Detection {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Description(s) | Self::Mime(s) | Self::Extension(s) | Self::Apple(s) => s,
        }
    }

    pub fn into_string(self) -> String {
        match self {
            Self::Description(s) | Self::Mime(s) | Self::Extension(s) | Self::Apple(s) => s,
        }
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless evaluator borrowing a database and its settings.
pub struct Engine<'a> {
    db: &'a SignatureDatabase,
    flags: MagicFlags,
    params: &'a Params,
}

impl<'a> Engine<'a> {
    pub fn new(db: &'a SignatureDatabase, flags: MagicFlags, params: &'a Params) -> Self {
        Self { db, flags, params }
    }

    /// Classify `input`. Only the first `bytes_max` bytes are examined.
    pub fn detect(&self, input: &[u8]) -> Detection {
        let buf = &input[..input.len().min(self.params.bytes_max)];
        let mode = self.flags.output_mode();
        if buf.is_empty() {
            return empty(mode);
        }

        let (found, charset) = self.classify_wrapped(buf, mode);
        render(&found, mode, charset)
    }

    fn has(&self, flag: MagicFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Classify, looking through a gzip layer when asked to. Returns the
    /// results and the charset of the content they describe.
    fn classify_wrapped(&self, buf: &[u8], mode: OutputMode) -> (Vec<Match>, &'static str) {
        if self.has(MagicFlags::COMPRESS) && !self.has(MagicFlags::NO_CHECK_COMPRESS) {
            if let Some(inner) = compress::gunzip(buf, self.params.bytes_max) {
                debug!(packed = buf.len(), unpacked = inner.len(), "looking inside gzip data");
                let outer = self.classify(buf, mode);
                let (mut found, charset) = if inner.is_empty() {
                    (vec![Match::new("empty", "application/x-empty")], BINARY_CHARSET)
                } else {
                    (self.classify(&inner, mode), self.charset(&inner))
                };
                if let (Some(first), Some(wrapper)) = (found.first_mut(), outer.first()) {
                    first.description = format!("{} ({})", first.description, wrapper.description);
                }
                return (found, charset);
            }
        }
        (self.classify(buf, mode), self.charset(buf))
    }

    fn classify(&self, buf: &[u8], mode: OutputMode) -> Vec<Match> {
        let keep_going = self.has(MagicFlags::CONTINUE);
        let mut found = Vec::new();

        if !self.has(MagicFlags::NO_CHECK_TAR) {
            if let Some(kind) = tar::detect(buf) {
                let mut m = Match::new(kind.description(), "application/x-tar");
                m.ext = Some("tar".to_string());
                found.push(m);
                if !keep_going {
                    return found;
                }
            }
        }

        if !self.has(MagicFlags::NO_CHECK_SOFT) {
            found.extend(SoftMagic::new(self.db, self.flags, self.params).run(buf));
            if !found.is_empty() && !keep_going {
                return found;
            }
        }

        if !self.has(MagicFlags::NO_CHECK_TEXT) && !self.has(MagicFlags::NO_CHECK_ENCODING) {
            let window = &buf[..buf.len().min(self.params.encoding_max)];
            let tokens = !self.has(MagicFlags::NO_CHECK_TOKENS);
            if let Some(t) = text::classify(window, tokens) {
                found.push(Match::new(&t.description, t.mime));
            }
        }

        if found.is_empty() {
            found.push(Match::new("data", OCTET_STREAM));
        }
        if mode.wants_mime() {
            found.dedup_by(|a, b| a.mime == b.mime);
        }
        found
    }

    fn charset(&self, buf: &[u8]) -> &'static str {
        if self.has(MagicFlags::NO_CHECK_ENCODING) {
            return BINARY_CHARSET;
        }
        let window = &buf[..buf.len().min(self.params.encoding_max)];
        text::detect_encoding(window).map_or(BINARY_CHARSET, text::Encoding::charset)
    }
}

/// Detection for a path with no content to inspect, such as a directory
/// or an unfollowed symbolic link.
pub(crate) fn special(flags: MagicFlags, description: &str, mime: &str) -> Detection {
    render(&[Match::new(description, mime)], flags.output_mode(), BINARY_CHARSET)
}

fn empty(mode: OutputMode) -> Detection {
    match mode {
        OutputMode::Description => Detection::Description("empty".into()),
        OutputMode::Mime => Detection::Mime(format!("application/x-empty; charset={BINARY_CHARSET}")),
        OutputMode::MimeType => Detection::Mime("application/x-empty".into()),
        OutputMode::MimeEncoding => Detection::Mime(BINARY_CHARSET.into()),
        OutputMode::Apple => Detection::Apple(UNKNOWN_APPLE.into()),
        OutputMode::Extension => Detection::Extension(UNKNOWN_EXT.into()),
    }
}

fn render(found: &[Match], mode: OutputMode, charset: &str) -> Detection {
    if mode == OutputMode::MimeEncoding {
        return Detection::Mime(charset.to_string());
    }
    let parts: Vec<String> = found
        .iter()
        .map(|m| {
            let mime = m.mime.as_deref().unwrap_or(OCTET_STREAM);
            match mode {
                OutputMode::Description => m.description.clone(),
                OutputMode::Mime => format!("{mime}; charset={charset}"),
                OutputMode::MimeType => mime.to_string(),
                OutputMode::MimeEncoding => charset.to_string(),
                OutputMode::Apple => m.apple.as_deref().unwrap_or(UNKNOWN_APPLE).to_string(),
                OutputMode::Extension => m.ext.as_deref().unwrap_or(UNKNOWN_EXT).to_string(),
            }
        })
        .collect();
    let text = parts.join(CONTINUE_SEPARATOR);
    match mode {
        OutputMode::Description => Detection::Description(text),
        OutputMode::Mime | OutputMode::MimeType | OutputMode::MimeEncoding => Detection::Mime(text),
        OutputMode::Apple => Detection::Apple(text),
        OutputMode::Extension => Detection::Extension(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use magic_rules::compile_str;
    use std::io::Write;

    const RULES: &str = "\
0\tstring\t%PDF-\tPDF document
!:mime\tapplication/pdf
!:ext\tpdf
>5\tbyte\tx\t\\b, version %c
>7\tbyte\tx\t\\b.%c
0\tstring\t\\x89PNG\\r\\n\\x1a\\n\tPNG image data
!:mime\timage/png
!:apple\t????PNGf
!:ext\tpng
0\tstring\t\\x1f\\x8b\tgzip compressed data
!:mime\tapplication/gzip
!:category\tcompress
";

    fn detect(input: &[u8], flags: MagicFlags) -> String {
        let db = compile_str("rules", RULES).unwrap();
        let params = Params::default();
        Engine::new(&db, flags, &params).detect(input).into_string()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_soft_magic_modes() {
        let pdf = b"%PDF-1.7\n%\x00\x01\x02\n";
        assert_eq!(detect(pdf, MagicFlags::NONE), "PDF document, version 1.7");
        assert_eq!(detect(pdf, MagicFlags::MIME_TYPE), "application/pdf");
        assert_eq!(detect(pdf, MagicFlags::MIME), "application/pdf; charset=binary");
        assert_eq!(detect(pdf, MagicFlags::EXTENSION), "pdf");
        assert_eq!(detect(pdf, MagicFlags::APPLE), "UNKNUNKN");

        let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
        assert_eq!(detect(png, MagicFlags::APPLE), "????PNGf");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(detect(b"", MagicFlags::NONE), "empty");
        assert_eq!(detect(b"", MagicFlags::MIME_TYPE), "application/x-empty");
        assert_eq!(detect(b"", MagicFlags::MIME), "application/x-empty; charset=binary");
        assert_eq!(detect(b"", MagicFlags::MIME_ENCODING), "binary");
    }

    #[test]
    fn test_text_and_data_fallbacks() {
        assert_eq!(detect(b"hello world\n", MagicFlags::NONE), "ASCII text");
        assert_eq!(detect(b"hello world\n", MagicFlags::MIME), "text/plain; charset=us-ascii");
        assert_eq!(detect(b"hello world\n", MagicFlags::MIME_ENCODING), "us-ascii");
        assert_eq!(detect(b"\x00\x01\x02\x03", MagicFlags::NONE), "data");
        assert_eq!(detect(b"\x00\x01\x02\x03", MagicFlags::MIME_TYPE), OCTET_STREAM);
        assert_eq!(detect(b"hello world\n", MagicFlags::NO_CHECK_TEXT), "data");
        assert_eq!(
            detect(b"hello world\n", MagicFlags::NO_CHECK_ENCODING | MagicFlags::MIME),
            "application/octet-stream; charset=binary"
        );
    }

    #[test]
    fn test_tar_detected_before_soft_magic() {
        let mut header = tar::sample_header("notes.txt", b"ustar\x0000");
        header.extend_from_slice(&[0u8; 512]);
        assert_eq!(detect(&header, MagicFlags::NONE), "POSIX tar archive");
        assert_eq!(detect(&header, MagicFlags::MIME_TYPE), "application/x-tar");
        assert_eq!(detect(&header, MagicFlags::EXTENSION), "tar");
        assert_eq!(detect(&header, MagicFlags::NO_CHECK_TAR), "data");
    }

    #[test]
    fn test_gzip_without_and_with_decompression() {
        let packed = gzip(b"%PDF-1.4 body");
        assert_eq!(detect(&packed, MagicFlags::NONE), "gzip compressed data");
        assert_eq!(
            detect(&packed, MagicFlags::COMPRESS),
            "PDF document, version 1.4 (gzip compressed data)"
        );
        assert_eq!(
            detect(&packed, MagicFlags::COMPRESS | MagicFlags::MIME_TYPE),
            "application/pdf"
        );
        assert_eq!(
            detect(&packed, MagicFlags::COMPRESS | MagicFlags::NO_CHECK_COMPRESS),
            "data"
        );
    }

    #[test]
    fn test_two_byte_gzip_magic() {
        let buf = [0x1f, 0x8b];
        assert_eq!(detect(&buf, MagicFlags::NONE), "gzip compressed data");
        assert_eq!(detect(&buf, MagicFlags::NO_CHECK_COMPRESS), "data");
    }

    #[test]
    fn test_bytes_max_truncates_input() {
        let db = compile_str("rules", "8 string TAIL tail\n").unwrap();
        let mut params = Params::default();
        let input = b"\0\0\0\0\0\0\0\0TAIL";
        assert_eq!(Engine::new(&db, MagicFlags::NONE, &params).detect(input).as_str(), "tail");
        params.bytes_max = 8;
        assert_eq!(Engine::new(&db, MagicFlags::NONE, &params).detect(input).as_str(), "data");
    }

    #[test]
    fn test_continue_joins_results() {
        let out = detect(b"%PDF-1.4\n", MagicFlags::CONTINUE);
        assert_eq!(out, "PDF document, version 1.4\n- ASCII text");
    }

    #[test]
    fn test_continue_inside_gzip_keeps_every_result() {
        let packed = gzip(b"%PDF-1.4\n");
        assert_eq!(
            detect(&packed, MagicFlags::COMPRESS | MagicFlags::CONTINUE),
            "PDF document, version 1.4 (gzip compressed data)\n- ASCII text"
        );
    }

    #[test]
    fn test_detection_tags() {
        let db = compile_str("rules", RULES).unwrap();
        let params = Params::default();
        let d = Engine::new(&db, MagicFlags::MIME_TYPE, &params).detect(b"%PDF-1.0");
        assert_eq!(d, Detection::Mime("application/pdf".into()));
        assert_eq!(
            serde_json::to_string(&d).unwrap(),
            r#"{"kind":"mime","value":"application/pdf"}"#
        );
    }
}
