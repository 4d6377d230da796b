//! Detection flags.
//!
//! Bit values match the classic libmagic constants so raw integers coming
//! from other callers keep their meaning.

use bitflags::bitflags;
use magic_rules::Category;

use crate::error::{MagicError, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MagicFlags: u32 {
        /// Trace rule evaluation through `tracing`.
        const DEBUG = 0x0000001;
        /// Follow symbolic links.
        const SYMLINK = 0x0000002;
        /// Look inside compressed files.
        const COMPRESS = 0x0000004;
        /// Read the content of device files.
        const DEVICES = 0x0000008;
        const MIME_TYPE = 0x0000010;
        /// Report every matching entry, not just the first.
        const CONTINUE = 0x0000020;
        /// Lint rule sources while compiling.
        const CHECK = 0x0000040;
        /// Restore the access time of inspected files.
        const PRESERVE_ATIME = 0x0000080;
        /// Do not escape unprintable bytes in output.
        const RAW = 0x0000100;
        const ERROR = 0x0000200;
        const MIME_ENCODING = 0x0000400;
        const MIME = Self::MIME_TYPE.bits() | Self::MIME_ENCODING.bits();
        const APPLE = 0x0000800;
        const NO_CHECK_COMPRESS = 0x0001000;
        const NO_CHECK_TAR = 0x0002000;
        const NO_CHECK_SOFT = 0x0004000;
        const NO_CHECK_APPTYPE = 0x0008000;
        const NO_CHECK_ELF = 0x0010000;
        const NO_CHECK_TEXT = 0x0020000;
        const NO_CHECK_CDF = 0x0040000;
        const NO_CHECK_CSV = 0x0080000;
        const NO_CHECK_TOKENS = 0x0100000;
        const NO_CHECK_ENCODING = 0x0200000;
        const NO_CHECK_JSON = 0x0400000;
        const EXTENSION = 0x1000000;
    }
}

impl MagicFlags {
    pub const NONE: Self = Self::empty();
    pub const NO_CHECK_ASCII: Self = Self::NO_CHECK_TEXT;
    /// Accepted for compatibility; has no effect.
    pub const NO_CHECK_FORTRAN: Self = Self::empty();
    /// Accepted for compatibility; has no effect.
    pub const NO_CHECK_TROFF: Self = Self::empty();

    /// Validate a raw flag word.
    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::from_bits(raw).ok_or(MagicError::InvalidFlags(raw))
    }

    /// Flag that disables rule entries of `category`, if any.
    pub fn suppressor(category: Category) -> Self {
        match category {
            Category::Generic => Self::empty(),
            Category::Compress => Self::NO_CHECK_COMPRESS,
            Category::Tar => Self::NO_CHECK_TAR,
            Category::Apptype => Self::NO_CHECK_APPTYPE,
            Category::Elf => Self::NO_CHECK_ELF,
            Category::Cdf => Self::NO_CHECK_CDF,
            Category::Tokens => Self::NO_CHECK_TOKENS,
            Category::Text => Self::NO_CHECK_TEXT,
            Category::Encoding => Self::NO_CHECK_ENCODING,
            Category::Csv => Self::NO_CHECK_CSV,
            Category::Json => Self::NO_CHECK_JSON,
        }
    }

    pub fn suppresses(self, category: Category) -> bool {
        let flag = Self::suppressor(category);
        !flag.is_empty() && self.contains(flag)
    }

    pub fn output_mode(self) -> OutputMode {
        if self.contains(Self::MIME) {
            OutputMode::Mime
        } else if self.contains(Self::MIME_TYPE) {
            OutputMode::MimeType
        } else if self.contains(Self::MIME_ENCODING) {
            OutputMode::MimeEncoding
        } else if self.contains(Self::APPLE) {
            OutputMode::Apple
        } else if self.contains(Self::EXTENSION) {
            OutputMode::Extension
        } else {
            OutputMode::Description
        }
    }

    /// Parse a category name as accepted by `--exclude`.
    pub fn from_exclude(name: &str) -> Option<Self> {
        match name {
            "soft" => Some(Self::NO_CHECK_SOFT),
            // Obsolete tests kept for command-line compatibility.
            "fortran" | "troff" => Some(Self::empty()),
            other => Category::from_name(other)
                .map(Self::suppressor)
                .filter(|f| !f.is_empty()),
        }
    }
}

/// What kind of string a detection produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Description,
    /// `type/subtype; charset=...`
    Mime,
    MimeType,
    MimeEncoding,
    Apple,
    Extension,
}

impl OutputMode {
    pub fn wants_mime(self) -> bool {
        matches!(self, Self::Mime | Self::MimeType | Self::MimeEncoding)
    }
}
