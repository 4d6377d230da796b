//! Magic rule types, the compiled signature database and its errors.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

use bitflags::bitflags;
use regex::bytes::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Magic bytes `RMGC` (little-endian) opening a compiled database.
pub const DB_MAGIC: u32 = 0x4347_4D52;

/// Layout version written by [`crate::codec::write_database`].
pub const DB_VERSION: u32 = 1;

//  Byte order

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Endian {
    Native = 0,
    Little = 1,
    Big = 2,
    /// PDP-11 word order (`melong`, `.m` offsets).
    Middle = 3,
}

impl Endian {
    /// Collapse `Native` into the host byte order.
    pub fn resolve(self) -> Self {
        match self {
            Self::Native if cfg!(target_endian = "big") => Self::Big,
            Self::Native => Self::Little,
            other => other,
        }
    }

    /// Byte order used when a named rule is invoked with `use ^name`.
    pub fn flipped(self) -> Self {
        match self.resolve() {
            Self::Little => Self::Big,
            Self::Big => Self::Little,
            other => other,
        }
    }
}

impl TryFrom<u8> for Endian {
    type Error = RulesError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Native),
            1 => Ok(Self::Little),
            2 => Ok(Self::Big),
            3 => Ok(Self::Middle),
            _ => Err(RulesError::Corrupt(format!("invalid endian tag {v}"))),
        }
    }
}

//  Value type tag

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeKind {
    Byte = 0,
    Short = 1,
    Long = 2,
    Quad = 3,
    Float = 4,
    Double = 5,
    Date = 6,
    LDate = 7,
    QDate = 8,
    QLDate = 9,
    String = 10,
    PString = 11,
    String16 = 12,
    Search = 13,
    Regex = 14,
    Default = 15,
    Clear = 16,
    Name = 17,
    Use = 18,
    Indirect = 19,
}

impl TypeKind {
    /// Width in bytes of a fixed-size value, 0 for everything else.
    pub fn width(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Short => 2,
            Self::Long | Self::Float | Self::Date | Self::LDate => 4,
            Self::Quad | Self::Double | Self::QDate | Self::QLDate => 8,
            _ => 0,
        }
    }

    pub fn is_numeric(self) -> bool {
        self.width() > 0
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    pub fn is_date(self) -> bool {
        matches!(self, Self::Date | Self::LDate | Self::QDate | Self::QLDate)
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            Self::String | Self::PString | Self::String16 | Self::Search | Self::Regex
        )
    }
}

impl TryFrom<u8> for TypeKind {
    type Error = RulesError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::Byte,
            1 => Self::Short,
            2 => Self::Long,
            3 => Self::Quad,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::Date,
            7 => Self::LDate,
            8 => Self::QDate,
            9 => Self::QLDate,
            10 => Self::String,
            11 => Self::PString,
            12 => Self::String16,
            13 => Self::Search,
            14 => Self::Regex,
            15 => Self::Default,
            16 => Self::Clear,
            17 => Self::Name,
            18 => Self::Use,
            19 => Self::Indirect,
            _ => return Err(RulesError::Corrupt(format!("invalid type tag {v}"))),
        })
    }
}

//  Arithmetic on read values and indirect offsets

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArithOp {
    And = 0,
    Or = 1,
    Xor = 2,
    Add = 3,
    Sub = 4,
    Mul = 5,
    Div = 6,
    Mod = 7,
}

impl ArithOp {
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            '&' => Self::And,
            '|' => Self::Or,
            '^' => Self::Xor,
            '+' => Self::Add,
            '-' => Self::Sub,
            '*' => Self::Mul,
            '/' => Self::Div,
            '%' => Self::Mod,
            _ => return None,
        })
    }

    /// Apply the operation; division by zero yields `None`.
    pub fn apply(self, lhs: i64, rhs: i64) -> Option<i64> {
        Some(match self {
            Self::And => lhs & rhs,
            Self::Or => lhs | rhs,
            Self::Xor => lhs ^ rhs,
            Self::Add => lhs.wrapping_add(rhs),
            Self::Sub => lhs.wrapping_sub(rhs),
            Self::Mul => lhs.wrapping_mul(rhs),
            Self::Div => lhs.checked_div(rhs)?,
            Self::Mod => lhs.checked_rem(rhs)?,
        })
    }
}

impl TryFrom<u8> for ArithOp {
    type Error = RulesError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::And,
            1 => Self::Or,
            2 => Self::Xor,
            3 => Self::Add,
            4 => Self::Sub,
            5 => Self::Mul,
            6 => Self::Div,
            7 => Self::Mod,
            _ => return Err(RulesError::Corrupt(format!("invalid operator tag {v}"))),
        })
    }
}

//  String modifiers

bitflags! {
    /// Modifiers written after a string-like type, e.g. `string/cW`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StrFlags: u16 {
        /// `W`: whitespace in the pattern matches one or more in the data.
        const COMPACT_WHITESPACE = 1 << 0;
        /// `w`: whitespace in the pattern matches zero or more in the data.
        const OPTIONAL_WHITESPACE = 1 << 1;
        /// `c`: lower-case pattern letters match either case.
        const IGNORE_LOWERCASE = 1 << 2;
        /// `C`: upper-case pattern letters match either case.
        const IGNORE_UPPERCASE = 1 << 3;
        const TEXT = 1 << 4;
        const BINARY = 1 << 5;
        /// `T`: trim whitespace from the printed value.
        const TRIM = 1 << 6;
        /// `s`: a regex match ends at the start of the match.
        const REGEX_OFFSET_START = 1 << 7;
        /// `l`: the regex range counts lines instead of bytes.
        const LINES = 1 << 8;
        /// `J`: a pstring length includes the length field itself.
        const PSTRING_INCLUSIVE = 1 << 9;
    }
}

impl StrFlags {
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'W' => Self::COMPACT_WHITESPACE,
            'w' => Self::OPTIONAL_WHITESPACE,
            'c' => Self::IGNORE_LOWERCASE,
            'C' => Self::IGNORE_UPPERCASE,
            't' => Self::TEXT,
            'b' => Self::BINARY,
            'T' => Self::TRIM,
            's' => Self::REGEX_OFFSET_START,
            'l' => Self::LINES,
            'J' => Self::PSTRING_INCLUSIVE,
            _ => return None,
        })
    }
}

/// Size of the length prefix of a `pstring`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PStringWidth {
    Byte = 0,
    BeShort = 1,
    LeShort = 2,
    BeLong = 3,
    LeLong = 4,
}

impl PStringWidth {
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'B' => Self::Byte,
            'H' => Self::BeShort,
            'h' => Self::LeShort,
            'L' => Self::BeLong,
            'l' => Self::LeLong,
            _ => return None,
        })
    }

    pub fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::BeShort | Self::LeShort => 2,
            Self::BeLong | Self::LeLong => 4,
        }
    }
}

impl TryFrom<u8> for PStringWidth {
    type Error = RulesError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::Byte,
            1 => Self::BeShort,
            2 => Self::LeShort,
            3 => Self::BeLong,
            4 => Self::LeLong,
            _ => return Err(RulesError::Corrupt(format!("invalid pstring width {v}"))),
        })
    }
}

/// Fully-qualified type of a rule: kind, byte order, signedness and
/// modifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSpec {
    pub kind: TypeKind,
    pub endian: Endian,
    pub unsigned: bool,
    /// Operation applied to the read value before comparison (`long&0xff`).
    pub mask: Option<(ArithOp, i64)>,
    pub flags: StrFlags,
    /// Search window of `search`/`regex` (bytes, or lines with `l`).
    pub range: u32,
    pub pstring: PStringWidth,
}

impl TypeSpec {
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            endian: Endian::Native,
            unsigned: false,
            mask: None,
            flags: StrFlags::empty(),
            range: 0,
            pstring: PStringWidth::Byte,
        }
    }
}

//  Offsets

/// Where a rule reads its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Offset {
    /// `&`: add the end of the parent's match.
    pub relative: bool,
    pub base: OffsetBase,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OffsetBase {
    /// Literal offset; negative values count back from the end of input.
    Direct(i64),
    /// Offset read from the input at detection time.
    Indirect(IndirectOffset),
}

impl Offset {
    pub fn absolute(at: i64) -> Self {
        Self {
            relative: false,
            base: OffsetBase::Direct(at),
        }
    }
}

/// `(at.T op n)`: read a `T` at `at`, combine it with `n`, use the result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndirectOffset {
    pub at: i64,
    /// `(&at…)`: `at` is relative to the parent's match end.
    pub at_relative: bool,
    pub width: IndirectWidth,
    pub signed: bool,
    pub adjust: Option<(ArithOp, i64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndirectWidth {
    Byte = 0,
    LeShort = 1,
    BeShort = 2,
    LeLong = 3,
    BeLong = 4,
    MeLong = 5,
    LeQuad = 6,
    BeQuad = 7,
    /// ID3 "syncsafe" integer, 7 bits per byte.
    LeId3 = 8,
    BeId3 = 9,
}

impl IndirectWidth {
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'b' | 'c' | 'B' | 'C' => Self::Byte,
            's' | 'h' => Self::LeShort,
            'S' | 'H' => Self::BeShort,
            'l' => Self::LeLong,
            'L' => Self::BeLong,
            'm' => Self::MeLong,
            'q' => Self::LeQuad,
            'Q' => Self::BeQuad,
            'i' => Self::LeId3,
            'I' => Self::BeId3,
            _ => return None,
        })
    }

    pub fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::LeShort | Self::BeShort => 2,
            Self::LeLong | Self::BeLong | Self::MeLong | Self::LeId3 | Self::BeId3 => 4,
            Self::LeQuad | Self::BeQuad => 8,
        }
    }
}

impl TryFrom<u8> for IndirectWidth {
    type Error = RulesError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::Byte,
            1 => Self::LeShort,
            2 => Self::BeShort,
            3 => Self::LeLong,
            4 => Self::BeLong,
            5 => Self::MeLong,
            6 => Self::LeQuad,
            7 => Self::BeQuad,
            8 => Self::LeId3,
            9 => Self::BeId3,
            _ => return Err(RulesError::Corrupt(format!("invalid indirect width {v}"))),
        })
    }
}

//  Tests

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compare {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Gt = 3,
    /// `&`: every bit of the operand is set.
    AllSet = 4,
    /// `^`: at least one bit of the operand is clear.
    AnyClear = 5,
}

impl TryFrom<u8> for Compare {
    type Error = RulesError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::Eq,
            1 => Self::Ne,
            2 => Self::Lt,
            3 => Self::Gt,
            4 => Self::AllSet,
            5 => Self::AnyClear,
            _ => return Err(RulesError::Corrupt(format!("invalid comparator tag {v}"))),
        })
    }
}

/// The comparison a rule performs on the value it reads.
#[derive(Debug, Clone)]
pub enum Test {
    /// `x`: matches any readable value.
    Any,
    Int { op: Compare, value: i64 },
    Float { op: Compare, value: f64 },
    Bytes { op: Compare, value: Vec<u8> },
    Regex(RegexTest),
    /// Target of `name` / `use`; `flip` swaps byte order (`use ^name`).
    Name { name: String, flip: bool },
}

/// A regex pattern together with its compiled matcher.
#[derive(Debug, Clone)]
pub struct RegexTest {
    pub pattern: String,
    regex: Regex,
}

impl RegexTest {
    pub fn new(pattern: &str, flags: StrFlags) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(
                flags.intersects(StrFlags::IGNORE_LOWERCASE | StrFlags::IGNORE_UPPERCASE),
            )
            .multi_line(true)
            .unicode(false)
            .build()?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

//  Rules

/// Index range of a rule's children inside the database arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildRange {
    pub start: u32,
    pub len: u32,
}

impl ChildRange {
    pub fn range(self) -> Range<usize> {
        let start = self.start as usize;
        start..start + self.len as usize
    }
}

/// One line of a magic file.
#[derive(Debug, Clone)]
pub struct MagicRule {
    pub level: u8,
    /// Source line, 1-based.
    pub line: u32,
    pub offset: Offset,
    pub ty: TypeSpec,
    pub test: Test,
    pub message: String,
    /// Message started with `\b`: append without a separating space.
    pub no_space: bool,
    pub mime: Option<String>,
    pub ext: Option<String>,
    pub apple: Option<String>,
    pub children: ChildRange,
}

/// Detection family of a top-level rule, disabled by the matching
/// `NO_CHECK_*` flag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Category {
    #[default]
    Generic = 0,
    Compress = 1,
    Tar = 2,
    Apptype = 3,
    Elf = 4,
    Cdf = 5,
    Tokens = 6,
    Text = 7,
    Encoding = 8,
    Csv = 9,
    Json = 10,
}

impl Category {
    pub const ALL: [Category; 11] = [
        Self::Generic,
        Self::Compress,
        Self::Tar,
        Self::Apptype,
        Self::Elf,
        Self::Cdf,
        Self::Tokens,
        Self::Text,
        Self::Encoding,
        Self::Csv,
        Self::Json,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Compress => "compress",
            Self::Tar => "tar",
            Self::Apptype => "apptype",
            Self::Elf => "elf",
            Self::Cdf => "cdf",
            Self::Tokens => "tokens",
            Self::Text => "text",
            Self::Encoding => "encoding",
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ascii" => Some(Self::Text),
            _ => Self::ALL.into_iter().find(|c| c.as_str() == name),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for Category {
    type Error = RulesError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(v as usize)
            .copied()
            .ok_or_else(|| RulesError::Corrupt(format!("invalid category tag {v}")))
    }
}

/// A top-level rule tree.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Arena index of the level-0 rule.
    pub root: u32,
    pub strength: i32,
    pub category: Category,
    /// Position in the original source set; breaks strength ties.
    pub order: u32,
    /// Normalized `offset type test` of the root line.
    pub key: String,
    /// Name of the source file the entry came from.
    pub source: String,
}

//  Database

/// Compiled rule set: an arena of rules plus top-level entries sorted by
/// descending strength, ties in source order.
#[derive(Debug, Clone, Default)]
pub struct SignatureDatabase {
    rules: Vec<MagicRule>,
    entries: Vec<Entry>,
    names: HashMap<String, usize>,
}

impl SignatureDatabase {
    /// Validate arena links, sort entries and index named rules.
    pub fn from_parts(rules: Vec<MagicRule>, mut entries: Vec<Entry>) -> Result<Self, RulesError> {
        for (idx, rule) in rules.iter().enumerate() {
            let range = rule.children.range();
            if rule.children.len > 0 && (range.start <= idx || range.end > rules.len()) {
                return Err(RulesError::Corrupt(format!(
                    "rule {idx} has children {range:?} outside the arena"
                )));
            }
        }
        for entry in &entries {
            if entry.root as usize >= rules.len() {
                return Err(RulesError::Corrupt(format!(
                    "entry root {} outside the arena",
                    entry.root
                )));
            }
        }

        entries.sort_by(|a, b| b.strength.cmp(&a.strength).then(a.order.cmp(&b.order)));

        let mut names = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            let root = &rules[entry.root as usize];
            if let (TypeKind::Name, Test::Name { name, .. }) = (root.ty.kind, &root.test) {
                names.entry(name.clone()).or_insert(idx);
            }
        }

        Ok(Self {
            rules,
            entries,
            names,
        })
    }

    pub fn rules(&self) -> &[MagicRule] {
        &self.rules
    }

    /// All entries in evaluation order, named subroutines included.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn root(&self, entry: &Entry) -> &MagicRule {
        &self.rules[entry.root as usize]
    }

    pub fn children(&self, rule: &MagicRule) -> &[MagicRule] {
        &self.rules[rule.children.range()]
    }

    /// Entries that may match on their own, in evaluation order.
    pub fn candidates(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.entries
            .iter()
            .filter(|e| self.root(e).ty.kind != TypeKind::Name)
    }

    /// Named subroutine invoked by `use`.
    pub fn named(&self, name: &str) -> Option<&Entry> {
        self.names.get(name).map(|&idx| &self.entries[idx])
    }

    /// Union several databases. Source order follows the argument order;
    /// among entries sharing an identity key, those that declare a MIME type
    /// all take the one declared last.
    pub fn merge(dbs: impl IntoIterator<Item = SignatureDatabase>) -> Result<Self, RulesError> {
        let mut rules: Vec<MagicRule> = Vec::new();
        let mut entries: Vec<Entry> = Vec::new();

        for db in dbs {
            let rule_base = rules.len() as u32;
            let order_base = entries.len() as u32;

            let mut db_entries = db.entries;
            db_entries.sort_by_key(|e| e.order);

            rules.extend(db.rules.into_iter().map(|mut r| {
                if r.children.len > 0 {
                    r.children.start += rule_base;
                }
                r
            }));
            entries.extend(db_entries.into_iter().enumerate().map(|(i, mut e)| {
                e.root += rule_base;
                e.order = order_base + i as u32;
                e
            }));
        }

        // Last-wins MIME association per identity key.
        let mut mime_by_key: HashMap<String, String> = HashMap::new();
        for entry in &entries {
            if let Some(mime) = &rules[entry.root as usize].mime {
                mime_by_key.insert(entry.key.clone(), mime.clone());
            }
        }
        for entry in &entries {
            let root = &mut rules[entry.root as usize];
            if let (Some(current), Some(mime)) = (&mut root.mime, mime_by_key.get(&entry.key)) {
                current.clone_from(mime);
            }
        }

        Self::from_parts(rules, entries)
    }

    /// Counts and a strength-ordered listing, as reported by `list`.
    pub fn stats(&self) -> DatabaseStats {
        let mut categories = BTreeMap::new();
        let mut listing = Vec::with_capacity(self.entries.len());
        let mut named = 0;

        for entry in &self.entries {
            let root = self.root(entry);
            if root.ty.kind == TypeKind::Name {
                named += 1;
                continue;
            }
            *categories.entry(entry.category.to_string()).or_insert(0) += 1;
            listing.push(ListedEntry {
                strength: entry.strength,
                category: entry.category,
                description: self.first_message(root).unwrap_or_default(),
                mime: root.mime.clone(),
                source: entry.source.clone(),
                line: root.line,
            });
        }

        DatabaseStats {
            entries: self.entries.len() - named,
            rules: self.rules.len(),
            named,
            categories,
            listing,
        }
    }

    fn first_message(&self, rule: &MagicRule) -> Option<String> {
        if !rule.message.is_empty() {
            return Some(rule.message.clone());
        }
        self.children(rule)
            .iter()
            .find_map(|child| self.first_message(child))
    }
}

/// Summary of a compiled rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub entries: usize,
    pub rules: usize,
    pub named: usize,
    pub categories: BTreeMap<String, usize>,
    pub listing: Vec<ListedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedEntry {
    pub strength: i32,
    pub category: Category,
    pub description: String,
    pub mime: Option<String>,
    pub source: String,
    pub line: u32,
}

//  Error

#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{file}, {line}: {message}")]
    Syntax {
        file: String,
        line: usize,
        message: String,
    },

    #[error("Not a compiled magic database (magic 0x{0:08X})")]
    BadMagic(u32),

    #[error("Incompatible database version {found} (expected {expected})")]
    IncompatibleVersion { found: u32, expected: u32 },

    #[error("Truncated database")]
    Truncated,

    #[error("Corrupt database: {0}")]
    Corrupt(String),
}

impl RulesError {
    /// True for failures that mean "this is not a database we can read".
    pub fn is_incompatible(&self) -> bool {
        matches!(
            self,
            Self::BadMagic(_) | Self::IncompatibleVersion { .. } | Self::Truncated | Self::Corrupt(_)
        )
    }
}
