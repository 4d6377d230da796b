//! Soft magic: evaluation of compiled rule trees against a buffer.

use std::cmp::Ordering;

use magic_rules::types::*;
use memchr::{memchr_iter, memmem};
use tracing::{debug, trace};

use super::format::{Value, format_date, format_message};
use crate::flags::{MagicFlags, OutputMode};
use crate::params::Params;

/// Longest string value substituted into a message.
const MAX_STRING_VALUE: usize = 64;

/// Output gathered along the matched path of one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Match {
    pub description: String,
    pub mime: Option<String>,
    pub ext: Option<String>,
    pub apple: Option<String>,
}

impl Match {
    pub(crate) fn new(description: &str, mime: &str) -> Self {
        Self {
            description: description.to_string(),
            mime: Some(mime.to_string()),
            ..Default::default()
        }
    }

    fn append(&mut self, text: &str, no_space: bool) {
        if text.is_empty() {
            return;
        }
        if !no_space && !self.description.is_empty() {
            self.description.push(' ');
        }
        self.description.push_str(text);
    }

    /// Whether this match yields anything in `mode`.
    pub(crate) fn has_output(&self, mode: OutputMode) -> bool {
        match mode {
            OutputMode::Description => !self.description.trim().is_empty(),
            OutputMode::Mime | OutputMode::MimeType | OutputMode::MimeEncoding => {
                self.mime.is_some()
            }
            OutputMode::Apple => self.apple.is_some(),
            OutputMode::Extension => self.ext.is_some(),
        }
    }
}

/// Evaluation context inherited by children.
#[derive(Debug, Clone, Copy)]
struct Frame {
    /// Added to absolute offsets; the call offset inside `use`.
    base: usize,
    /// Swap byte order of endian-specific reads (`use ^name`).
    flip: bool,
    name_depth: usize,
    indir_depth: usize,
}

struct Hit {
    end: usize,
    value: Value,
}

pub(crate) struct SoftMagic<'a> {
    db: &'a SignatureDatabase,
    flags: MagicFlags,
    params: &'a Params,
}

impl<'a> SoftMagic<'a> {
    pub(crate) fn new(db: &'a SignatureDatabase, flags: MagicFlags, params: &'a Params) -> Self {
        Self { db, flags, params }
    }

    /// Matches in evaluation order: the first entry with output for the
    /// current mode, or all of them under `CONTINUE`.
    pub(crate) fn run(&self, buf: &[u8]) -> Vec<Match> {
        self.run_at(buf, 0)
    }

    fn run_at(&self, buf: &[u8], indir_depth: usize) -> Vec<Match> {
        let mode = self.flags.output_mode();
        let mut found = Vec::new();
        for entry in self.db.candidates() {
            if self.flags.suppresses(entry.category) {
                continue;
            }
            let Some(mut m) = self.eval_entry(buf, entry, indir_depth) else {
                continue;
            };
            if !m.has_output(mode) {
                continue;
            }
            let trimmed = m.description.trim_end().len();
            m.description.truncate(trimmed);
            if self.tracing() {
                trace!(source = %entry.source, strength = entry.strength, description = %m.description, "entry matched");
            }
            found.push(m);
            if !self.flags.contains(MagicFlags::CONTINUE) {
                break;
            }
        }
        found
    }

    fn tracing(&self) -> bool {
        self.flags.contains(MagicFlags::DEBUG)
    }

    fn eval_entry(&self, buf: &[u8], entry: &Entry, indir_depth: usize) -> Option<Match> {
        let frame = Frame {
            base: 0,
            flip: false,
            name_depth: 0,
            indir_depth,
        };
        let mut m = Match::default();
        self.eval_rule(buf, self.db.root(entry), frame, 0, false, &mut m)?;
        Some(m)
    }

    fn eval_children(&self, buf: &[u8], parent: &MagicRule, frame: Frame, parent_end: usize, m: &mut Match) {
        let mut sibling_matched = false;
        for child in self.db.children(parent) {
            if child.ty.kind == TypeKind::Clear {
                sibling_matched = false;
                continue;
            }
            if self
                .eval_rule(buf, child, frame, parent_end, sibling_matched, m)
                .is_some()
            {
                sibling_matched = true;
            }
        }
    }

    /// Test one rule and, when it matches, print it and descend into its
    /// children. Returns the end offset of the match.
    fn eval_rule(
        &self,
        buf: &[u8],
        rule: &MagicRule,
        frame: Frame,
        parent_end: usize,
        sibling_matched: bool,
        m: &mut Match,
    ) -> Option<usize> {
        let Some(off) = self.resolve_offset(buf, &rule.offset, frame, parent_end) else {
            if self.tracing() {
                trace!(line = rule.line, level = rule.level, "offset out of range");
            }
            return None;
        };

        let hit = match rule.ty.kind {
            TypeKind::Default if sibling_matched => None,
            TypeKind::Default | TypeKind::Clear | TypeKind::Name => Some(Hit {
                end: off,
                value: Value::None,
            }),
            TypeKind::Use => return self.eval_use(buf, rule, off, frame, m),
            TypeKind::Indirect => return self.eval_indirect(buf, rule, off, frame, m),
            _ => self.test(buf, rule, off, frame),
        };

        if self.tracing() {
            trace!(line = rule.line, level = rule.level, offset = off, matched = hit.is_some(), "rule");
        }
        let hit = hit?;
        self.emit(rule, &hit.value, m);
        self.eval_children(buf, rule, frame, hit.end, m);
        Some(hit.end)
    }

    fn emit(&self, rule: &MagicRule, value: &Value, m: &mut Match) {
        if !rule.message.is_empty() {
            let text = format_message(&rule.message, value, self.flags.contains(MagicFlags::RAW));
            m.append(&text, rule.no_space);
        }
        if rule.mime.is_some() {
            m.mime.clone_from(&rule.mime);
        }
        if rule.ext.is_some() {
            m.ext.clone_from(&rule.ext);
        }
        if rule.apple.is_some() {
            m.apple.clone_from(&rule.apple);
        }
    }

    fn eval_use(&self, buf: &[u8], rule: &MagicRule, off: usize, frame: Frame, m: &mut Match) -> Option<usize> {
        let Test::Name { name, flip } = &rule.test else {
            return None;
        };
        if frame.name_depth >= self.params.name_max {
            debug!(name = %name, depth = frame.name_depth, "use nesting limit reached");
            return None;
        }
        let Some(entry) = self.db.named(name) else {
            debug!(name = %name, line = rule.line, "use of undefined name");
            return None;
        };
        let target = self.db.root(entry);
        let inner = Frame {
            base: off,
            flip: frame.flip ^ flip,
            name_depth: frame.name_depth + 1,
            ..frame
        };

        self.emit(rule, &Value::None, m);
        self.emit(target, &Value::None, m);
        self.eval_children(buf, target, inner, off, m);
        self.eval_children(buf, rule, frame, off, m);
        Some(off)
    }

    fn eval_indirect(&self, buf: &[u8], rule: &MagicRule, off: usize, frame: Frame, m: &mut Match) -> Option<usize> {
        if frame.indir_depth >= self.params.indir_max {
            debug!(depth = frame.indir_depth, "indirect nesting limit reached");
            return None;
        }
        let sub = buf.get(off..)?;
        let inner = self.run_at(sub, frame.indir_depth + 1).into_iter().next()?;

        self.emit(rule, &Value::None, m);
        m.append(&inner.description, false);
        for (slot, value) in [
            (&mut m.mime, inner.mime),
            (&mut m.ext, inner.ext),
            (&mut m.apple, inner.apple),
        ] {
            if value.is_some() {
                *slot = value;
            }
        }
        self.eval_children(buf, rule, frame, off, m);
        Some(off)
    }

    //  Offsets

    fn resolve_offset(&self, buf: &[u8], offset: &Offset, frame: Frame, parent_end: usize) -> Option<usize> {
        let value = match &offset.base {
            OffsetBase::Direct(n) if offset.relative => (parent_end as i64).checked_add(*n)?,
            OffsetBase::Direct(n) if *n < 0 => (buf.len() as i64).checked_add(*n)?,
            OffsetBase::Direct(n) => (frame.base as i64).checked_add(*n)?,
            OffsetBase::Indirect(ind) => {
                let at = if ind.at_relative {
                    (parent_end as i64).checked_add(ind.at)?
                } else if ind.at < 0 {
                    (buf.len() as i64).checked_add(ind.at)?
                } else {
                    (frame.base as i64).checked_add(ind.at)?
                };
                let at = usize::try_from(at).ok()?;
                let mut v = read_indirect(buf, at, ind.width, ind.signed)?;
                if let Some((op, n)) = ind.adjust {
                    v = op.apply(v, n)?;
                }
                if offset.relative {
                    (parent_end as i64).checked_add(v)?
                } else {
                    (frame.base as i64).checked_add(v)?
                }
            }
        };
        usize::try_from(value).ok()
    }

    //  Tests

    fn endian(&self, endian: Endian, frame: Frame) -> Endian {
        if frame.flip {
            endian.flipped()
        } else {
            endian.resolve()
        }
    }

    fn test(&self, buf: &[u8], rule: &MagicRule, off: usize, frame: Frame) -> Option<Hit> {
        let ty = &rule.ty;
        match ty.kind {
            k if k.is_float() => self.test_float(buf, rule, off, frame),
            k if k.is_numeric() => self.test_int(buf, rule, off, frame),
            TypeKind::String => test_string(buf, rule, off),
            TypeKind::PString => test_pstring(buf, rule, off),
            TypeKind::String16 => test_string16(buf, rule, off, self.endian(ty.endian, frame)),
            TypeKind::Search => test_search(buf, rule, off),
            TypeKind::Regex => test_regex(buf, rule, off, self.params.regex_max),
            _ => None,
        }
    }

    fn test_int(&self, buf: &[u8], rule: &MagicRule, off: usize, frame: Frame) -> Option<Hit> {
        let ty = &rule.ty;
        let width = ty.kind.width();
        let mut raw = read_uint(buf, off, width, self.endian(ty.endian, frame))?;
        if let Some((op, n)) = ty.mask {
            raw = op.apply(raw as i64, n)? as u64 & width_mask(width);
        }
        if !compare_int(raw, width, ty.unsigned, &rule.test) {
            return None;
        }

        let value = if ty.kind.is_date() {
            let local = matches!(ty.kind, TypeKind::LDate | TypeKind::QLDate);
            Value::Str(format_date(raw as i64, local).into_bytes())
        } else if ty.unsigned {
            Value::Int {
                value: raw as i64,
                width,
            }
        } else {
            Value::Int {
                value: sign_extend(raw, width),
                width,
            }
        };
        Some(Hit {
            end: off + width,
            value,
        })
    }

    fn test_float(&self, buf: &[u8], rule: &MagicRule, off: usize, frame: Frame) -> Option<Hit> {
        let width = rule.ty.kind.width();
        let raw = read_uint(buf, off, width, self.endian(rule.ty.endian, frame))?;
        let v = if width == 4 {
            f32::from_bits(raw as u32) as f64
        } else {
            f64::from_bits(raw)
        };
        let matched = match &rule.test {
            Test::Any => true,
            Test::Float { op, value } => match op {
                Compare::Eq => v == *value,
                Compare::Ne => v != *value,
                Compare::Lt => v < *value,
                Compare::Gt => v > *value,
                Compare::AllSet | Compare::AnyClear => false,
            },
            _ => false,
        };
        matched.then_some(Hit {
            end: off + width,
            value: Value::Float(v),
        })
    }
}

//  Numeric helpers

fn width_mask(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

fn sign_extend(raw: u64, width: usize) -> i64 {
    if width == 0 || width >= 8 {
        return raw as i64;
    }
    let shift = 64 - width * 8;
    ((raw << shift) as i64) >> shift
}

/// Equality and bit tests compare at the type's width; ordering compares
/// the signed or unsigned read value against the literal.
fn compare_int(raw: u64, width: usize, unsigned: bool, test: &Test) -> bool {
    let (op, value) = match test {
        Test::Any => return true,
        Test::Int { op, value } => (*op, *value),
        _ => return false,
    };
    let lit = value as u64 & width_mask(width);
    let ordering = || {
        if unsigned {
            raw.cmp(&(value as u64))
        } else {
            sign_extend(raw, width).cmp(&value)
        }
    };
    match op {
        Compare::Eq => raw == lit,
        Compare::Ne => raw != lit,
        Compare::AllSet => raw & lit == lit,
        Compare::AnyClear => raw & lit != lit,
        Compare::Lt => ordering() == Ordering::Less,
        Compare::Gt => ordering() == Ordering::Greater,
    }
}

fn read_uint(buf: &[u8], off: usize, width: usize, endian: Endian) -> Option<u64> {
    let b = buf.get(off..off.checked_add(width)?)?;
    Some(match (width, endian) {
        (1, _) => b[0] as u64,
        (2, Endian::Big) => u16::from_be_bytes([b[0], b[1]]) as u64,
        (2, _) => u16::from_le_bytes([b[0], b[1]]) as u64,
        (4, Endian::Big) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64,
        (4, Endian::Middle) => u32::from_be_bytes([b[1], b[0], b[3], b[2]]) as u64,
        (4, _) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64,
        (8, Endian::Big) => u64::from_be_bytes(b.try_into().ok()?),
        (8, _) => u64::from_le_bytes(b.try_into().ok()?),
        _ => return None,
    })
}

fn read_indirect(buf: &[u8], at: usize, width: IndirectWidth, signed: bool) -> Option<i64> {
    use IndirectWidth::*;
    let size = width.size();
    let raw = match width {
        Byte => read_uint(buf, at, 1, Endian::Little)?,
        LeShort => read_uint(buf, at, 2, Endian::Little)?,
        BeShort => read_uint(buf, at, 2, Endian::Big)?,
        LeLong => read_uint(buf, at, 4, Endian::Little)?,
        BeLong => read_uint(buf, at, 4, Endian::Big)?,
        MeLong => read_uint(buf, at, 4, Endian::Middle)?,
        LeQuad => read_uint(buf, at, 8, Endian::Little)?,
        BeQuad => read_uint(buf, at, 8, Endian::Big)?,
        LeId3 => syncsafe(read_uint(buf, at, 4, Endian::Little)?),
        BeId3 => syncsafe(read_uint(buf, at, 4, Endian::Big)?),
    };
    Some(if signed {
        sign_extend(raw, size)
    } else {
        raw as i64
    })
}

/// ID3 size: 7 significant bits per byte.
fn syncsafe(v: u64) -> u64 {
    (v & 0x7f) | ((v >> 8) & 0x7f) << 7 | ((v >> 16) & 0x7f) << 14 | ((v >> 24) & 0x7f) << 21
}

//  String helpers

/// Match `pat` at the start of `data` honouring the case and whitespace
/// modifiers. Returns the number of data bytes consumed.
fn match_string(data: &[u8], pat: &[u8], flags: StrFlags) -> Option<usize> {
    let spaces = flags.intersects(StrFlags::COMPACT_WHITESPACE | StrFlags::OPTIONAL_WHITESPACE);
    let need_space = !flags.contains(StrFlags::OPTIONAL_WHITESPACE);
    let mut di = 0;
    for &p in pat {
        if spaces && p.is_ascii_whitespace() {
            let start = di;
            while data.get(di).is_some_and(u8::is_ascii_whitespace) {
                di += 1;
            }
            if need_space && di == start {
                return None;
            }
            continue;
        }
        let d = *data.get(di)?;
        let ok = if flags.contains(StrFlags::IGNORE_LOWERCASE) && p.is_ascii_lowercase() {
            d.to_ascii_lowercase() == p
        } else if flags.contains(StrFlags::IGNORE_UPPERCASE) && p.is_ascii_uppercase() {
            d.to_ascii_uppercase() == p
        } else {
            d == p
        };
        if !ok {
            return None;
        }
        di += 1;
    }
    Some(di)
}

/// Printable value of a string at the start of `data`: up to NUL or end
/// of line.
fn c_string(data: &[u8], flags: StrFlags) -> &[u8] {
    let end = data
        .iter()
        .take(MAX_STRING_VALUE)
        .position(|&b| matches!(b, 0 | b'\n' | b'\r'))
        .unwrap_or(data.len().min(MAX_STRING_VALUE));
    let s = &data[..end];
    if flags.contains(StrFlags::TRIM) {
        s.trim_ascii()
    } else {
        s
    }
}

fn ordered(data: &[u8], pat: &[u8]) -> Ordering {
    data[..data.len().min(pat.len())].cmp(pat)
}

/// Common comparison of a string-like value against a literal.
fn string_compare(data: &[u8], test: &Test, flags: StrFlags) -> Option<Hit> {
    match test {
        Test::Any => {
            let s = c_string(data, flags);
            Some(Hit {
                end: s.len(),
                value: Value::Str(s.to_vec()),
            })
        }
        Test::Bytes { op, value: pat } => {
            let hit = match op {
                Compare::Eq => {
                    let n = match_string(data, pat, flags)?;
                    return Some(Hit {
                        end: n,
                        value: Value::Str(data[..n].to_vec()),
                    });
                }
                Compare::Ne => match_string(data, pat, flags).is_none(),
                Compare::Lt => ordered(data, pat) == Ordering::Less,
                Compare::Gt => ordered(data, pat) == Ordering::Greater,
                Compare::AllSet | Compare::AnyClear => false,
            };
            let s = c_string(data, flags);
            hit.then(|| Hit {
                end: s.len(),
                value: Value::Str(s.to_vec()),
            })
        }
        _ => None,
    }
}

fn non_empty_tail(buf: &[u8], off: usize) -> Option<&[u8]> {
    buf.get(off..).filter(|d| !d.is_empty())
}

fn test_string(buf: &[u8], rule: &MagicRule, off: usize) -> Option<Hit> {
    let data = non_empty_tail(buf, off)?;
    let hit = string_compare(data, &rule.test, rule.ty.flags)?;
    Some(Hit {
        end: off + hit.end,
        value: hit.value,
    })
}

fn test_pstring(buf: &[u8], rule: &MagicRule, off: usize) -> Option<Hit> {
    let width = rule.ty.pstring;
    let size = width.size();
    let endian = match width {
        PStringWidth::BeShort | PStringWidth::BeLong => Endian::Big,
        _ => Endian::Little,
    };
    let mut len = read_uint(buf, off, size, endian)? as usize;
    if rule.ty.flags.contains(StrFlags::PSTRING_INCLUSIVE) {
        len = len.checked_sub(size)?;
    }
    let start = off + size;
    let s = buf.get(start..start.checked_add(len)?)?;

    let matched = match &rule.test {
        Test::Any => true,
        Test::Bytes { op, value: pat } => match op {
            Compare::Eq => match_string(s, pat, rule.ty.flags).is_some(),
            Compare::Ne => match_string(s, pat, rule.ty.flags).is_none(),
            Compare::Lt => ordered(s, pat) == Ordering::Less,
            Compare::Gt => ordered(s, pat) == Ordering::Greater,
            Compare::AllSet | Compare::AnyClear => false,
        },
        _ => false,
    };
    let shown = &s[..s.len().min(MAX_STRING_VALUE)];
    matched.then(|| Hit {
        end: start + len,
        value: Value::Str(shown.to_vec()),
    })
}

fn test_string16(buf: &[u8], rule: &MagicRule, off: usize, endian: Endian) -> Option<Hit> {
    let data = non_empty_tail(buf, off)?;
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|p| match endian {
            Endian::Big => u16::from_be_bytes([p[0], p[1]]),
            _ => u16::from_le_bytes([p[0], p[1]]),
        })
        .collect();
    let narrow = |us: &[u16]| -> Vec<u8> {
        us.iter()
            .map(|&u| if u < 0x100 { u as u8 } else { b'?' })
            .collect()
    };

    match &rule.test {
        Test::Any => {
            let n = units
                .iter()
                .take(MAX_STRING_VALUE)
                .position(|&u| u == 0)
                .unwrap_or(units.len().min(MAX_STRING_VALUE));
            Some(Hit {
                end: off + 2 * n,
                value: Value::Str(narrow(&units[..n])),
            })
        }
        Test::Bytes { op, value: pat } => {
            let equal = units.len() >= pat.len()
                && pat.iter().zip(&units).all(|(&p, &u)| p as u16 == u);
            let matched = match op {
                Compare::Eq => equal,
                Compare::Ne => !equal,
                _ => false,
            };
            let n = pat.len().min(units.len());
            matched.then(|| Hit {
                end: off + 2 * n,
                value: Value::Str(narrow(&units[..n])),
            })
        }
        _ => None,
    }
}

fn test_search(buf: &[u8], rule: &MagicRule, off: usize) -> Option<Hit> {
    let data = non_empty_tail(buf, off)?;
    let Test::Bytes { op, value: pat } = &rule.test else {
        return string_compare(data, &rule.test, rule.ty.flags).map(|h| Hit {
            end: off + h.end,
            value: h.value,
        });
    };
    if pat.is_empty() {
        return None;
    }
    let range = (rule.ty.range as usize).max(1);
    let flags = rule.ty.flags;
    let literal = !flags.intersects(
        StrFlags::COMPACT_WHITESPACE
            | StrFlags::OPTIONAL_WHITESPACE
            | StrFlags::IGNORE_LOWERCASE
            | StrFlags::IGNORE_UPPERCASE,
    );

    let found = if literal {
        let window = &data[..data.len().min(range + pat.len() - 1)];
        memmem::find(window, pat).map(|pos| (pos, pat.len()))
    } else {
        (0..range.min(data.len())).find_map(|pos| match_string(&data[pos..], pat, flags).map(|n| (pos, n)))
    };

    match (op, found) {
        (Compare::Eq, Some((pos, n))) => Some(Hit {
            end: off + pos + n,
            value: Value::Str(data[pos..pos + n].to_vec()),
        }),
        (Compare::Ne, None) => Some(Hit {
            end: off,
            value: Value::Str(Vec::new()),
        }),
        _ => None,
    }
}

fn test_regex(buf: &[u8], rule: &MagicRule, off: usize, regex_max: usize) -> Option<Hit> {
    let data = non_empty_tail(buf, off)?;
    let Test::Regex(re) = &rule.test else {
        return None;
    };
    let range = rule.ty.range as usize;
    let window = if rule.ty.flags.contains(StrFlags::LINES) {
        let lines = if range == 0 { usize::MAX } else { range };
        memchr_iter(b'\n', data)
            .nth(lines.saturating_sub(1))
            .map_or(data.len(), |nl| nl + 1)
    } else if range == 0 {
        data.len()
    } else {
        range
    };
    let window = window.min(regex_max).min(data.len());

    let m = re.regex().find(&data[..window])?;
    let end = if rule.ty.flags.contains(StrFlags::REGEX_OFFSET_START) {
        m.start()
    } else {
        m.end()
    };
    Some(Hit {
        end: off + end,
        value: Value::Str(m.as_bytes().to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use magic_rules::compile_str;

    fn run(src: &str, data: &[u8], flags: MagicFlags) -> Vec<Match> {
        let db = compile_str("t", src).unwrap();
        let params = Params::default();
        SoftMagic::new(&db, flags, &params).run(data)
    }

    fn describe(src: &str, data: &[u8]) -> Option<String> {
        run(src, data, MagicFlags::NONE)
            .into_iter()
            .next()
            .map(|m| m.description)
    }

    #[test]
    fn test_children_concatenate() {
        let src = "0 string %PDF- PDF document\n!:mime application/pdf\n>5 byte x \\b, version %c\n>7 byte x \\b.%c\n";
        assert_eq!(
            describe(src, b"%PDF-1.4\n").as_deref(),
            Some("PDF document, version 1.4")
        );
    }

    #[test]
    fn test_child_needs_parent_match() {
        let src = "0 byte 1 one\n>1 byte 2 two\n>>2 byte 3 three\n";
        assert_eq!(describe(src, &[1, 2, 3]).as_deref(), Some("one two three"));
        assert_eq!(describe(src, &[1, 9, 3]).as_deref(), Some("one"));
        assert_eq!(describe(src, &[0, 2, 3]), None);
    }

    #[test]
    fn test_indirect_offset_overflow_is_no_match() {
        let src = "0 string AB ab\n>&(2.q) byte x \\b, y\n>(2.q+1) byte x \\b, z\n";
        let mut data = b"AB".to_vec();
        data.extend_from_slice(&i64::MAX.to_le_bytes());
        assert_eq!(describe(src, &data).as_deref(), Some("ab"));

        let mut data = b"AB".to_vec();
        data.extend_from_slice(&i64::MIN.to_le_bytes());
        assert_eq!(describe(src, &data).as_deref(), Some("ab"));
    }

    #[test]
    fn test_endianness_and_masks() {
        let src = "0 beshort 0x0102 be\n0 leshort 0x0102 le\n";
        assert_eq!(describe(src, &[1, 2]).as_deref(), Some("be"));
        assert_eq!(describe(src, &[2, 1]).as_deref(), Some("le"));
        let src = "0 byte&0xf0 0x40 high-four\n";
        assert_eq!(describe(src, &[0x4a]).as_deref(), Some("high-four"));
        let src = "0 melong 0x01020304 pdp\n";
        assert_eq!(describe(src, &[2, 1, 4, 3]).as_deref(), Some("pdp"));
    }

    #[test]
    fn test_signedness_of_ordering() {
        let src = "0 byte <0 negative\n";
        assert_eq!(describe(src, &[0xff]).as_deref(), Some("negative"));
        let src = "0 ubyte <0 never\n";
        assert_eq!(describe(src, &[0xff]), None);
        // equality is width-truncated
        let src = "0 byte 0xff all-ones\n";
        assert_eq!(describe(src, &[0xff]).as_deref(), Some("all-ones"));
    }

    #[test]
    fn test_bit_comparators() {
        let src = "0 byte &0x81 both\n";
        assert_eq!(describe(src, &[0x83]).as_deref(), Some("both"));
        assert_eq!(describe(src, &[0x80]), None);
        let src = "0 byte ^0x81 missing\n";
        assert_eq!(describe(src, &[0x80]).as_deref(), Some("missing"));
    }

    #[test]
    fn test_negative_offset_from_end() {
        let src = "-4 string TAIL tail marker\n";
        assert_eq!(describe(src, b"xxxxTAIL").as_deref(), Some("tail marker"));
        assert_eq!(describe(src, b"TAILxxxx"), None);
    }

    #[test]
    fn test_relative_offsets() {
        let src = "0 string AB ab\n>&1 string CD \\b+cd\n";
        assert_eq!(describe(src, b"ABxCD").as_deref(), Some("ab+cd"));
        assert_eq!(describe(src, b"ABCDx").as_deref(), Some("ab"));
    }

    #[test]
    fn test_indirect_offset_resolved_per_input() {
        let src = "0 string HD\n>(2.b) string OK found at %s\n";
        let mut data = b"HD\x06\0\0\0OK".to_vec();
        assert_eq!(describe(src, &data).as_deref(), Some("found at OK"));
        data[2] = 3;
        assert_eq!(describe(src, &data), None);
        let src = "0 string HD\n>(2.b+1) string K shifted\n";
        assert_eq!(describe(src, &data_at(6)).as_deref(), Some("shifted"));
    }

    fn data_at(pos: u8) -> Vec<u8> {
        let mut v = b"HD".to_vec();
        v.push(pos);
        v.resize(pos as usize, 0);
        v.extend_from_slice(b"OK");
        v
    }

    #[test]
    fn test_default_and_clear() {
        let src = "\
0 string M m
>1 byte 1 one
>1 default x other
>1 clear x
>1 default x reset
";
        assert_eq!(describe(src, b"M\x01").as_deref(), Some("m one reset"));
        assert_eq!(describe(src, b"M\x02").as_deref(), Some("m other reset"));
    }

    #[test]
    fn test_use_and_flip() {
        let src = "\
0 name word
>0 leshort 0x0102 little
>0 leshort 0x0201 big
0 string W w
>1 use word
>3 use ^word
";
        // offsets inside the subroutine are relative to the call site
        assert_eq!(
            describe(src, &[b'W', 0x02, 0x01, 0x02, 0x01]).as_deref(),
            Some("w little big")
        );
        assert_eq!(
            describe(src, &[b'W', 0x02, 0x01, 0x01, 0x02]).as_deref(),
            Some("w little little")
        );
    }

    #[test]
    fn test_use_depth_limited() {
        let src = "0 name loop\n>0 use loop\n0 byte x start\n>0 use loop\n";
        assert_eq!(describe(src, &[0]).as_deref(), Some("start"));
    }

    #[test]
    fn test_indirect_rule() {
        let src = "\
0 string PK zipped
0 string HDR container
>4 indirect x \\b, holding
";
        assert_eq!(
            describe(src, b"HDR_PK").as_deref(),
            Some("container, holding zipped")
        );
    }

    #[test]
    fn test_string_flags() {
        let src = "0 string/c hello greeting\n";
        assert_eq!(describe(src, b"HeLLo").as_deref(), Some("greeting"));
        let src = "0 string/w #!\\ /bin/sh shell\n";
        assert_eq!(describe(src, b"#!/bin/sh\n").as_deref(), Some("shell"));
        assert_eq!(describe(src, b"#!   /bin/sh\n").as_deref(), Some("shell"));
        let src = "0 string/W a\\ b spaced\n";
        assert_eq!(describe(src, b"a   b").as_deref(), Some("spaced"));
        assert_eq!(describe(src, b"ab"), None);
    }

    #[test]
    fn test_string_value_printing() {
        let src = "0 string x name=%s\n";
        assert_eq!(describe(src, b"abc\0def").as_deref(), Some("name=abc"));
        let src = "0 string >\\0 first=%s\n";
        assert_eq!(describe(src, b"zz\nyy").as_deref(), Some("first=zz"));
        let src = "0 string !abc not-abc\n";
        assert_eq!(describe(src, b"abd").as_deref(), Some("not-abc"));
        assert_eq!(describe(src, b"abc"), None);
    }

    #[test]
    fn test_pstring() {
        let src = "0 pstring abc short-string %s\n";
        assert_eq!(describe(src, b"\x03abc").as_deref(), Some("short-string abc"));
        let src = "0 pstring/HJ x inclusive %s\n";
        assert_eq!(describe(src, b"\x00\x04hi").as_deref(), Some("inclusive hi"));
    }

    #[test]
    fn test_string16() {
        let src = "0 lestring16 AB wide\n";
        assert_eq!(describe(src, b"A\0B\0").as_deref(), Some("wide"));
        assert_eq!(describe(src, b"\0A\0B"), None);
    }

    #[test]
    fn test_search_window() {
        let src = "0 search/10 NEEDLE found %s\n";
        assert_eq!(describe(src, b"....NEEDLE").as_deref(), Some("found NEEDLE"));
        assert_eq!(describe(src, b"...........NEEDLE"), None);
        let src = "0 search/100/c <html markup\n>&0 string >\\0 \\b, tail\n";
        assert_eq!(describe(src, b"  <HTML> x").as_deref(), Some("markup, tail"));
    }

    #[test]
    fn test_regex_lines() {
        let src = "0 regex/1l ^import\\ os python-ish\n";
        assert_eq!(describe(src, b"import os\n").as_deref(), Some("python-ish"));
        assert_eq!(describe(src, b"# c\nimport os\n"), None);
        let src = "0 regex/2l ^import\\ os second-line\n";
        assert_eq!(describe(src, b"# c\nimport os\n").as_deref(), Some("second-line"));
    }

    #[test]
    fn test_dates() {
        let src = "0 bedate x stamped %s\n";
        assert_eq!(
            describe(src, &[0, 0, 0, 0]).as_deref(),
            Some("stamped Thu Jan  1 00:00:00 1970")
        );
    }

    #[test]
    fn test_floats() {
        let src = "0 befloat 1.5 one-and-a-half %.1f\n";
        assert_eq!(
            describe(src, &1.5f32.to_be_bytes()).as_deref(),
            Some("one-and-a-half 1.5")
        );
        let src = "0 ledouble >100 big\n";
        assert_eq!(describe(src, &250.0f64.to_le_bytes()).as_deref(), Some("big"));
    }

    #[test]
    fn test_mime_mode_skips_entries_without_mime() {
        let src = "0 string AB no mime here\n0 byte 0x41 letter A\n!:mime text/x-letter\n";
        let found = run(src, b"AB", MagicFlags::MIME_TYPE);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mime.as_deref(), Some("text/x-letter"));
    }

    #[test]
    fn test_deepest_mime_wins() {
        let src = "0 string RIFF riff\n!:mime application/x-riff\n>8 string WAVE \\b, wave\n!:mime audio/x-wav\n";
        let found = run(src, b"RIFF....WAVE", MagicFlags::NONE);
        assert_eq!(found[0].mime.as_deref(), Some("audio/x-wav"));
        let found = run(src, b"RIFF....AVI ", MagicFlags::NONE);
        assert_eq!(found[0].mime.as_deref(), Some("application/x-riff"));
    }

    #[test]
    fn test_continue_collects_all() {
        let src = "0 byte 0x41 first\n0 string AB second\n";
        assert_eq!(run(src, b"AB", MagicFlags::NONE).len(), 1);
        let all = run(src, b"AB", MagicFlags::CONTINUE);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].description, "second");
        assert_eq!(all[1].description, "first");
    }

    #[test]
    fn test_category_suppression() {
        let src = "0 string AB archive-ish\n!:category tar\n0 byte 0x41 generic\n";
        assert_eq!(describe(src, b"AB").as_deref(), Some("archive-ish"));
        let found = run(src, b"AB", MagicFlags::NO_CHECK_TAR);
        assert_eq!(found[0].description, "generic");
    }

    #[test]
    fn test_unprintable_value_escaped() {
        let src = "0 string x got %s\n";
        let found = run(src, b"a\x01b", MagicFlags::NONE);
        assert_eq!(found[0].description, "got a\\001b");
        let found = run(src, b"a\x01b", MagicFlags::RAW);
        assert_eq!(found[0].description, "got a\u{1}b");
    }
}
