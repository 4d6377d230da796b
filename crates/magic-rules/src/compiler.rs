//! Magic source compiler.
//!
//! Turns human-authored rule files into a [`SignatureDatabase`]:
//!
//! ```text
//! 0       string      %PDF-       PDF document
//! !:mime  application/pdf
//! >5      byte        x           \b, version %c
//! ```
//!
//! Each non-comment line is `[>...]offset type test message`; `!:` lines
//! annotate the rule above them. A batch either compiles completely or not
//! at all.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::strength;
use crate::types::*;

/// Default search window of `search` rules written without a range.
const DEFAULT_SEARCH_RANGE: u32 = 4096;

//  Public entry points

/// Compile rule files (directories contribute their regular files in name
/// order) into one database.
pub fn compile_files(paths: &[PathBuf]) -> Result<SignatureDatabase, RulesError> {
    let mut compiler = Compiler::new();
    for path in paths {
        compiler.add_path(path)?;
    }
    compiler.finish()
}

/// Compile a single in-memory source.
pub fn compile_str(name: &str, text: &str) -> Result<SignatureDatabase, RulesError> {
    compile_sources(&[(name, text)])
}

/// Compile several in-memory sources, in order.
pub fn compile_sources(sources: &[(&str, &str)]) -> Result<SignatureDatabase, RulesError> {
    let mut compiler = Compiler::new();
    for (name, text) in sources {
        compiler.add_source(name, text)?;
    }
    compiler.finish()
}

/// Expand `path` into the rule files it stands for.
pub fn source_files(path: &Path) -> Result<Vec<PathBuf>, RulesError> {
    let meta = fs::metadata(path).map_err(|source| RulesError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    let entries = fs::read_dir(path).map_err(|source| RulesError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry?;
        let p = entry.path();
        if p.is_file() {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

//  Compiler

/// Incremental compiler: add sources, then [`Compiler::finish`].
#[derive(Debug, Default)]
pub struct Compiler {
    check: bool,
    warnings: Vec<String>,
    entries: Vec<RawEntry>,
}

#[derive(Debug)]
struct RawNode {
    rule: MagicRule,
    children: Vec<usize>,
}

#[derive(Debug)]
struct RawEntry {
    nodes: Vec<RawNode>,
    adjust: Option<(ArithOp, i64)>,
    category: Category,
    key: String,
    source: String,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect lint warnings for suspicious but legal rules.
    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Add a rule file, or every file of a directory.
    pub fn add_path(&mut self, path: &Path) -> Result<(), RulesError> {
        for file in source_files(path)? {
            let bytes = fs::read(&file).map_err(|source| RulesError::Read {
                path: file.clone(),
                source,
            })?;
            let text = String::from_utf8_lossy(&bytes);
            self.add_source(&file.display().to_string(), &text)?;
        }
        Ok(())
    }

    /// Parse one source. On error nothing from this source is kept.
    pub fn add_source(&mut self, name: &str, text: &str) -> Result<(), RulesError> {
        let mut parsed: Vec<RawEntry> = Vec::new();
        let mut current: Option<RawEntry> = None;
        // stack[level] = node index of the latest rule at that level
        let mut stack: Vec<usize> = Vec::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let err = |message: String| RulesError::Syntax {
                file: name.to_string(),
                line: line_no,
                message,
            };

            if let Some(directive) = line.strip_prefix("!:") {
                let Some(entry) = current.as_mut() else {
                    return Err(err("directive without a preceding rule".into()));
                };
                let node = stack.last().copied().unwrap_or(0);
                apply_directive(entry, node, directive).map_err(err)?;
                if self.check {
                    self.lint_directive(name, line_no, directive);
                }
                continue;
            }

            let level = line.bytes().take_while(|&b| b == b'>').count();
            if level > u8::MAX as usize {
                return Err(err(format!("nesting level {level} too deep")));
            }
            let (mut rule, key) = parse_rule(&line[level..]).map_err(err)?;
            rule.level = level as u8;
            rule.line = line_no as u32;
            if self.check {
                self.lint_rule(name, &rule);
            }

            if level == 0 {
                if let Some(done) = current.take() {
                    parsed.push(done);
                }
                current = Some(RawEntry {
                    nodes: vec![RawNode {
                        rule,
                        children: Vec::new(),
                    }],
                    adjust: None,
                    category: Category::Generic,
                    key,
                    source: name.to_string(),
                });
                stack.clear();
                stack.push(0);
                continue;
            }

            let Some(entry) = current.as_mut() else {
                return Err(err("continuation line without a top-level rule".into()));
            };
            if level > stack.len() {
                return Err(err(format!(
                    "level {level} rule follows a level {} rule",
                    stack.len() - 1
                )));
            }
            if rule.ty.kind == TypeKind::Name {
                return Err(err("`name` is only valid at level 0".into()));
            }
            stack.truncate(level);
            let parent = stack[level - 1];
            let node_idx = entry.nodes.len();
            entry.nodes.push(RawNode {
                rule,
                children: Vec::new(),
            });
            entry.nodes[parent].children.push(node_idx);
            stack.push(node_idx);
        }
        if let Some(done) = current.take() {
            parsed.push(done);
        }

        if self.check {
            for entry in &parsed {
                let root = &entry.nodes[0];
                if root.children.is_empty()
                    && root.rule.message.is_empty()
                    && root.rule.mime.is_none()
                {
                    self.warn(name, root.rule.line as usize, "top-level rule prints nothing");
                }
            }
        }

        debug!(source = name, entries = parsed.len(), "parsed magic source");
        self.entries.extend(parsed);
        Ok(())
    }

    /// Lay the parsed trees out in the arena and build the database.
    pub fn finish(self) -> Result<SignatureDatabase, RulesError> {
        let mut rules: Vec<MagicRule> = Vec::new();
        let mut entries: Vec<Entry> = Vec::with_capacity(self.entries.len());

        for (order, raw) in self.entries.into_iter().enumerate() {
            let root_idx = rules.len();
            let strength = strength::entry_strength(&raw.nodes[0].rule, raw.adjust);

            // Breadth-first so that each node's children are contiguous.
            let mut queue: VecDeque<(usize, usize)> = VecDeque::new();
            rules.push(raw.nodes[0].rule.clone());
            queue.push_back((root_idx, 0));
            while let Some((flat_idx, raw_idx)) = queue.pop_front() {
                let start = rules.len();
                for &child in &raw.nodes[raw_idx].children {
                    rules.push(raw.nodes[child].rule.clone());
                    queue.push_back((rules.len() - 1, child));
                }
                rules[flat_idx].children = ChildRange {
                    start: start as u32,
                    len: (rules.len() - start) as u32,
                };
            }

            entries.push(Entry {
                root: root_idx as u32,
                strength,
                category: raw.category,
                order: order as u32,
                key: raw.key,
                source: raw.source,
            });
        }

        debug!(rules = rules.len(), entries = entries.len(), "compiled magic");
        SignatureDatabase::from_parts(rules, entries)
    }

    //  Lints

    fn warn(&mut self, file: &str, line: usize, message: &str) {
        let text = format!("{file}, {line}: warning: {message}");
        warn!("{text}");
        self.warnings.push(text);
    }

    fn lint_directive(&mut self, file: &str, line: usize, directive: &str) {
        let (name, value) = split_directive(directive);
        match name {
            "mime" if !value.contains('/') => {
                self.warn(file, line, &format!("MIME type `{value}` has no subtype"))
            }
            "ext" if value.contains(char::is_whitespace) => {
                self.warn(file, line, "extension list contains whitespace")
            }
            "apple" if value.len() != 8 => {
                self.warn(file, line, "Apple creator/type should be 8 characters")
            }
            _ => {}
        }
    }

    fn lint_rule(&mut self, file: &str, rule: &MagicRule) {
        let width = rule.ty.kind.width();
        if let Test::Int { value, .. } = rule.test {
            if (1..8).contains(&width) {
                let bits = width * 8;
                let unsigned_max = (1i64 << bits) - 1;
                let signed_min = -(1i64 << (bits - 1));
                if value > unsigned_max || value < signed_min {
                    self.warn(
                        file,
                        rule.line as usize,
                        &format!("value {value:#x} does not fit in {width} byte(s)"),
                    );
                }
            }
        }
    }
}

//  Rule lines

/// Parse a rule line with its level markers already stripped. Returns the
/// rule and its identity key.
fn parse_rule(text: &str) -> Result<(MagicRule, String), String> {
    let (offset_tok, rest) = next_field(text).ok_or("missing offset")?;
    let (type_tok, rest) = next_field(rest).ok_or("missing type")?;
    let (test_tok, rest) = next_test_field(rest);

    let offset = parse_offset(offset_tok)?;
    let ty = parse_type(type_tok)?;
    let test = parse_test(&ty, test_tok)?;

    let mut message = rest.trim();
    let mut no_space = false;
    if let Some(stripped) = message.strip_prefix("\\b") {
        message = stripped;
        no_space = true;
    }

    let key = format!("{offset_tok} {type_tok} {test_tok}");
    Ok((
        MagicRule {
            level: 0,
            line: 0,
            offset,
            ty,
            test,
            message: message.to_string(),
            no_space,
            mime: None,
            ext: None,
            apple: None,
            children: ChildRange::default(),
        },
        key,
    ))
}

fn next_field(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    let end = text.find(char::is_whitespace).unwrap_or(text.len());
    Some((&text[..end], &text[end..]))
}

/// Like [`next_field`] but a backslash escapes the following character,
/// so `\ ` keeps a space inside the test value.
fn next_test_field(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c.is_whitespace() {
            return (&text[..i], &text[i..]);
        }
    }
    (text, "")
}

//  Offsets

fn parse_offset(tok: &str) -> Result<Offset, String> {
    let (relative, body) = match tok.strip_prefix('&') {
        Some(rest) => (true, rest),
        None => (false, tok),
    };

    if let Some(inner) = body.strip_prefix('(') {
        let inner = inner
            .strip_suffix(')')
            .ok_or_else(|| format!("unterminated indirect offset `{tok}`"))?;
        let indirect = parse_indirect(inner).map_err(|e| format!("{e} in offset `{tok}`"))?;
        return Ok(Offset {
            relative,
            base: OffsetBase::Indirect(indirect),
        });
    }

    let value = parse_number(body).ok_or_else(|| format!("invalid offset `{tok}`"))?;
    Ok(Offset {
        relative,
        base: OffsetBase::Direct(value),
    })
}

fn parse_indirect(inner: &str) -> Result<IndirectOffset, String> {
    let (at_relative, body) = match inner.strip_prefix('&') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };
    let (at, mut rest) = parse_number_prefix(body).ok_or("missing indirect base")?;

    let mut width = IndirectWidth::LeLong;
    let mut signed = false;
    if let Some(sep) = rest.chars().next().filter(|c| *c == '.' || *c == ',') {
        signed = sep == ',';
        let mut chars = rest[1..].chars();
        let c = chars.next().ok_or("missing indirect width")?;
        width = IndirectWidth::from_char(c).ok_or_else(|| format!("unknown indirect width `{c}`"))?;
        rest = chars.as_str();
    }

    let mut adjust = None;
    if let Some(c) = rest.chars().next() {
        let op = ArithOp::from_char(c).ok_or_else(|| format!("unexpected `{rest}`"))?;
        let operand = &rest[c.len_utf8()..];
        if operand.starts_with('(') {
            return Err("nested indirect operands are not supported".into());
        }
        let n = parse_number(operand).ok_or_else(|| format!("invalid operand `{operand}`"))?;
        adjust = Some((op, n));
    }

    Ok(IndirectOffset {
        at,
        at_relative,
        width,
        signed,
        adjust,
    })
}

//  Types

fn lookup_type(name: &str) -> Option<(TypeKind, Endian)> {
    use Endian::*;
    use TypeKind::*;
    Some(match name {
        "byte" => (Byte, Native),
        "short" => (Short, Native),
        "long" => (Long, Native),
        "quad" => (Quad, Native),
        "float" => (Float, Native),
        "double" => (Double, Native),
        "date" => (Date, Native),
        "ldate" => (LDate, Native),
        "qdate" => (QDate, Native),
        "qldate" => (QLDate, Native),
        "beshort" => (Short, Big),
        "belong" => (Long, Big),
        "bequad" => (Quad, Big),
        "befloat" => (Float, Big),
        "bedouble" => (Double, Big),
        "bedate" => (Date, Big),
        "beldate" => (LDate, Big),
        "beqdate" => (QDate, Big),
        "beqldate" => (QLDate, Big),
        "leshort" => (Short, Little),
        "lelong" => (Long, Little),
        "lequad" => (Quad, Little),
        "lefloat" => (Float, Little),
        "ledouble" => (Double, Little),
        "ledate" => (Date, Little),
        "leldate" => (LDate, Little),
        "leqdate" => (QDate, Little),
        "leqldate" => (QLDate, Little),
        "melong" => (Long, Middle),
        "medate" => (Date, Middle),
        "meldate" => (LDate, Middle),
        "string" => (String, Native),
        "pstring" => (PString, Native),
        "bestring16" => (String16, Big),
        "lestring16" => (String16, Little),
        "search" => (Search, Native),
        "regex" => (Regex, Native),
        "default" => (Default, Native),
        "clear" => (Clear, Native),
        "name" => (Name, Native),
        "use" => (Use, Native),
        "indirect" => (Indirect, Native),
        _ => return None,
    })
}

fn parse_type(tok: &str) -> Result<TypeSpec, String> {
    let name_end = tok
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(tok.len());
    let (name, mods) = tok.split_at(name_end);

    let unsigned_kind = name
        .strip_prefix('u')
        .and_then(lookup_type)
        .filter(|(kind, _)| kind.is_numeric() && !kind.is_float());
    let (kind, endian, unsigned) = match unsigned_kind {
        Some((kind, endian)) => (kind, endian, true),
        None => {
            let (kind, endian) =
                lookup_type(name).ok_or_else(|| format!("unknown type `{name}`"))?;
            (kind, endian, false)
        }
    };

    let mut ty = TypeSpec::new(kind);
    ty.endian = endian;
    ty.unsigned = unsigned;
    if kind == TypeKind::Search {
        ty.range = DEFAULT_SEARCH_RANGE;
    }

    if mods.is_empty() {
        return Ok(ty);
    }

    if kind.is_numeric() {
        if kind.is_float() {
            return Err(format!("modifiers are not allowed on `{name}`"));
        }
        let mut chars = mods.chars();
        let op_char = chars.next().unwrap_or_default();
        let op = ArithOp::from_char(op_char)
            .ok_or_else(|| format!("unexpected `{mods}` after `{name}`"))?;
        let operand = chars.as_str();
        let value = parse_number(operand).ok_or_else(|| format!("invalid mask `{operand}`"))?;
        ty.mask = Some((op, value));
        return Ok(ty);
    }

    if !kind.is_string() {
        return Err(format!("modifiers are not allowed on `{name}`"));
    }

    for segment in mods.split('/') {
        if segment.is_empty() {
            continue;
        }
        let digits_end = segment
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(segment.len());
        let (digits, letters) = segment.split_at(digits_end);
        if !digits.is_empty() {
            if !matches!(kind, TypeKind::Search | TypeKind::Regex) {
                return Err(format!("`{name}` does not take a range"));
            }
            ty.range = digits
                .parse()
                .map_err(|_| format!("invalid range `{digits}`"))?;
        }
        for c in letters.chars() {
            if kind == TypeKind::PString {
                if let Some(width) = PStringWidth::from_char(c) {
                    ty.pstring = width;
                    continue;
                }
            }
            let flag = StrFlags::from_char(c)
                .ok_or_else(|| format!("unknown modifier `{c}` for `{name}`"))?;
            ty.flags |= flag;
        }
    }
    Ok(ty)
}

//  Tests

fn parse_test(ty: &TypeSpec, tok: &str) -> Result<Test, String> {
    match ty.kind {
        TypeKind::Default | TypeKind::Clear | TypeKind::Indirect => return Ok(Test::Any),
        TypeKind::Name | TypeKind::Use => {
            let (flip, name) = match tok.strip_prefix("\\^").or_else(|| tok.strip_prefix('^')) {
                Some(rest) => (true, rest),
                None => (false, tok),
            };
            if name.is_empty() {
                return Err("missing rule name".into());
            }
            if ty.kind == TypeKind::Name && flip {
                return Err("`name` cannot flip byte order".into());
            }
            return Ok(Test::Name {
                name: name.to_string(),
                flip,
            });
        }
        _ => {}
    }

    if tok.is_empty() {
        return Err("missing test value".into());
    }
    if tok == "x" {
        return Ok(Test::Any);
    }

    if ty.kind == TypeKind::Regex {
        let pattern = tok.replace("\\ ", " ");
        let regex = RegexTest::new(&pattern, ty.flags)
            .map_err(|e| format!("invalid regex `{pattern}`: {e}"))?;
        return Ok(Test::Regex(regex));
    }

    let first = tok.chars().next().unwrap_or_default();

    if ty.kind.is_string() {
        let (op, rest) = match first {
            '=' => (Compare::Eq, &tok[1..]),
            '!' => (Compare::Ne, &tok[1..]),
            '<' => (Compare::Lt, &tok[1..]),
            '>' => (Compare::Gt, &tok[1..]),
            _ => (Compare::Eq, tok),
        };
        return Ok(Test::Bytes {
            op,
            value: unescape(rest),
        });
    }

    let (op, negate, rest) = match first {
        '=' => (Compare::Eq, false, &tok[1..]),
        '!' => (Compare::Ne, false, &tok[1..]),
        '<' => (Compare::Lt, false, &tok[1..]),
        '>' => (Compare::Gt, false, &tok[1..]),
        '&' => (Compare::AllSet, false, &tok[1..]),
        '^' => (Compare::AnyClear, false, &tok[1..]),
        '~' => (Compare::Eq, true, &tok[1..]),
        _ => (Compare::Eq, false, tok),
    };

    if ty.kind.is_float() {
        if matches!(op, Compare::AllSet | Compare::AnyClear) || negate {
            return Err(format!("comparator `{first}` is not valid for floats"));
        }
        let value: f64 = rest
            .parse()
            .map_err(|_| format!("invalid floating point value `{rest}`"))?;
        return Ok(Test::Float { op, value });
    }

    let value = parse_number(rest).ok_or_else(|| format!("invalid numeric value `{rest}`"))?;
    Ok(Test::Int {
        op,
        value: if negate { !value } else { value },
    })
}

//  Directives

fn split_directive(directive: &str) -> (&str, &str) {
    let directive = directive.trim();
    let end = directive
        .find(char::is_whitespace)
        .unwrap_or(directive.len());
    (&directive[..end], directive[end..].trim())
}

fn apply_directive(entry: &mut RawEntry, node: usize, directive: &str) -> Result<(), String> {
    let (name, value) = split_directive(directive);
    let rule = &mut entry.nodes[node].rule;
    match name {
        "mime" | "ext" | "apple" if value.is_empty() => Err(format!("empty `!:{name}`")),
        "mime" => {
            rule.mime = Some(value.to_string());
            Ok(())
        }
        "ext" => {
            rule.ext = Some(value.to_string());
            Ok(())
        }
        "apple" => {
            rule.apple = Some(value.to_string());
            Ok(())
        }
        "strength" => {
            let mut chars = value.chars();
            let op_char = chars.next().ok_or("missing strength adjustment")?;
            let op = ArithOp::from_char(op_char)
                .filter(|op| matches!(op, ArithOp::Add | ArithOp::Sub | ArithOp::Mul | ArithOp::Div))
                .ok_or_else(|| format!("invalid strength operator `{op_char}`"))?;
            let operand = chars.as_str().trim();
            let n = parse_number(operand)
                .ok_or_else(|| format!("invalid strength value `{operand}`"))?;
            if op == ArithOp::Div && n == 0 {
                return Err("strength division by zero".into());
            }
            entry.adjust = Some((op, n));
            Ok(())
        }
        "category" => {
            entry.category =
                Category::from_name(value).ok_or_else(|| format!("unknown category `{value}`"))?;
            Ok(())
        }
        _ => Err(format!("unknown directive `!:{name}`")),
    }
}

//  Literals

/// Parse a whole token as an integer (decimal, `0x` hex, leading-0 octal).
pub(crate) fn parse_number(s: &str) -> Option<i64> {
    match parse_number_prefix(s) {
        Some((n, "")) => Some(n),
        _ => None,
    }
}

/// Parse an integer prefix, returning the value and the unparsed rest.
pub(crate) fn parse_number_prefix(s: &str) -> Option<(i64, &str)> {
    let (negative, body) = match s.as_bytes().first()? {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let (radix, digits) = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        (16, hex)
    } else if body.len() > 1 && body.starts_with('0') && body.as_bytes()[1].is_ascii_digit() {
        (8, &body[1..])
    } else {
        (10, body)
    };

    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude = u64::from_str_radix(&digits[..end], radix).ok()? as i64;
    let value = if negative {
        magnitude.wrapping_neg()
    } else {
        magnitude
    };
    Some((value, &digits[end..]))
}

/// Decode C-style escapes of a string test value.
pub(crate) fn unescape(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        if b != b'\\' || i >= bytes.len() {
            out.push(b);
            continue;
        }
        let c = bytes[i];
        i += 1;
        match c {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'a' => out.push(0x07),
            b'0'..=b'7' => {
                let mut value = (c - b'0') as u32;
                let mut taken = 1;
                while taken < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                    value = value * 8 + (bytes[i] - b'0') as u32;
                    i += 1;
                    taken += 1;
                }
                out.push(value as u8);
            }
            b'x' => {
                let mut value = 0u32;
                let mut taken = 0;
                while taken < 2 && i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                    value = value * 16 + (bytes[i] as char).to_digit(16).unwrap_or(0);
                    i += 1;
                    taken += 1;
                }
                if taken == 0 {
                    out.push(b'x');
                } else {
                    out.push(value as u8);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(src: &str) -> SignatureDatabase {
        compile_str("test", src).unwrap()
    }

    #[test]
    fn test_parse_number_forms() {
        assert_eq!(parse_number("0x1F"), Some(31));
        assert_eq!(parse_number("017"), Some(15));
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("-4"), Some(-4));
        assert_eq!(parse_number("0"), Some(0));
        assert_eq!(parse_number("0xffffffffffffffff"), Some(-1));
        assert_eq!(parse_number("12ab"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("\\037\\213"), vec![0x1f, 0x8b]);
        assert_eq!(unescape("\\x89PNG"), b"\x89PNG".to_vec());
        assert_eq!(unescape("a\\ b"), b"a b".to_vec());
        assert_eq!(unescape("\\r\\n\\0"), vec![b'\r', b'\n', 0]);
        assert_eq!(unescape("\\<html"), b"<html".to_vec());
    }

    #[test]
    fn test_parse_simple_rule() {
        let db = single("0\tstring\t%PDF-\tPDF document\n!:mime\tapplication/pdf\n");
        assert_eq!(db.entries().len(), 1);
        let root = db.root(&db.entries()[0]);
        assert_eq!(root.message, "PDF document");
        assert_eq!(root.mime.as_deref(), Some("application/pdf"));
        assert!(matches!(&root.test, Test::Bytes { op: Compare::Eq, value } if value == b"%PDF-"));
    }

    #[test]
    fn test_children_are_contiguous() {
        let db = single(
            "0 byte 1 one\n>1 byte 2 two\n>>2 byte 3 three\n>1 byte 4 four\n>>2 byte 5 five\n",
        );
        let root = db.root(&db.entries()[0]);
        let kids = db.children(root);
        assert_eq!(kids.len(), 2);
        assert_eq!(kids[0].message, "two");
        assert_eq!(kids[1].message, "four");
        assert_eq!(db.children(&kids[0])[0].message, "three");
        assert_eq!(db.children(&kids[1])[0].message, "five");
    }

    #[test]
    fn test_indirect_offset_is_an_expression() {
        let db = single("0 string MZ\n>(0x3c.l+4) leshort 0x14c i386\n");
        let root = db.root(&db.entries()[0]);
        let child = &db.children(root)[0];
        match &child.offset.base {
            OffsetBase::Indirect(ind) => {
                assert_eq!(ind.at, 0x3c);
                assert_eq!(ind.width, IndirectWidth::LeLong);
                assert_eq!(ind.adjust, Some((ArithOp::Add, 4)));
                assert!(!ind.signed);
            }
            other => panic!("expected indirect offset, got {other:?}"),
        }
    }

    #[test]
    fn test_relative_and_negative_offsets() {
        assert_eq!(
            parse_offset("&4").unwrap(),
            Offset {
                relative: true,
                base: OffsetBase::Direct(4)
            }
        );
        assert_eq!(parse_offset("-16").unwrap(), Offset::absolute(-16));
        let ind = parse_offset("(&2,S*2)").unwrap();
        match ind.base {
            OffsetBase::Indirect(i) => {
                assert!(i.at_relative);
                assert!(i.signed);
                assert_eq!(i.width, IndirectWidth::BeShort);
                assert_eq!(i.adjust, Some((ArithOp::Mul, 2)));
            }
            OffsetBase::Direct(_) => panic!("expected indirect"),
        }
    }

    #[test]
    fn test_parse_type_modifiers() {
        let ty = parse_type("ubelong&0xff00").unwrap();
        assert_eq!(ty.kind, TypeKind::Long);
        assert_eq!(ty.endian, Endian::Big);
        assert!(ty.unsigned);
        assert_eq!(ty.mask, Some((ArithOp::And, 0xff00)));

        let ty = parse_type("search/1024/cW").unwrap();
        assert_eq!(ty.range, 1024);
        assert!(ty.flags.contains(StrFlags::IGNORE_LOWERCASE | StrFlags::COMPACT_WHITESPACE));

        let ty = parse_type("regex/1l").unwrap();
        assert_eq!(ty.range, 1);
        assert!(ty.flags.contains(StrFlags::LINES));

        let ty = parse_type("pstring/HJ").unwrap();
        assert_eq!(ty.pstring, PStringWidth::BeShort);
        assert!(ty.flags.contains(StrFlags::PSTRING_INCLUSIVE));

        // `use` must not be read as unsigned `se`.
        assert_eq!(parse_type("use").unwrap().kind, TypeKind::Use);
    }

    #[test]
    fn test_numeric_comparators() {
        let ty = parse_type("byte").unwrap();
        assert!(matches!(parse_test(&ty, "&0x80").unwrap(), Test::Int { op: Compare::AllSet, value: 0x80 }));
        assert!(matches!(parse_test(&ty, "^0x80").unwrap(), Test::Int { op: Compare::AnyClear, value: 0x80 }));
        assert!(matches!(parse_test(&ty, "~0").unwrap(), Test::Int { op: Compare::Eq, value: -1 }));
        assert!(matches!(parse_test(&ty, ">8").unwrap(), Test::Int { op: Compare::Gt, value: 8 }));
        assert!(matches!(parse_test(&ty, "x").unwrap(), Test::Any));
    }

    #[test]
    fn test_use_with_flip() {
        let db = single("0 name elf-le\n>16 leshort 2 executable\n0 string \\177ELF ELF\n>0 use \\^elf-le\n");
        let elf = db.candidates().next().unwrap();
        let child = &db.children(db.root(elf))[0];
        assert!(matches!(&child.test, Test::Name { name, flip: true } if name == "elf-le"));
        assert!(db.named("elf-le").is_some());
        assert_eq!(db.candidates().count(), 1);
    }

    #[test]
    fn test_message_backspace() {
        let db = single("0 byte 1 one\n>1 byte x \\b, two\n");
        let child = &db.children(db.root(&db.entries()[0]))[0];
        assert!(child.no_space);
        assert_eq!(child.message, ", two");
    }

    #[test]
    fn test_directives_attach() {
        let db = single(
            "0 string BZh bzip2\n!:category compress\n!:strength +30\n>3 byte x \\b, block\n!:mime application/x-bzip2\n",
        );
        let entry = &db.entries()[0];
        assert_eq!(entry.category, Category::Compress);
        let root = db.root(entry);
        assert!(root.mime.is_none());
        assert_eq!(db.children(root)[0].mime.as_deref(), Some("application/x-bzip2"));
        // base 20 + 3 chars * 10 + `=` 10, adjusted by +30
        assert_eq!(entry.strength, 90);
    }

    #[test]
    fn test_strength_orders_entries() {
        let db = single("0 byte 0x50 weak\n0 string PK\\003\\004 strong\n");
        assert_eq!(db.root(&db.entries()[0]).message, "strong");
        assert_eq!(db.root(&db.entries()[1]).message, "weak");
    }

    #[test]
    fn test_ties_keep_source_order() {
        let db = single("0 string AB first\n0 string CD second\n");
        assert_eq!(db.root(&db.entries()[0]).message, "first");
        assert_eq!(db.root(&db.entries()[1]).message, "second");
    }

    #[test]
    fn test_errors_carry_file_and_line() {
        let err = compile_str("bad.magic", "# comment\n0 string A ok\n0 wibble 1 nope\n").unwrap_err();
        match err {
            RulesError::Syntax { file, line, message } => {
                assert_eq!(file, "bad.magic");
                assert_eq!(line, 3);
                assert!(message.contains("wibble"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_inconsistent_nesting_rejected() {
        let err = compile_str("n", "0 byte 1 a\n>>1 byte 2 b\n").unwrap_err();
        assert!(matches!(err, RulesError::Syntax { line: 2, .. }));
        let err = compile_str("n", ">1 byte 2 b\n").unwrap_err();
        assert!(matches!(err, RulesError::Syntax { line: 1, .. }));
    }

    #[test]
    fn test_bad_literal_and_directive_rejected() {
        assert!(compile_str("n", "0 long 12zz bad\n").is_err());
        assert!(compile_str("n", "!:mime text/plain\n").is_err());
        assert!(compile_str("n", "0 byte 1 a\n!:bogus 1\n").is_err());
        assert!(compile_str("n", "0 byte 1 a\n!:category nonsense\n").is_err());
        assert!(compile_str("n", "0 regex [unclosed bad\n").is_err());
    }

    #[test]
    fn test_batch_is_atomic() {
        let err = compile_sources(&[("good", "0 byte 1 a\n"), ("bad", "0 nope 1 b\n")]);
        assert!(err.is_err());
    }

    #[test]
    fn test_check_mode_collects_warnings() {
        let mut compiler = Compiler::new().with_check(true);
        compiler
            .add_source(
                "lint",
                "0 byte 0x1ff too big\n0 string AB\n0 string CD cd\n!:mime nosubtype\n",
            )
            .unwrap();
        assert_eq!(compiler.warnings().len(), 3);
        assert!(compiler.finish().is_ok());
    }

    #[test]
    fn test_directory_sources_in_name_order() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("b"), "0 string BB second\n").unwrap();
        fs::write(dir.path().join("a"), "0 string AA first\n").unwrap();
        let db = compile_files(&[dir.path().to_path_buf()]).unwrap();
        assert!(db.entries()[0].source.ends_with('a'));
        assert!(db.entries()[1].source.ends_with('b'));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = compile_files(&[PathBuf::from("/nonexistent/magic/file")]).unwrap_err();
        assert!(matches!(err, RulesError::Read { .. }));
    }
}
