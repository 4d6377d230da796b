//! Precompiled database format.
//!
//! Little-endian throughout:
//!
//! ```text
//! u32 magic "RMGC" | u32 version | u32 rule count | u32 entry count
//! rule * rule count
//! entry * entry count
//! ```
//!
//! Strings and byte strings are a `u32` length followed by the bytes.
//! Regexes are stored as pattern text and rebuilt on load.

use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::types::*;

/// Upper bound on any single string or byte string in a database.
const MAX_BLOB: usize = 16 * 1024 * 1024;

//  Public API

/// Serialize `db` to `w`.
pub fn write_database(db: &SignatureDatabase, w: &mut impl Write) -> Result<(), RulesError> {
    write_u32(w, DB_MAGIC)?;
    write_u32(w, DB_VERSION)?;
    write_u32(w, db.rules().len() as u32)?;
    write_u32(w, db.entries().len() as u32)?;

    for rule in db.rules() {
        write_rule(w, rule)?;
    }
    for entry in db.entries() {
        write_u32(w, entry.root)?;
        write_i32(w, entry.strength)?;
        write_u8(w, entry.category as u8)?;
        write_u32(w, entry.order)?;
        write_str(w, &entry.key)?;
        write_str(w, &entry.source)?;
    }
    Ok(())
}

/// Deserialize a database, rejecting anything that is not a complete,
/// current-version image.
pub fn read_database(r: &mut impl Read) -> Result<SignatureDatabase, RulesError> {
    let magic = read_u32(r)?;
    if magic != DB_MAGIC {
        return Err(RulesError::BadMagic(magic));
    }
    let version = read_u32(r)?;
    if version != DB_VERSION {
        return Err(RulesError::IncompatibleVersion {
            found: version,
            expected: DB_VERSION,
        });
    }
    let rule_count = read_u32(r)? as usize;
    let entry_count = read_u32(r)? as usize;

    let mut rules = Vec::with_capacity(rule_count.min(1 << 16));
    for _ in 0..rule_count {
        rules.push(read_rule(r)?);
    }

    let mut entries = Vec::with_capacity(entry_count.min(1 << 16));
    for _ in 0..entry_count {
        entries.push(Entry {
            root: read_u32(r)?,
            strength: read_i32(r)?,
            category: Category::try_from(read_u8(r)?)?,
            order: read_u32(r)?,
            key: read_string(r)?,
            source: read_string(r)?,
        });
    }

    let mut rest = [0u8; 1];
    if r.read(&mut rest)? != 0 {
        return Err(RulesError::Corrupt("trailing data after last entry".into()));
    }

    SignatureDatabase::from_parts(rules, entries)
}

/// Write `db` to `path`, replacing any existing file.
pub fn save(db: &SignatureDatabase, path: &Path) -> Result<(), RulesError> {
    let file = fs::File::create(path).map_err(|source| RulesError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let mut w = BufWriter::new(file);
    write_database(db, &mut w)?;
    w.flush().map_err(|source| RulesError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), entries = db.entries().len(), "saved database");
    Ok(())
}

/// Read a database image from `path`.
pub fn load(path: &Path) -> Result<SignatureDatabase, RulesError> {
    let bytes = fs::read(path).map_err(|source| RulesError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let db = read_database(&mut bytes.as_slice())?;
    debug!(path = %path.display(), entries = db.entries().len(), "loaded database");
    Ok(db)
}

//  Rules

fn write_rule(w: &mut impl Write, rule: &MagicRule) -> Result<(), RulesError> {
    write_u8(w, rule.level)?;
    write_u32(w, rule.line)?;

    write_bool(w, rule.offset.relative)?;
    match &rule.offset.base {
        OffsetBase::Direct(at) => {
            write_u8(w, 0)?;
            write_i64(w, *at)?;
        }
        OffsetBase::Indirect(ind) => {
            write_u8(w, 1)?;
            write_i64(w, ind.at)?;
            write_bool(w, ind.at_relative)?;
            write_u8(w, ind.width as u8)?;
            write_bool(w, ind.signed)?;
            write_arith(w, ind.adjust)?;
        }
    }

    let ty = &rule.ty;
    write_u8(w, ty.kind as u8)?;
    write_u8(w, ty.endian as u8)?;
    write_bool(w, ty.unsigned)?;
    write_arith(w, ty.mask)?;
    write_u16(w, ty.flags.bits())?;
    write_u32(w, ty.range)?;
    write_u8(w, ty.pstring as u8)?;

    match &rule.test {
        Test::Any => write_u8(w, 0)?,
        Test::Int { op, value } => {
            write_u8(w, 1)?;
            write_u8(w, *op as u8)?;
            write_i64(w, *value)?;
        }
        Test::Float { op, value } => {
            write_u8(w, 2)?;
            write_u8(w, *op as u8)?;
            w.write_all(&value.to_le_bytes())?;
        }
        Test::Bytes { op, value } => {
            write_u8(w, 3)?;
            write_u8(w, *op as u8)?;
            write_bytes(w, value)?;
        }
        Test::Regex(re) => {
            write_u8(w, 4)?;
            write_str(w, &re.pattern)?;
        }
        Test::Name { name, flip } => {
            write_u8(w, 5)?;
            write_str(w, name)?;
            write_bool(w, *flip)?;
        }
    }

    write_str(w, &rule.message)?;
    write_bool(w, rule.no_space)?;
    write_opt_str(w, rule.mime.as_deref())?;
    write_opt_str(w, rule.ext.as_deref())?;
    write_opt_str(w, rule.apple.as_deref())?;
    write_u32(w, rule.children.start)?;
    write_u32(w, rule.children.len)?;
    Ok(())
}

fn read_rule(r: &mut impl Read) -> Result<MagicRule, RulesError> {
    let level = read_u8(r)?;
    let line = read_u32(r)?;

    let relative = read_bool(r)?;
    let base = match read_u8(r)? {
        0 => OffsetBase::Direct(read_i64(r)?),
        1 => OffsetBase::Indirect(IndirectOffset {
            at: read_i64(r)?,
            at_relative: read_bool(r)?,
            width: IndirectWidth::try_from(read_u8(r)?)?,
            signed: read_bool(r)?,
            adjust: read_arith(r)?,
        }),
        tag => return Err(RulesError::Corrupt(format!("invalid offset tag {tag}"))),
    };

    let kind = TypeKind::try_from(read_u8(r)?)?;
    let ty = TypeSpec {
        kind,
        endian: Endian::try_from(read_u8(r)?)?,
        unsigned: read_bool(r)?,
        mask: read_arith(r)?,
        flags: StrFlags::from_bits(read_u16(r)?)
            .ok_or_else(|| RulesError::Corrupt("invalid string modifiers".into()))?,
        range: read_u32(r)?,
        pstring: PStringWidth::try_from(read_u8(r)?)?,
    };

    let test = match read_u8(r)? {
        0 => Test::Any,
        1 => Test::Int {
            op: Compare::try_from(read_u8(r)?)?,
            value: read_i64(r)?,
        },
        2 => Test::Float {
            op: Compare::try_from(read_u8(r)?)?,
            value: read_f64(r)?,
        },
        3 => Test::Bytes {
            op: Compare::try_from(read_u8(r)?)?,
            value: read_bytes(r)?,
        },
        4 => {
            let pattern = read_string(r)?;
            let re = RegexTest::new(&pattern, ty.flags)
                .map_err(|e| RulesError::Corrupt(format!("invalid regex `{pattern}`: {e}")))?;
            Test::Regex(re)
        }
        5 => Test::Name {
            name: read_string(r)?,
            flip: read_bool(r)?,
        },
        tag => return Err(RulesError::Corrupt(format!("invalid test tag {tag}"))),
    };

    Ok(MagicRule {
        level,
        line,
        offset: Offset { relative, base },
        ty,
        test,
        message: read_string(r)?,
        no_space: read_bool(r)?,
        mime: read_opt_string(r)?,
        ext: read_opt_string(r)?,
        apple: read_opt_string(r)?,
        children: ChildRange {
            start: read_u32(r)?,
            len: read_u32(r)?,
        },
    })
}

fn write_arith(w: &mut impl Write, arith: Option<(ArithOp, i64)>) -> Result<(), RulesError> {
    match arith {
        None => write_u8(w, 0),
        Some((op, n)) => {
            write_u8(w, 1)?;
            write_u8(w, op as u8)?;
            write_i64(w, n)
        }
    }
}

fn read_arith(r: &mut impl Read) -> Result<Option<(ArithOp, i64)>, RulesError> {
    if !read_bool(r)? {
        return Ok(None);
    }
    let op = ArithOp::try_from(read_u8(r)?)?;
    Ok(Some((op, read_i64(r)?)))
}

//  Primitives

fn fill(r: &mut impl Read, buf: &mut [u8]) -> Result<(), RulesError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => RulesError::Truncated,
        _ => RulesError::Io(e),
    })
}

fn read_u8(r: &mut impl Read) -> Result<u8, RulesError> {
    let mut buf = [0u8; 1];
    fill(r, &mut buf)?;
    Ok(buf[0])
}

fn read_bool(r: &mut impl Read) -> Result<bool, RulesError> {
    match read_u8(r)? {
        0 => Ok(false),
        1 => Ok(true),
        v => Err(RulesError::Corrupt(format!("invalid boolean {v}"))),
    }
}

fn read_u16(r: &mut impl Read) -> Result<u16, RulesError> {
    let mut buf = [0u8; 2];
    fill(r, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> Result<u32, RulesError> {
    let mut buf = [0u8; 4];
    fill(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32(r: &mut impl Read) -> Result<i32, RulesError> {
    let mut buf = [0u8; 4];
    fill(r, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_i64(r: &mut impl Read) -> Result<i64, RulesError> {
    let mut buf = [0u8; 8];
    fill(r, &mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_f64(r: &mut impl Read) -> Result<f64, RulesError> {
    let mut buf = [0u8; 8];
    fill(r, &mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>, RulesError> {
    let len = read_u32(r)? as usize;
    if len > MAX_BLOB {
        return Err(RulesError::Corrupt(format!("string length {len} too large")));
    }
    let mut buf = vec![0u8; len];
    fill(r, &mut buf)?;
    Ok(buf)
}

fn read_string(r: &mut impl Read) -> Result<String, RulesError> {
    String::from_utf8(read_bytes(r)?).map_err(|_| RulesError::Corrupt("string is not UTF-8".into()))
}

fn read_opt_string(r: &mut impl Read) -> Result<Option<String>, RulesError> {
    if read_bool(r)? {
        Ok(Some(read_string(r)?))
    } else {
        Ok(None)
    }
}

fn write_u8(w: &mut impl Write, v: u8) -> Result<(), RulesError> {
    w.write_all(&[v])?;
    Ok(())
}

fn write_bool(w: &mut impl Write, v: bool) -> Result<(), RulesError> {
    write_u8(w, v as u8)
}

fn write_u16(w: &mut impl Write, v: u16) -> Result<(), RulesError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u32(w: &mut impl Write, v: u32) -> Result<(), RulesError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_i32(w: &mut impl Write, v: i32) -> Result<(), RulesError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_i64(w: &mut impl Write, v: i64) -> Result<(), RulesError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_bytes(w: &mut impl Write, v: &[u8]) -> Result<(), RulesError> {
    write_u32(w, v.len() as u32)?;
    w.write_all(v)?;
    Ok(())
}

fn write_str(w: &mut impl Write, v: &str) -> Result<(), RulesError> {
    write_bytes(w, v.as_bytes())
}

fn write_opt_str(w: &mut impl Write, v: Option<&str>) -> Result<(), RulesError> {
    match v {
        None => write_bool(w, false),
        Some(s) => {
            write_bool(w, true)?;
            write_str(w, s)
        }
    }
}
