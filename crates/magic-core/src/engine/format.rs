//! printf-style substitution of matched values into rule messages.

use chrono::{DateTime, Local, Utc};

/// Value read by a matching rule, as made available to its message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    None,
    /// `value` is sign- or zero-extended according to the rule's type.
    Int { value: i64, width: usize },
    Float(f64),
    Str(Vec<u8>),
}

const DATE_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Render seconds since the epoch the way `date`-type rules print.
pub(crate) fn format_date(secs: i64, local: bool) -> String {
    match DateTime::<Utc>::from_timestamp(secs, 0) {
        Some(t) if local => t.with_timezone(&Local).format(DATE_FORMAT).to_string(),
        Some(t) => t.format(DATE_FORMAT).to_string(),
        None => "*Invalid time*".to_string(),
    }
}

/// Bytes as text. Unless `raw`, anything outside printable ASCII is
/// written as a three-digit octal escape.
pub(crate) fn printable(bytes: &[u8], raw: bool) -> String {
    if raw {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if (0x20..0x7f).contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{b:03o}"));
        }
    }
    out
}

/// Upper bound on a conversion's width and precision.
const MAX_FIELD: usize = 1024;

#[derive(Debug, Default)]
struct Spec {
    left: bool,
    zero: bool,
    alt: bool,
    plus: bool,
    space: bool,
    width: usize,
    precision: Option<usize>,
    conv: char,
}

/// Expand `%` conversions in `msg` with `value`.
pub(crate) fn format_message(msg: &str, value: &Value, raw: bool) -> String {
    if !msg.contains('%') {
        return msg.to_string();
    }

    let mut out = String::with_capacity(msg.len() + 16);
    let mut chars = msg.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if let Some((_, '%')) = chars.peek() {
            chars.next();
            out.push('%');
            continue;
        }

        let mut spec = Spec::default();
        while let Some(&(_, f)) = chars.peek() {
            match f {
                '-' => spec.left = true,
                '0' => spec.zero = true,
                '#' => spec.alt = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                _ => break,
            }
            chars.next();
        }
        spec.width = take_digits(&mut chars).unwrap_or(0);
        if let Some((_, '.')) = chars.peek() {
            chars.next();
            spec.precision = Some(take_digits(&mut chars).unwrap_or(0));
        }
        while let Some(&(_, m)) = chars.peek() {
            if matches!(m, 'h' | 'l' | 'q' | 'j' | 'z' | 't' | 'L') {
                chars.next();
            } else {
                break;
            }
        }

        match chars.next() {
            Some((_, conv)) if "diuxXocsfeEgG".contains(conv) => {
                spec.conv = conv;
                out.push_str(&render(&spec, value, raw));
            }
            Some((end, conv)) => {
                out.push_str(&msg[start..end + conv.len_utf8()]);
            }
            None => out.push_str(&msg[start..]),
        }
    }
    out
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> Option<usize> {
    let mut n: Option<usize> = None;
    while let Some(&(_, d)) = chars.peek() {
        let Some(digit) = d.to_digit(10) else { break };
        n = Some((n.unwrap_or(0) * 10 + digit as usize).min(MAX_FIELD));
        chars.next();
    }
    n
}

fn unsigned_of(value: i64, width: usize) -> u64 {
    if width == 0 || width >= 8 {
        value as u64
    } else {
        (value as u64) & ((1u64 << (width * 8)) - 1)
    }
}

fn render(spec: &Spec, value: &Value, raw: bool) -> String {
    let (body, numeric) = match (spec.conv, value) {
        ('s', Value::Str(bytes)) => {
            let cut = spec.precision.map_or(bytes.len(), |p| p.min(bytes.len()));
            (printable(&bytes[..cut], raw), false)
        }
        ('s', Value::Int { value, .. }) => (value.to_string(), false),
        ('s', Value::Float(f)) => (f.to_string(), false),
        ('c', Value::Int { value, .. }) => (printable(&[*value as u8], raw), false),
        ('c', Value::Str(bytes)) => (printable(&bytes[..bytes.len().min(1)], raw), false),
        (_, Value::Str(bytes)) => (printable(bytes, raw), false),
        (_, Value::None) => (String::new(), false),
        ('d' | 'i', Value::Int { value, .. }) => (signed(*value, spec), true),
        ('d' | 'i', Value::Float(f)) => (signed(*f as i64, spec), true),
        ('u' | 'x' | 'X' | 'o', Value::Int { value, width }) => {
            (radix(unsigned_of(*value, *width), spec), true)
        }
        ('u' | 'x' | 'X' | 'o', Value::Float(f)) => (radix(*f as u64, spec), true),
        ('f' | 'e' | 'E' | 'g' | 'G', Value::Float(f)) => (float(*f, spec), true),
        ('f' | 'e' | 'E' | 'g' | 'G', Value::Int { value, .. }) => (float(*value as f64, spec), true),
        _ => (String::new(), false),
    };
    pad(body, spec, numeric)
}

fn signed(v: i64, spec: &Spec) -> String {
    if v >= 0 && spec.plus {
        format!("+{v}")
    } else if v >= 0 && spec.space {
        format!(" {v}")
    } else {
        v.to_string()
    }
}

fn radix(v: u64, spec: &Spec) -> String {
    match spec.conv {
        'x' if spec.alt && v != 0 => format!("0x{v:x}"),
        'x' => format!("{v:x}"),
        'X' if spec.alt && v != 0 => format!("0X{v:X}"),
        'X' => format!("{v:X}"),
        'o' if spec.alt && v != 0 => format!("0{v:o}"),
        'o' => format!("{v:o}"),
        _ => v.to_string(),
    }
}

fn float(v: f64, spec: &Spec) -> String {
    let precision = spec.precision.unwrap_or(6);
    match spec.conv {
        'f' => format!("{v:.precision$}"),
        'e' | 'E' => {
            let s = c_exponent(&format!("{v:.precision$e}"));
            if spec.conv == 'E' { s.to_uppercase() } else { s }
        }
        _ => {
            let s = format!("{v}");
            if spec.conv == 'G' { s.to_uppercase() } else { s }
        }
    }
}

/// `1.5e3` -> `1.5e+03`
fn c_exponent(s: &str) -> String {
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => s.to_string(),
    }
}

fn pad(body: String, spec: &Spec, numeric: bool) -> String {
    let len = body.chars().count();
    if len >= spec.width {
        return body;
    }
    let fill = spec.width - len;
    if spec.left {
        return format!("{body}{}", " ".repeat(fill));
    }
    if spec.zero && numeric {
        let sign_len = body
            .strip_prefix(['-', '+', ' '])
            .map_or(0, |_| 1);
        let prefix_len = if body[sign_len..].starts_with("0x") || body[sign_len..].starts_with("0X") {
            sign_len + 2
        } else {
            sign_len
        };
        let (head, tail) = body.split_at(prefix_len);
        return format!("{head}{}{tail}", "0".repeat(fill));
    }
    format!("{}{body}", " ".repeat(fill))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64, width: usize) -> Value {
        Value::Int { value: v, width }
    }

    #[test]
    fn test_plain_message_untouched() {
        assert_eq!(format_message("PDF document", &Value::None, false), "PDF document");
    }

    #[test]
    fn test_integer_conversions() {
        assert_eq!(format_message("version %d", &int(3, 1), false), "version 3");
        assert_eq!(format_message("%u", &int(-1, 1), false), "255");
        assert_eq!(format_message("%x", &int(255, 2), false), "ff");
        assert_eq!(format_message("%#x", &int(255, 2), false), "0xff");
        assert_eq!(format_message("%04X", &int(0xab, 2), false), "00AB");
        assert_eq!(format_message("%#06x", &int(0xab, 2), false), "0x00ab");
        assert_eq!(format_message("%lld bytes", &int(-5, 8), false), "-5 bytes");
        assert_eq!(format_message("%o", &int(8, 1), false), "10");
        assert_eq!(format_message("[%-4d]", &int(7, 1), false), "[7   ]");
        assert_eq!(format_message("[%3d]", &int(7, 1), false), "[  7]");
        assert_eq!(format_message("\\b.%02u", &int(1, 1), false), "\\b.01");
    }

    #[test]
    fn test_huge_width_is_clamped() {
        let out = format_message("%99999999999999999999999d", &int(7, 1), false);
        assert_eq!(out.len(), MAX_FIELD);
        assert!(out.ends_with('7'));
        let out = format_message("%.99999999999999999999f", &Value::Float(1.5), false);
        assert_eq!(out.len(), MAX_FIELD + 2);
    }

    #[test]
    fn test_char_and_string() {
        assert_eq!(format_message("version %c", &int(b'1' as i64, 1), false), "version 1");
        assert_eq!(
            format_message("was \"%s\"", &Value::Str(b"a.txt".to_vec()), false),
            "was \"a.txt\""
        );
        assert_eq!(
            format_message("level %.3s", &Value::Str(b"3.0 EPSF".to_vec()), false),
            "level 3.0"
        );
    }

    #[test]
    fn test_unprintable_escaped_unless_raw() {
        let v = Value::Str(vec![b'a', 0x01, 0xff]);
        assert_eq!(format_message("%s", &v, false), "a\\001\\377");
        assert_eq!(format_message("%c", &int(7, 1), false), "\\007");
        assert_eq!(format_message("%s", &Value::Str(b"ok".to_vec()), true), "ok");
    }

    #[test]
    fn test_float_conversions() {
        assert_eq!(format_message("%f", &Value::Float(1.5), false), "1.500000");
        assert_eq!(format_message("%.2f", &Value::Float(1.5), false), "1.50");
        assert_eq!(format_message("%e", &Value::Float(1500.0), false), "1.500000e+03");
        assert_eq!(format_message("%g", &Value::Float(0.25), false), "0.25");
    }

    #[test]
    fn test_percent_literal_and_unknown() {
        assert_eq!(format_message("100%%", &int(1, 1), false), "100%");
        assert_eq!(format_message("50%k", &int(1, 1), false), "50%k");
        assert_eq!(format_message("trailing %", &int(1, 1), false), "trailing %");
    }

    #[test]
    fn test_dates() {
        assert_eq!(format_date(0, false), "Thu Jan  1 00:00:00 1970");
        assert_eq!(format_date(1_000_000_000, false), "Sun Sep  9 01:46:40 2001");
        assert_eq!(format_date(i64::MAX, false), "*Invalid time*");
    }
}
