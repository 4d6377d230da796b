//! Entry strength: how specific a top-level test is.
//!
//! Longer literal patterns and exact comparisons score higher; inequality
//! and mask tests score lower. The score decides evaluation order.

use crate::types::{ArithOp, Compare, MagicRule, Test, TypeKind};

const MULT: i32 = 10;

/// Strength of the rule alone, before any `!:strength` adjustment.
pub fn rule_strength(rule: &MagicRule) -> i32 {
    let kind = rule.ty.kind;
    if matches!(
        kind,
        TypeKind::Default | TypeKind::Clear | TypeKind::Name | TypeKind::Use | TypeKind::Indirect
    ) {
        return 0;
    }

    let mut value = 2 * MULT;
    let literal_len = match &rule.test {
        Test::Bytes { value, .. } => value.len() as i32,
        Test::Regex(re) => re.pattern.len() as i32,
        _ => 0,
    };

    value += match kind {
        k if k.is_numeric() => k.width() as i32 * MULT,
        TypeKind::String | TypeKind::PString => literal_len * MULT,
        TypeKind::String16 => literal_len * MULT / 2,
        TypeKind::Search | TypeKind::Regex => {
            let n = literal_len.max(1);
            n * (MULT / n).max(1)
        }
        _ => 0,
    };

    match &rule.test {
        Test::Any => value = 0,
        Test::Regex(_) => value += MULT,
        Test::Int { op, .. } | Test::Float { op, .. } | Test::Bytes { op, .. } => match op {
            Compare::Eq | Compare::Ne => value += MULT,
            Compare::Lt | Compare::Gt => value -= 2 * MULT,
            Compare::AllSet | Compare::AnyClear => value -= MULT,
        },
        Test::Name { .. } => {}
    }
    value
}

/// Final strength of an entry: rule strength, optional adjustment, never
/// below 1.
pub fn entry_strength(root: &MagicRule, adjust: Option<(ArithOp, i64)>) -> i32 {
    let mut value = rule_strength(root) as i64;
    if let Some((op, n)) = adjust {
        value = op.apply(value, n).unwrap_or(value);
    }
    value.clamp(1, i32::MAX as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_str;

    fn strength_of(line: &str) -> i32 {
        let db = compile_str("s", line).unwrap();
        db.entries()[0].strength
    }

    #[test]
    fn test_numeric_strength_grows_with_width() {
        assert_eq!(strength_of("0 byte 1 b\n"), 40);
        assert_eq!(strength_of("0 short 1 s\n"), 50);
        assert_eq!(strength_of("0 belong 1 l\n"), 70);
        assert_eq!(strength_of("0 lequad 1 q\n"), 110);
    }

    #[test]
    fn test_string_strength_grows_with_length() {
        assert!(strength_of("0 string ABCDEFGH long\n") > strength_of("0 string AB short\n"));
        assert_eq!(strength_of("0 string %PDF- pdf\n"), 80);
    }

    #[test]
    fn test_comparators_adjust() {
        assert_eq!(strength_of("0 byte >1 gt\n"), 10);
        assert_eq!(strength_of("0 byte &1 mask\n"), 20);
        assert_eq!(strength_of("0 byte !1 ne\n"), 40);
    }

    #[test]
    fn test_any_and_structural_clamp_to_one() {
        assert_eq!(strength_of("0 byte x any\n"), 1);
        assert_eq!(strength_of("0 name sub\n>0 byte 1 one\n"), 1);
    }

    #[test]
    fn test_adjustment_applies() {
        assert_eq!(strength_of("0 byte 1 b\n!:strength +15\n"), 55);
        assert_eq!(strength_of("0 byte 1 b\n!:strength *2\n"), 80);
        assert_eq!(strength_of("0 byte 1 b\n!:strength -100\n"), 1);
    }
}
