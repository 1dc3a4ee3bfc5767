//! Value coercion helpers for query evaluation
//!
//! Free functions over [`FieldValue`] and [`TypeCode`]: type promotion for
//! binary operations, conversion between value types, arithmetic with
//! promotion, and the small parsers query declarations need.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use stead_core::{FieldValue, SteadError, SteadResult, TypeCode};

// =============================================================================
// Types
// =============================================================================

/// Type code of a value; `None` for null
pub fn type_of(value: &FieldValue) -> Option<TypeCode> {
    Some(match value {
        FieldValue::Null => return None,
        FieldValue::Boolean(_) => TypeCode::Boolean,
        FieldValue::Byte(_) => TypeCode::Byte,
        FieldValue::Char(_) => TypeCode::Char,
        FieldValue::Short(_) => TypeCode::Short,
        FieldValue::Int(_) => TypeCode::Int,
        FieldValue::Long(_) => TypeCode::Long,
        FieldValue::Float(_) => TypeCode::Float,
        FieldValue::Double(_) => TypeCode::Double,
        FieldValue::String(_) => TypeCode::String,
        FieldValue::Date(_) => TypeCode::Date,
        FieldValue::Ref(_) => TypeCode::Pc,
        FieldValue::ObjectId(_) => TypeCode::Oid,
        FieldValue::Collection { .. } => TypeCode::Collection,
        FieldValue::Map(_) => TypeCode::Map,
        FieldValue::Array(_) => TypeCode::Array,
        FieldValue::Object(_) => TypeCode::Object,
    })
}

fn is_temporal(code: TypeCode) -> bool {
    matches!(code, TypeCode::Date | TypeCode::Calendar)
}

fn is_nonstandard(code: TypeCode) -> bool {
    matches!(
        code,
        TypeCode::Array
            | TypeCode::Collection
            | TypeCode::Map
            | TypeCode::Pc
            | TypeCode::PcUntyped
            | TypeCode::Oid
            | TypeCode::Object
    )
}

/// Type both operands of a binary operation are converted to first
pub fn promote(a: TypeCode, b: TypeCode) -> TypeCode {
    if a == b {
        return a;
    }
    let (a_num, b_num) = (a.is_numeric(), b.is_numeric());
    if a_num && b_num {
        return if a == TypeCode::Number || b == TypeCode::Number {
            TypeCode::Number
        } else if a == TypeCode::Double || b == TypeCode::Double {
            TypeCode::Double
        } else if a == TypeCode::Float || b == TypeCode::Float {
            TypeCode::Float
        } else if a == TypeCode::Long || b == TypeCode::Long {
            TypeCode::Long
        } else {
            TypeCode::Int
        };
    }
    if a_num || b_num {
        let (num, other) = if a_num { (a, b) } else { (b, a) };
        let textual = matches!(other, TypeCode::Char | TypeCode::String);
        if textual && matches!(num, TypeCode::Byte | TypeCode::Short) {
            return TypeCode::Int;
        }
        return num;
    }
    match (a, b) {
        (TypeCode::Char, TypeCode::String) | (TypeCode::String, TypeCode::Char) => TypeCode::String,
        (TypeCode::Object, other) | (other, TypeCode::Object) => other,
        (x, y) if is_temporal(x) && is_temporal(y) => TypeCode::Date,
        (x, y) if is_nonstandard(x) && is_nonstandard(y) => TypeCode::Object,
        (x, y) if is_nonstandard(x) => y,
        (x, y) if is_nonstandard(y) => x,
        _ => TypeCode::Object,
    }
}

/// Whether a value of type `from` can be converted to `to`. Strict mode
/// refuses conversions to and from strings other than single characters.
pub fn can_convert(from: TypeCode, to: TypeCode, strict: bool) -> bool {
    if from == to || to == TypeCode::Object {
        return true;
    }
    let (from_num, to_num) = (from.is_numeric(), to.is_numeric());
    if from_num && to_num {
        return true;
    }
    if (from_num && (to == TypeCode::Char || (!strict && to == TypeCode::String)))
        || (to_num && (from == TypeCode::Char || (!strict && from == TypeCode::String)))
    {
        return true;
    }
    if from == TypeCode::String && to == TypeCode::Char {
        return true;
    }
    if to == TypeCode::String {
        return !strict;
    }
    if from == TypeCode::String && is_temporal(to) {
        return true;
    }
    is_temporal(from) && is_temporal(to)
}

/// Value a null of type `code` reads as in arithmetic and aggregates
pub fn default_for_null(code: TypeCode) -> FieldValue {
    match code {
        TypeCode::Long => FieldValue::Long(0),
        TypeCode::Int => FieldValue::Int(0),
        TypeCode::Double => FieldValue::Double(0.0),
        TypeCode::Float => FieldValue::Float(0.0),
        TypeCode::Short => FieldValue::Short(0),
        _ => FieldValue::Null,
    }
}

// =============================================================================
// Conversion
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Real(f64),
}

impl Num {
    fn of(value: &FieldValue) -> Option<Num> {
        Some(match value {
            FieldValue::Byte(v) => Num::Int(i64::from(*v)),
            FieldValue::Short(v) => Num::Int(i64::from(*v)),
            FieldValue::Int(v) => Num::Int(i64::from(*v)),
            FieldValue::Long(v) => Num::Int(*v),
            FieldValue::Float(v) => Num::Real(f64::from(*v)),
            FieldValue::Double(v) => Num::Real(*v),
            _ => return None,
        })
    }

    fn as_i64(self) -> i64 {
        match self {
            Num::Int(v) => v,
            Num::Real(v) => v as i64,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(v) => v as f64,
            Num::Real(v) => v,
        }
    }
}

fn cannot_convert(value: &FieldValue, to: TypeCode) -> SteadError {
    SteadError::user(format!(
        "cannot convert {} value {:?} to {:?}",
        value.type_name(),
        value,
        to
    ))
}

/// Numeric narrowing permitted in strict mode
fn allow_numeric(from: TypeCode, to: TypeCode, strict: bool) -> bool {
    if !strict || from == to {
        return true;
    }
    match from {
        TypeCode::Double => to == TypeCode::Float,
        TypeCode::Float => to == TypeCode::Double,
        TypeCode::Int => matches!(to, TypeCode::Long | TypeCode::Short),
        TypeCode::Long => matches!(to, TypeCode::Int | TypeCode::Short),
        TypeCode::Short => matches!(to, TypeCode::Long | TypeCode::Int),
        _ => false,
    }
}

/// Convert `value` to type `to`, non-strictly
pub fn convert(value: &FieldValue, to: TypeCode) -> SteadResult<FieldValue> {
    convert_with(value, to, false)
}

/// Convert `value` to type `to`. With `strict`, numeric conversions that
/// may lose information and number/string conversions fail.
pub fn convert_with(value: &FieldValue, to: TypeCode, strict: bool) -> SteadResult<FieldValue> {
    let Some(from) = type_of(value) else {
        return Ok(FieldValue::Null);
    };
    if from == to || to == TypeCode::Object || (is_temporal(from) && is_temporal(to)) {
        return Ok(value.clone());
    }

    if let Some(num) = Num::of(value) {
        return convert_number(value, num, from, to, strict);
    }

    match (value, to) {
        (FieldValue::String(s), TypeCode::String) => Ok(FieldValue::String(s.clone())),
        (_, TypeCode::String) => Ok(FieldValue::String(display(value))),
        (FieldValue::String(s), TypeCode::Boolean) => {
            Ok(FieldValue::Boolean(s.trim().eq_ignore_ascii_case("true")))
        }
        (FieldValue::String(s), TypeCode::Int) => s
            .trim()
            .parse::<i32>()
            .map(FieldValue::Int)
            .map_err(|_| cannot_convert(value, to)),
        (FieldValue::String(s), TypeCode::Char) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(FieldValue::Char(c)),
                _ => Err(cannot_convert(value, to)),
            }
        }
        (FieldValue::Char(c), _) if to.is_numeric() => {
            let code = i64::from(u32::from(*c));
            convert_number(value, Num::Int(code), TypeCode::Int, to, strict)
        }
        (FieldValue::String(s), _) if to.is_numeric() && s.chars().count() == 1 => {
            let digit = s.parse::<i64>().map_err(|_| cannot_convert(value, to))?;
            convert_number(value, Num::Int(digit), TypeCode::Int, to, strict)
        }
        (FieldValue::String(s), _) if is_temporal(to) && is_temporal_syntax(s) => {
            parse_temporal_syntax(s)?.ok_or_else(|| cannot_convert(value, to))
        }
        _ => Err(cannot_convert(value, to)),
    }
}

fn convert_number(
    value: &FieldValue,
    num: Num,
    from: TypeCode,
    to: TypeCode,
    strict: bool,
) -> SteadResult<FieldValue> {
    let allowed = allow_numeric(from, to, strict);
    Ok(match to {
        TypeCode::Int if allowed => FieldValue::Int(num.as_i64() as i32),
        TypeCode::Float if allowed => FieldValue::Float(num.as_f64() as f32),
        TypeCode::Double | TypeCode::Number => FieldValue::Double(num.as_f64()),
        TypeCode::Long if allowed => FieldValue::Long(num.as_i64()),
        TypeCode::Short if allowed => FieldValue::Short(num.as_i64() as i16),
        TypeCode::Byte if allowed => FieldValue::Byte(num.as_i64() as i8),
        TypeCode::Char => u32::try_from(num.as_i64())
            .ok()
            .and_then(char::from_u32)
            .map(FieldValue::Char)
            .ok_or_else(|| cannot_convert(value, to))?,
        TypeCode::String if !strict => FieldValue::String(display(value)),
        _ => return Err(cannot_convert(value, to)),
    })
}

fn display(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => String::new(),
        FieldValue::Boolean(v) => v.to_string(),
        FieldValue::Byte(v) => v.to_string(),
        FieldValue::Char(v) => v.to_string(),
        FieldValue::Short(v) => v.to_string(),
        FieldValue::Int(v) => v.to_string(),
        FieldValue::Long(v) => v.to_string(),
        FieldValue::Float(v) => v.to_string(),
        FieldValue::Double(v) => v.to_string(),
        FieldValue::String(v) => v.clone(),
        FieldValue::Date(v) => v.to_rfc3339(),
        FieldValue::Object(v) => v.to_string(),
        other => format!("{:?}", other),
    }
}

// =============================================================================
// Arithmetic
// =============================================================================

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `*`
    Multiply,
    /// `/`
    Divide,
    /// `%`
    Modulo,
}

/// `a + b` with promotion
pub fn add(a: &FieldValue, b: &FieldValue) -> SteadResult<FieldValue> {
    arithmetic(ArithmeticOp::Add, a, b)
}

/// `a - b` with promotion
pub fn subtract(a: &FieldValue, b: &FieldValue) -> SteadResult<FieldValue> {
    arithmetic(ArithmeticOp::Subtract, a, b)
}

/// `a * b` with promotion
pub fn multiply(a: &FieldValue, b: &FieldValue) -> SteadResult<FieldValue> {
    arithmetic(ArithmeticOp::Multiply, a, b)
}

/// `a / b` with promotion
pub fn divide(a: &FieldValue, b: &FieldValue) -> SteadResult<FieldValue> {
    arithmetic(ArithmeticOp::Divide, a, b)
}

/// `a % b` with promotion
pub fn modulo(a: &FieldValue, b: &FieldValue) -> SteadResult<FieldValue> {
    arithmetic(ArithmeticOp::Modulo, a, b)
}

/// Apply `op` after promoting both operands to a common type. Nulls count
/// as zero; integer division by zero is a user error.
pub fn arithmetic(op: ArithmeticOp, a: &FieldValue, b: &FieldValue) -> SteadResult<FieldValue> {
    let operand = |v: &FieldValue| -> SteadResult<Num> {
        if v.is_null() {
            return Ok(Num::Int(0));
        }
        Num::of(v).ok_or_else(|| {
            SteadError::user(format!("{} value is not numeric", v.type_name()))
        })
    };
    let (x, y) = (operand(a)?, operand(b)?);
    let code = match (type_of(a), type_of(b)) {
        (Some(ta), Some(tb)) => promote(ta, tb),
        (Some(t), None) | (None, Some(t)) => t,
        (None, None) => TypeCode::Int,
    };

    match code {
        TypeCode::Long => integer_op(op, x.as_i64(), y.as_i64()).map(FieldValue::Long),
        TypeCode::Float => Ok(FieldValue::Float(
            real_op(op, x.as_f64(), y.as_f64()) as f32,
        )),
        TypeCode::Double | TypeCode::Number => {
            Ok(FieldValue::Double(real_op(op, x.as_f64(), y.as_f64())))
        }
        _ => integer_op(op, i64::from(x.as_i64() as i32), i64::from(y.as_i64() as i32))
            .map(|v| FieldValue::Int(v as i32)),
    }
}

fn integer_op(op: ArithmeticOp, x: i64, y: i64) -> SteadResult<i64> {
    Ok(match op {
        ArithmeticOp::Add => x.wrapping_add(y),
        ArithmeticOp::Subtract => x.wrapping_sub(y),
        ArithmeticOp::Multiply => x.wrapping_mul(y),
        ArithmeticOp::Divide | ArithmeticOp::Modulo if y == 0 => {
            return Err(SteadError::user("division by zero"))
        }
        ArithmeticOp::Divide => x.wrapping_div(y),
        ArithmeticOp::Modulo => x.wrapping_rem(y),
    })
}

fn real_op(op: ArithmeticOp, x: f64, y: f64) -> f64 {
    match op {
        ArithmeticOp::Add => x + y,
        ArithmeticOp::Subtract => x - y,
        ArithmeticOp::Multiply => x * y,
        ArithmeticOp::Divide => x / y,
        ArithmeticOp::Modulo => x % y,
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse `"int a, String b"` into `(type, name)` pairs.
///
/// # Errors
///
/// Fails when the declaration uses the wrong separator (`;` for `,` or the
/// other way round) or does not pair every type with a name.
pub fn parse_declaration(declaration: &str, split: char) -> SteadResult<Vec<(String, String)>> {
    let bad = match split {
        ',' => Some(';'),
        ';' => Some(','),
        _ => None,
    };
    let malformed = || SteadError::user(format!("malformed declaration '{}'", declaration));

    let mut sentinel = ' ';
    let mut start = 0;
    let mut skip_space = false;
    let mut tokens: Vec<String> = Vec::new();
    for (i, cur) in declaration.char_indices() {
        if Some(cur) == bad {
            return Err(malformed());
        }
        if cur == ' ' && skip_space {
            start = i + 1;
            continue;
        }
        skip_space = false;
        if cur != sentinel {
            continue;
        }
        sentinel = if sentinel == ' ' { split } else { ' ' };
        tokens.push(declaration[start..i].trim().to_string());
        start = i + cur.len_utf8();
        skip_space = true;
    }
    if start < declaration.len() {
        tokens.push(declaration[start..].trim().to_string());
    }

    if tokens.is_empty() || tokens.len() % 2 != 0 || tokens.iter().any(|t| t.is_empty()) {
        return Err(malformed());
    }
    let mut pairs = Vec::with_capacity(tokens.len() / 2);
    let mut iter = tokens.into_iter();
    while let (Some(ty), Some(name)) = (iter.next(), iter.next()) {
        pairs.push((ty, name));
    }
    Ok(pairs)
}

/// Split `expressions` on `split`, ignoring separators inside quotes or
/// parentheses. A whitespace separator only splits after a non-blank.
pub fn split_expressions(expressions: &str, split: char) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut depth: i32 = 0;
    let mut begin = 0;
    let mut escape = false;
    let mut quote: Option<char> = None;
    let mut nonspace = false;

    for (pos, c) in expressions.char_indices() {
        if c == '\\' {
            escape = !escape;
            continue;
        }
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\'' | '"' => {
                match quote {
                    Some(q) if q == c => quote = None,
                    None => quote = Some(c),
                    Some(_) => {}
                }
                nonspace = true;
            }
            '(' => {
                if quote.is_none() {
                    depth += 1;
                }
                nonspace = true;
            }
            ')' => {
                if quote.is_none() {
                    depth -= 1;
                }
                nonspace = true;
            }
            ' ' | '\t' | '\n' | '\r' => {
                if c == split && quote.is_none() && depth == 0 && nonspace {
                    parts.push(expressions[begin..pos].trim().to_string());
                    begin = pos + c.len_utf8();
                    nonspace = false;
                }
            }
            _ => {
                if c == split && quote.is_none() && depth == 0 {
                    parts.push(expressions[begin..pos].trim().to_string());
                    begin = pos + c.len_utf8();
                }
                nonspace = true;
            }
        }
    }

    if parts.is_empty() {
        return vec![expressions.to_string()];
    }
    let last = expressions[begin..].trim();
    if !last.is_empty() {
        parts.push(last.to_string());
    }
    parts
}

/// `s` without the leading `first` and trailing `last`, trimmed. When `s`
/// is not enclosed that way it is returned as is, or rejected with `fail`.
pub fn clip(s: &str, first: &str, last: &str, fail: bool) -> SteadResult<String> {
    if s.len() >= first.len() + last.len() && s.starts_with(first) && s.ends_with(last) {
        return Ok(s[first.len()..s.len() - last.len()].trim().to_string());
    }
    if fail {
        return Err(SteadError::user(format!(
            "'{}' is not enclosed in {} and {}",
            s, first, last
        )));
    }
    Ok(s.to_string())
}

/// Whether `s` is a `{...}` escape such as `{d '2024-01-31'}`
pub fn is_temporal_syntax(s: &str) -> bool {
    let s = s.trim();
    s.starts_with('{') && s.ends_with('}')
}

/// Parse `{ts 'yyyy-mm-dd hh:mm:ss[.f]'}`, `{d 'yyyy-mm-dd'}` or
/// `{t 'hh:mm:ss'}`. Returns `None` for an unknown escape keyword.
pub fn parse_temporal_syntax(s: &str) -> SteadResult<Option<FieldValue>> {
    let body = clip(s.trim(), "{", "}", true)?;
    let invalid = |e: chrono::ParseError| {
        SteadError::user(format!("invalid temporal literal '{}': {}", s, e))
    };
    let out_of_range = || SteadError::internal("temporal literal out of range");
    let naive = if let Some(rest) = body.strip_prefix("ts") {
        let text = clip(rest.trim(), "'", "'", false)?;
        NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f").map_err(invalid)?
    } else if let Some(rest) = body.strip_prefix('d') {
        let text = clip(rest.trim(), "'", "'", false)?;
        NaiveDate::parse_from_str(&text, "%Y-%m-%d")
            .map_err(invalid)?
            .and_hms_opt(0, 0, 0)
            .ok_or_else(out_of_range)?
    } else if let Some(rest) = body.strip_prefix('t') {
        let text = clip(rest.trim(), "'", "'", false)?;
        let time = NaiveTime::parse_from_str(&text, "%H:%M:%S").map_err(invalid)?;
        NaiveDate::from_ymd_opt(1970, 1, 1)
            .ok_or_else(out_of_range)?
            .and_time(time)
    } else {
        return Ok(None);
    };
    Ok(Some(FieldValue::Date(Utc.from_utc_datetime(&naive))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_numeric_promotion() {
        assert_eq!(promote(TypeCode::Int, TypeCode::Long), TypeCode::Long);
        assert_eq!(promote(TypeCode::Short, TypeCode::Byte), TypeCode::Int);
        assert_eq!(promote(TypeCode::Float, TypeCode::Long), TypeCode::Float);
        assert_eq!(promote(TypeCode::Double, TypeCode::Float), TypeCode::Double);
        assert_eq!(promote(TypeCode::Number, TypeCode::Double), TypeCode::Number);
    }

    #[test]
    fn test_textual_promotion() {
        assert_eq!(promote(TypeCode::Char, TypeCode::String), TypeCode::String);
        assert_eq!(promote(TypeCode::String, TypeCode::Short), TypeCode::Int);
        assert_eq!(promote(TypeCode::Long, TypeCode::Char), TypeCode::Long);
        assert_eq!(promote(TypeCode::Object, TypeCode::Date), TypeCode::Date);
        assert_eq!(promote(TypeCode::Collection, TypeCode::Map), TypeCode::Object);
        assert_eq!(promote(TypeCode::Collection, TypeCode::String), TypeCode::String);
    }

    #[test]
    fn test_strict_conversion_rules() {
        assert!(can_convert(TypeCode::Int, TypeCode::Double, true));
        assert!(can_convert(TypeCode::Int, TypeCode::String, false));
        assert!(!can_convert(TypeCode::Int, TypeCode::String, true));
        assert!(can_convert(TypeCode::String, TypeCode::Char, true));
        assert!(can_convert(TypeCode::String, TypeCode::Date, true));
        assert!(!can_convert(TypeCode::Boolean, TypeCode::Int, false));
    }

    #[test]
    fn test_convert_numbers() {
        assert_eq!(convert(&FieldValue::Long(7), TypeCode::Int).unwrap(), FieldValue::Int(7));
        assert_eq!(
            convert(&FieldValue::Double(2.9), TypeCode::Int).unwrap(),
            FieldValue::Int(2)
        );
        assert_eq!(
            convert_with(&FieldValue::Double(2.5), TypeCode::Float, true).unwrap(),
            FieldValue::Float(2.5)
        );
        assert!(convert_with(&FieldValue::Double(2.5), TypeCode::Int, true).is_err());
        assert!(convert_with(&FieldValue::Byte(1), TypeCode::Long, true).is_err());
        assert_eq!(
            convert(&FieldValue::Int(65), TypeCode::Char).unwrap(),
            FieldValue::Char('A')
        );
    }

    #[test]
    fn test_convert_strings() {
        assert_eq!(
            convert(&FieldValue::from("42"), TypeCode::Int).unwrap(),
            FieldValue::Int(42)
        );
        assert!(convert(&FieldValue::from("forty"), TypeCode::Int).is_err());
        assert_eq!(
            convert(&FieldValue::from("TRUE"), TypeCode::Boolean).unwrap(),
            FieldValue::Boolean(true)
        );
        assert_eq!(
            convert(&FieldValue::from("x"), TypeCode::Char).unwrap(),
            FieldValue::Char('x')
        );
        assert_eq!(
            convert(&FieldValue::Char('7'), TypeCode::Long).unwrap(),
            FieldValue::Long(55)
        );
        assert_eq!(
            convert(&FieldValue::Int(3), TypeCode::String).unwrap(),
            FieldValue::from("3")
        );
        assert_eq!(convert(&FieldValue::Null, TypeCode::Int).unwrap(), FieldValue::Null);
    }

    #[test]
    fn test_convert_temporal_literal() {
        let FieldValue::Date(d) =
            convert(&FieldValue::from("{d '2024-01-31'}"), TypeCode::Date).unwrap()
        else {
            panic!("expected a date");
        };
        assert_eq!(d.to_rfc3339(), "2024-01-31T00:00:00+00:00");
        let ts = parse_temporal_syntax("{ts '2024-01-31 10:11:12.5'}").unwrap();
        assert!(matches!(ts, Some(FieldValue::Date(_))));
        assert_eq!(parse_temporal_syntax("{fn now()}").unwrap(), None);
        assert!(parse_temporal_syntax("{d 'yesterday'}").is_err());
    }

    #[test]
    fn test_arithmetic_promotes() {
        assert_eq!(
            add(&FieldValue::Int(2), &FieldValue::Long(3)).unwrap(),
            FieldValue::Long(5)
        );
        assert_eq!(
            multiply(&FieldValue::Short(4), &FieldValue::Float(0.5)).unwrap(),
            FieldValue::Float(2.0)
        );
        assert_eq!(
            subtract(&FieldValue::Null, &FieldValue::Double(1.5)).unwrap(),
            FieldValue::Double(-1.5)
        );
        assert_eq!(
            modulo(&FieldValue::Int(7), &FieldValue::Int(3)).unwrap(),
            FieldValue::Int(1)
        );
        assert_eq!(
            divide(&FieldValue::Int(7), &FieldValue::Int(2)).unwrap(),
            FieldValue::Int(3)
        );
    }

    #[test]
    fn test_integer_division_by_zero_fails() {
        assert!(matches!(
            divide(&FieldValue::Long(1), &FieldValue::Long(0)),
            Err(SteadError::User { .. })
        ));
        let FieldValue::Double(inf) = divide(&FieldValue::Double(1.0), &FieldValue::Int(0)).unwrap()
        else {
            panic!("expected a double");
        };
        assert!(inf.is_infinite());
    }

    #[test]
    fn test_non_numeric_operand_fails() {
        assert!(add(&FieldValue::from("1"), &FieldValue::Int(1)).is_err());
    }

    #[test]
    fn test_parse_declaration() {
        let pairs = parse_declaration("int a, String b", ',').unwrap();
        assert_eq!(
            pairs,
            vec![
                ("int".to_string(), "a".to_string()),
                ("String".to_string(), "b".to_string())
            ]
        );
        assert!(parse_declaration("int a; String b", ',').is_err());
        assert!(parse_declaration("int a, String", ',').is_err());
    }

    #[test]
    fn test_split_expressions_respects_quotes_and_parens() {
        assert_eq!(
            split_expressions("a.x, f(b, c), 'p,q'", ','),
            vec!["a.x", "f(b, c)", "'p,q'"]
        );
        assert_eq!(split_expressions("single", ','), vec!["single"]);
        assert_eq!(split_expressions("a  b (c d)", ' '), vec!["a", "b", "(c d)"]);
        assert_eq!(split_expressions(r"a\,b,c", ','), vec![r"a\,b", "c"]);
    }

    #[test]
    fn test_clip() {
        assert_eq!(clip("{ x }", "{", "}", true).unwrap(), "x");
        assert_eq!(clip("x", "{", "}", false).unwrap(), "x");
        assert!(clip("x", "{", "}", true).is_err());
    }

    #[test]
    fn test_default_for_null() {
        assert_eq!(default_for_null(TypeCode::Long), FieldValue::Long(0));
        assert_eq!(default_for_null(TypeCode::String), FieldValue::Null);
    }

    fn type_code() -> impl Strategy<Value = TypeCode> {
        prop_oneof![
            Just(TypeCode::Boolean),
            Just(TypeCode::Byte),
            Just(TypeCode::Char),
            Just(TypeCode::Short),
            Just(TypeCode::Int),
            Just(TypeCode::Long),
            Just(TypeCode::Float),
            Just(TypeCode::Double),
            Just(TypeCode::Number),
            Just(TypeCode::String),
            Just(TypeCode::Date),
            Just(TypeCode::Object),
            Just(TypeCode::Collection),
        ]
    }

    proptest! {
        #[test]
        fn test_promotion_is_symmetric(a in type_code(), b in type_code()) {
            prop_assert_eq!(promote(a, b), promote(b, a));
        }

        #[test]
        fn test_numeric_addition_matches_i64(x in any::<i32>(), y in any::<i32>()) {
            let sum = add(&FieldValue::Long(i64::from(x)), &FieldValue::Long(i64::from(y))).unwrap();
            prop_assert_eq!(sum, FieldValue::Long(i64::from(x) + i64::from(y)));
        }
    }
}
