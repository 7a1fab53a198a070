use time::Duration;

use crate::DataType;

/// A typed operand produced by coercing a stored string against a [`DataType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Duration(Duration),
    Text(String),
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Duration(_) => "duration",
            Self::Text(_) => "string",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TypeError {
    #[error("expected {} value, got {value:?}", .expected.as_str())]
    Malformed { expected: DataType, value: String },
    #[error("unknown data type: {0}")]
    UnsupportedDataType(String),
}

const NANOS_PER_MICRO: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SECOND: u64 = 1_000_000_000;
const NANOS_PER_MINUTE: u64 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: u64 = 60 * NANOS_PER_MINUTE;

/// Check that `value` coerces to `data_type` without keeping the parsed result.
///
/// # Errors
/// Returns [`TypeError::Malformed`] when the value does not parse, and
/// [`TypeError::UnsupportedDataType`] for [`DataType::None`].
pub fn validate_value(value: &str, data_type: DataType) -> Result<(), TypeError> {
    parse_value(value, data_type).map(|_| ())
}

/// Same as [`validate_value`], for a data type given by name.
///
/// # Errors
/// Returns [`TypeError::UnsupportedDataType`] for unknown names.
pub fn validate_value_named(value: &str, data_type: &str) -> Result<(), TypeError> {
    let Some(parsed) = DataType::parse(data_type) else {
        return Err(TypeError::UnsupportedDataType(data_type.to_string()));
    };
    validate_value(value, parsed)
}

/// Coerce a raw string into a [`Value`] of the given type.
///
/// # Errors
/// Returns [`TypeError::Malformed`] when the value does not parse, and
/// [`TypeError::UnsupportedDataType`] for [`DataType::None`].
pub fn parse_value(value: &str, data_type: DataType) -> Result<Value, TypeError> {
    let malformed = || TypeError::Malformed { expected: data_type, value: value.to_string() };
    match data_type {
        DataType::Bool => parse_bool(value).map(Value::Bool).ok_or_else(malformed),
        DataType::Int => value.parse::<i64>().map(Value::Int).map_err(|_| malformed()),
        DataType::Float => value.parse::<f64>().map(Value::Float).map_err(|_| malformed()),
        DataType::Duration => parse_duration(&normalize_duration(value))
            .map(Value::Duration)
            .ok_or_else(malformed),
        DataType::String => Ok(Value::Text(value.to_string())),
        DataType::None => Err(TypeError::UnsupportedDataType(data_type.as_str().to_string())),
    }
}

#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Rewrite `H:MM:SS` and `MM:SS` clock forms into unit-suffixed literals.
#[must_use]
pub fn normalize_duration(value: &str) -> String {
    let parts = value.split(':').collect::<Vec<_>>();
    match parts.as_slice() {
        [hours, minutes, seconds] => format!("{hours}h{minutes}m{seconds}s"),
        [minutes, seconds] => format!("{minutes}m{seconds}s"),
        _ => value.to_string(),
    }
}

/// Parse a unit-suffixed duration literal such as `1h30m`, `-1.5s` or `250ms`.
///
/// Accepted units are `ns`, `us`, `µs`, `ms`, `s`, `m` and `h`. The bare literal `0`
/// needs no unit.
#[must_use]
pub fn parse_duration(value: &str) -> Option<Duration> {
    let (negative, mut rest) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };

    if rest == "0" {
        return Some(Duration::ZERO);
    }
    if rest.is_empty() {
        return None;
    }

    let mut total: u64 = 0;
    while !rest.is_empty() {
        let whole_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (whole_digits, mut after) = rest.split_at(whole_len);

        let mut fraction_digits = "";
        if let Some(stripped) = after.strip_prefix('.') {
            let fraction_len = stripped.bytes().take_while(u8::is_ascii_digit).count();
            (fraction_digits, after) = stripped.split_at(fraction_len);
        }
        if whole_digits.is_empty() && fraction_digits.is_empty() {
            return None;
        }

        let unit_len =
            after.find(|c: char| c == '.' || c.is_ascii_digit()).unwrap_or(after.len());
        let (unit, tail) = after.split_at(unit_len);
        let scale = unit_nanos(unit)?;

        let whole = if whole_digits.is_empty() { 0 } else { whole_digits.parse::<u64>().ok()? };
        let mut nanos = whole.checked_mul(scale)?;
        if !fraction_digits.is_empty() {
            nanos = nanos.checked_add(fraction_nanos(fraction_digits, scale)?)?;
        }
        total = total.checked_add(nanos)?;
        rest = tail;
    }

    let total = i64::try_from(total).ok()?;
    Some(Duration::nanoseconds(if negative { -total } else { total }))
}

fn unit_nanos(unit: &str) -> Option<u64> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SECOND),
        "m" => Some(NANOS_PER_MINUTE),
        "h" => Some(NANOS_PER_HOUR),
        _ => None,
    }
}

// Digits beyond the eighteenth are ignored.
fn fraction_nanos(digits: &str, scale: u64) -> Option<u64> {
    let mut numerator: u128 = 0;
    let mut divisor: u128 = 1;
    for digit in digits.bytes().take(18) {
        numerator = numerator * 10 + u128::from(digit - b'0');
        divisor *= 10;
    }
    u64::try_from(numerator * u128::from(scale) / divisor).ok()
}
