//! Default text input/output routines.
//!
//! These are the conversions a host applies when a value crosses the
//! boundary as text: numeric values, enum labels, types without a native
//! fast path, and scripts that hand a string to a non-text column.

use super::Datum;
use crate::types::{oid, TypeDescriptor, TypeKind};
use crate::{Error, Result};
use bytes::Bytes;

/// Parses `text` as a value of `desc`, applying `type_mod`.
pub fn input(desc: &TypeDescriptor, text: &str, type_mod: i32) -> Result<Datum> {
    if let TypeKind::Enum { labels } = &desc.kind {
        return if labels.iter().any(|l| l == text) {
            Ok(Datum::Enum(text.to_string()))
        } else {
            Err(Error::conversion(format!(
                "invalid input value for enum {}: \"{}\"",
                desc.name, text
            )))
        };
    }

    let invalid = || Error::conversion(format!("invalid input syntax for type {}: \"{}\"", desc.name, text));
    match desc.oid {
        oid::BOOL => parse_bool(text).map(Datum::Bool).ok_or_else(invalid),
        oid::INT2 => text.trim().parse::<i16>().map(Datum::Int2).map_err(|_| out_of_range(desc, text)),
        oid::INT4 => text.trim().parse::<i32>().map(Datum::Int4).map_err(|_| out_of_range(desc, text)),
        oid::INT8 => text.trim().parse::<i64>().map(Datum::Int8).map_err(|_| out_of_range(desc, text)),
        oid::FLOAT4 => parse_float(text).map(|f| Datum::Float4(f as f32)).ok_or_else(invalid),
        oid::FLOAT8 => parse_float(text).map(Datum::Float8).ok_or_else(invalid),
        oid::NUMERIC => numeric_input(text, type_mod).map(Datum::Numeric),
        oid::TEXT => Ok(Datum::Text(text.to_string())),
        oid::VARCHAR => varchar_input(text, type_mod).map(Datum::Text),
        oid::BPCHAR => bpchar_input(text, type_mod).map(Datum::Text),
        oid::BYTEA => bytea_input(text).map(Datum::Bytea).ok_or_else(invalid),
        oid::JSON => Ok(Datum::Json(serde_json::from_str(text)?)),
        oid::REFCURSOR => Ok(Datum::RefCursor(text.to_string())),
        _ => Ok(Datum::Other(text.to_string())),
    }
}

/// Formats `datum` as text.
pub fn output(_desc: &TypeDescriptor, datum: &Datum) -> Result<String> {
    Ok(match datum {
        Datum::Bool(b) => (if *b { "t" } else { "f" }).to_string(),
        Datum::Int2(v) => v.to_string(),
        Datum::Int4(v) => v.to_string(),
        Datum::Int8(v) => v.to_string(),
        Datum::Float4(v) => format_float(*v as f64),
        Datum::Float8(v) => format_float(*v),
        Datum::Numeric(s)
        | Datum::Text(s)
        | Datum::Enum(s)
        | Datum::RefCursor(s)
        | Datum::Other(s) => s.clone(),
        Datum::Bytea(b) => {
            let mut out = String::with_capacity(2 + b.len() * 2);
            out.push_str("\\x");
            for byte in b.iter() {
                out.push_str(&format!("{:02x}", byte));
            }
            out
        }
        Datum::Json(v) => v.to_string(),
        Datum::Array(_) | Datum::Composite(_) => {
            return Err(Error::conversion(format!("no text output for {} values", datum.kind_name())))
        }
    })
}

fn out_of_range(desc: &TypeDescriptor, text: &str) -> Error {
    Error::conversion(format!("value \"{}\" is out of range or invalid for type {}", text, desc.name))
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Some(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text.trim().to_ascii_lowercase().as_str() {
        "nan" => Some(f64::NAN),
        "infinity" | "inf" | "+infinity" => Some(f64::INFINITY),
        "-infinity" | "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        let s = if v > 0.0 { "Infinity" } else { "-Infinity" };
        s.to_string()
    } else {
        v.to_string()
    }
}

fn varchar_input(text: &str, type_mod: i32) -> Result<String> {
    if type_mod < 4 {
        return Ok(text.to_string());
    }
    let max = (type_mod - 4) as usize;
    let chars = text.chars().count();
    if chars <= max {
        return Ok(text.to_string());
    }
    let truncated: String = text.chars().take(max).collect();
    if text.chars().skip(max).all(|c| c == ' ') {
        Ok(truncated)
    } else {
        Err(Error::conversion(format!("value too long for type character varying({})", max)))
    }
}

fn bpchar_input(text: &str, type_mod: i32) -> Result<String> {
    if type_mod < 4 {
        return Ok(text.to_string());
    }
    let width = (type_mod - 4) as usize;
    let mut out = varchar_input(text, type_mod)
        .map_err(|_| Error::conversion(format!("value too long for type character({})", width)))?;
    let chars = out.chars().count();
    out.extend(std::iter::repeat(' ').take(width.saturating_sub(chars)));
    Ok(out)
}

fn bytea_input(text: &str) -> Option<Bytes> {
    match text.strip_prefix("\\x") {
        Some(hex) => {
            if hex.len() % 2 != 0 {
                return None;
            }
            let bytes: Option<Vec<u8>> = (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
                .collect();
            bytes.map(Bytes::from)
        }
        None => Some(Bytes::copy_from_slice(text.as_bytes())),
    }
}

/// Largest decimal exponent accepted in numeric input.
const NUMERIC_MAX_EXPONENT: u32 = 1000;

/// Validates a decimal literal and applies a `numeric(p, s)` modifier.
fn numeric_input(text: &str, type_mod: i32) -> Result<String> {
    let s = text.trim();
    let invalid = || Error::conversion(format!("invalid input syntax for type numeric: \"{}\"", text));

    if s.eq_ignore_ascii_case("nan") {
        return Ok("NaN".to_string());
    }

    let (negative, body) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (mantissa, exponent) = match body.find(|c: char| c == 'e' || c == 'E') {
        Some(i) => (&body[..i], body[i + 1..].parse::<i32>().map_err(|_| invalid())?),
        None => (body, 0),
    };
    if exponent.unsigned_abs() > NUMERIC_MAX_EXPONENT {
        return Err(Error::conversion("value overflows numeric format"));
    }
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(i) => (&mantissa[..i], &mantissa[i + 1..]),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    // All digits with the decimal point position, exponent applied.
    let mut digits: Vec<u8> = int_part.bytes().chain(frac_part.bytes()).map(|b| b - b'0').collect();
    let mut point = int_part.len() as i64 + exponent as i64;
    if point < 0 {
        let pad = (-point) as usize;
        digits.splice(0..0, std::iter::repeat(0).take(pad));
        point = 0;
    }
    let point = point as usize;
    if digits.len() < point {
        digits.resize(point, 0);
    }

    let natural_scale = digits.len() - point;
    let scale = if type_mod >= 4 { (((type_mod - 4) & 0xffff) as usize).min(1000) } else { natural_scale };

    if scale < natural_scale {
        let round_up = digits[point + scale] >= 5;
        digits.truncate(point + scale);
        if round_up {
            let mut i = digits.len();
            loop {
                if i == 0 {
                    digits.insert(0, 1);
                    return finish_numeric(negative, digits, point + 1, scale, type_mod);
                }
                i -= 1;
                if digits[i] == 9 {
                    digits[i] = 0;
                } else {
                    digits[i] += 1;
                    break;
                }
            }
        }
    } else {
        digits.resize(point + scale, 0);
    }
    finish_numeric(negative, digits, point, scale, type_mod)
}

fn finish_numeric(negative: bool, digits: Vec<u8>, point: usize, scale: usize, type_mod: i32) -> Result<String> {
    let int_digits: Vec<u8> = {
        let lead = digits[..point].iter().take_while(|d| **d == 0).count();
        digits[lead..point].to_vec()
    };

    if type_mod >= 4 {
        let precision = (((type_mod - 4) >> 16) & 0xffff) as usize;
        if int_digits.len() + scale > precision {
            return Err(Error::conversion(format!(
                "numeric field overflow: a field with precision {}, scale {} must round to an absolute value less than 10^{}",
                precision,
                scale,
                precision.saturating_sub(scale)
            )));
        }
    }

    let mut out = String::new();
    let is_zero = digits.iter().all(|d| *d == 0);
    if negative && !is_zero {
        out.push('-');
    }
    if int_digits.is_empty() {
        out.push('0');
    } else {
        out.extend(int_digits.iter().map(|d| (b'0' + d) as char));
    }
    if scale > 0 {
        out.push('.');
        out.extend(digits[point..point + scale].iter().map(|d| (b'0' + d) as char));
    }
    Ok(out)
}

/// Type modifier for `numeric(precision, scale)`.
pub fn numeric_type_mod(precision: i32, scale: i32) -> i32 {
    ((precision << 16) | scale) + 4
}

/// Type modifier for `varchar(n)` and `char(n)`.
pub fn char_type_mod(len: i32) -> i32 {
    len + 4
}
