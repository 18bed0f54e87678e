//! Conversion of pgoutput text values into typed [`FieldValue`]s.
//!
//! pgoutput sends every column in its text output form (`t` tuple columns),
//! so this is essentially the inverse of Postgres's output functions for the
//! types the mirror supports.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::borrow::Cow;
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

use crate::event::{FieldType, FieldValue};
use crate::{Error, Result};

/// Seconds between the Unix epoch and the Postgres epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

const MAX_FRACTION_DIGITS: usize = 9;

macro_rules! parse_each {
    ($items:expr, $variant:ident, $parse:expr) => {
        FieldValue::$variant(
            $items
                .iter()
                .map(|s| $parse(s.as_str()))
                .collect::<Result<Vec<_>>>()?,
        )
    };
}

/// Parses a text-format column value as `field_type`.
pub fn parse_text(field_type: FieldType, raw: &str) -> Result<FieldValue> {
    if field_type.is_array() {
        return parse_array(field_type, raw);
    }

    let value = match field_type {
        FieldType::Null => FieldValue::Null,
        FieldType::Float => FieldValue::Float(parse_number(raw)?),
        FieldType::Double => FieldValue::Double(parse_number(raw)?),
        FieldType::Boolean => FieldValue::Boolean(parse_bool(raw)?),
        FieldType::Text => FieldValue::Text(raw.to_string()),
        FieldType::Json => FieldValue::Json(raw.to_string()),
        FieldType::Jsonb => FieldValue::Jsonb(raw.to_string()),
        FieldType::Uuid => FieldValue::Uuid(parse_uuid(raw)?),
        FieldType::Char => FieldValue::Char(raw.to_string()),
        FieldType::Int16 => FieldValue::Int16(parse_number(raw)?),
        FieldType::Int32 => FieldValue::Int32(parse_number(raw)?),
        FieldType::Int64 => FieldValue::Int64(parse_number(raw)?),
        FieldType::Bytes => FieldValue::Bytes(parse_bytea(raw)?),
        FieldType::Date => FieldValue::Date(parse_date(raw)?),
        FieldType::Time => FieldValue::Time(parse_time(raw)?),
        FieldType::Timestamp => FieldValue::Timestamp(parse_timestamp(raw)?),
        FieldType::TimestampTz => FieldValue::TimestampTz(parse_timestamptz(raw)?),
        other => {
            return Err(Error::NotImplemented(format!(
                "parsing for type {:?} is not yet implemented",
                other
            )))
        }
    };
    Ok(value)
}

/// Binary-format values are only sent when a subscriber asks for them;
/// the raw bytes are usable as-is for `bytea` alone.
pub fn parse_binary(field_type: FieldType, raw: &[u8]) -> Result<FieldValue> {
    match field_type {
        FieldType::Bytes => Ok(FieldValue::Bytes(raw.to_vec())),
        other => Err(Error::NotImplemented(format!(
            "binary column values of type {:?} are not supported",
            other
        ))),
    }
}

fn parse_array(field_type: FieldType, raw: &str) -> Result<FieldValue> {
    let items = split_postgres_array(raw)?;

    let value = match field_type {
        FieldType::FloatArray => parse_each!(items, FloatArray, parse_number::<f32>),
        FieldType::DoubleArray => parse_each!(items, DoubleArray, parse_number::<f64>),
        FieldType::BooleanArray => parse_each!(items, BooleanArray, parse_bool),
        FieldType::TextArray => FieldValue::TextArray(items),
        FieldType::JsonArray => FieldValue::JsonArray(items),
        FieldType::JsonbArray => FieldValue::JsonbArray(items),
        FieldType::UuidArray => parse_each!(items, UuidArray, parse_uuid),
        FieldType::CharArray => FieldValue::CharArray(items),
        FieldType::Int16Array => parse_each!(items, Int16Array, parse_number::<i16>),
        FieldType::Int32Array => parse_each!(items, Int32Array, parse_number::<i32>),
        FieldType::Int64Array => parse_each!(items, Int64Array, parse_number::<i64>),
        FieldType::BytesArray => parse_each!(items, BytesArray, parse_bytea),
        FieldType::DateArray => parse_each!(items, DateArray, parse_date),
        FieldType::TimeArray => parse_each!(items, TimeArray, parse_time),
        FieldType::TimestampArray => parse_each!(items, TimestampArray, parse_timestamp),
        FieldType::TimestampTzArray => parse_each!(items, TimestampTzArray, parse_timestamptz),
        other => {
            return Err(Error::IllegalArgument(format!(
                "{:?} is not an array type",
                other
            )))
        }
    };
    Ok(value)
}

/// Splits a one-dimensional array literal such as `{1,"a,b",NULL}` into its
/// element strings. Quotes are removed and backslash escapes resolved.
pub fn split_postgres_array(literal: &str) -> Result<Vec<String>> {
    let inner = literal
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| {
            Error::IllegalArgument(format!("{} is not a valid postgres array", literal))
        })?;

    if inner.is_empty() {
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut escaped = false;

    for c in inner.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }

        match c {
            '\\' => escaped = true,
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            ',' if !in_quotes => {
                items.push(finish_element(literal, std::mem::take(&mut current), quoted)?);
                quoted = false;
            }
            '{' | '}' if !in_quotes => {
                return Err(Error::IllegalArgument(format!(
                    "multi-dimensional array {} is not supported",
                    literal
                )))
            }
            _ => current.push(c),
        }
    }

    if in_quotes || escaped {
        return Err(Error::IllegalArgument(format!(
            "unterminated element in array {}",
            literal
        )));
    }

    items.push(finish_element(literal, current, quoted)?);
    Ok(items)
}

fn finish_element(literal: &str, element: String, quoted: bool) -> Result<String> {
    if !quoted && element.eq_ignore_ascii_case("NULL") {
        return Err(Error::IllegalArgument(format!(
            "NULL elements are not supported in array {}",
            literal
        )));
    }
    Ok(element)
}

fn parse_number<T>(raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>()
        .map_err(|e| Error::IllegalArgument(format!("invalid number '{}': {}", raw, e)))
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw {
        "t" => Ok(true),
        "f" => Ok(false),
        other => Err(Error::IllegalArgument(format!("invalid boolean '{}'", other))),
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::IllegalArgument(format!("invalid uuid '{}': {}", raw, e)))
}

/// `bytea` in hex output format: `\x` followed by two hex digits per byte.
pub fn parse_bytea(raw: &str) -> Result<Vec<u8>> {
    let digits = raw.strip_prefix("\\x").ok_or_else(|| {
        Error::IllegalArgument("field of type BYTES is not hex encoded".to_string())
    })?;

    if digits.len() % 2 != 0 {
        return Err(Error::IllegalArgument(format!(
            "odd number of hex digits in bytea value ({})",
            digits.len()
        )));
    }

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| match (hex_value(pair[0]), hex_value(pair[1])) {
            (Some(high), Some(low)) => Ok(high << 4 | low),
            _ => Err(Error::IllegalArgument(format!(
                "invalid hex digits in bytea value '{}'",
                raw
            ))),
        })
        .collect()
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|v| v as u8)
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| Error::IllegalArgument(format!("invalid date '{}': {}", raw, e)))
}

pub fn parse_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(&clamp_fraction(raw), "%H:%M:%S%.f")
        .map_err(|e| Error::IllegalArgument(format!("invalid time '{}': {}", raw, e)))
}

/// Parses `timestamp` output with anywhere from 0 to 9 fractional digits.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&clamp_fraction(raw), "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| Error::IllegalArgument(format!("invalid timestamp '{}': {}", raw, e)))
}

/// Parses `timestamptz` output such as `2023-12-18 11:00:37.683147+01` or
/// `... +05:30`.
pub fn parse_timestamptz(raw: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_str(&clamp_fraction(raw), "%Y-%m-%d %H:%M:%S%.f%#z")
        .map_err(|e| Error::IllegalArgument(format!("invalid timestamptz '{}': {}", raw, e)))
}

/// Drops fractional-second digits beyond nanosecond precision.
fn clamp_fraction(raw: &str) -> Cow<'_, str> {
    let Some(dot) = raw.rfind('.') else {
        return Cow::Borrowed(raw);
    };

    let digits_start = dot + 1;
    let digits_end = raw[digits_start..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(raw.len(), |i| digits_start + i);

    if digits_end - digits_start <= MAX_FRACTION_DIGITS {
        return Cow::Borrowed(raw);
    }

    let mut clamped = String::with_capacity(raw.len());
    clamped.push_str(&raw[..digits_start + MAX_FRACTION_DIGITS]);
    clamped.push_str(&raw[digits_end..]);
    Cow::Owned(clamped)
}

/// Converts a pgoutput timestamp (microseconds since 2000-01-01 UTC).
pub fn pg_timestamp_to_utc(micros: i64) -> Result<DateTime<Utc>> {
    micros
        .checked_add(PG_EPOCH_OFFSET_SECS * 1_000_000)
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .ok_or_else(|| Error::IllegalArgument(format!("timestamp out of range: {}", micros)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_split_simple_array() {
        assert_eq!(split_postgres_array("{1,2,3}").unwrap(), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_split_quoted_comma() {
        assert_eq!(
            split_postgres_array(r#"{"hello,world",test}"#).unwrap(),
            vec!["hello,world", "test"]
        );
    }

    #[test]
    fn test_split_escaped_quotes() {
        assert_eq!(
            split_postgres_array(r#"{"say \"hi\"","a\\b",plain}"#).unwrap(),
            vec![r#"say "hi""#, r"a\b", "plain"]
        );
        assert_eq!(
            split_postgres_array(r#"{"\"quoted, twice\""}"#).unwrap(),
            vec![r#""quoted, twice""#]
        );
    }

    #[test]
    fn test_split_empty_and_quoted_empty() {
        assert!(split_postgres_array("{}").unwrap().is_empty());
        assert_eq!(split_postgres_array(r#"{"",x}"#).unwrap(), vec!["", "x"]);
        assert_eq!(split_postgres_array(r#"{"NULL"}"#).unwrap(), vec!["NULL"]);
    }

    #[test]
    fn test_split_rejects_non_array() {
        for bad in ["1,2,3", "{1,2", "1,2}", "", "{\"open}"] {
            let err = split_postgres_array(bad).unwrap_err();
            assert!(matches!(err, Error::IllegalArgument(_)), "{bad}");
        }
    }

    #[test]
    fn test_split_rejects_null_and_nested() {
        assert!(split_postgres_array("{1,NULL}").is_err());
        assert!(split_postgres_array("{{1,2},{3,4}}").is_err());
    }

    #[test]
    fn test_timestamp_precision_0_to_9_digits() {
        let digits = "683147823";
        for precision in 0..=9 {
            let raw = if precision == 0 {
                "2023-12-18 11:00:37".to_string()
            } else {
                format!("2023-12-18 11:00:37.{}", &digits[..precision])
            };

            let parsed = parse_timestamp(&raw).unwrap();
            let expected_nanos = if precision == 0 {
                0
            } else {
                digits[..precision].parse::<u32>().unwrap() * 10u32.pow(9 - precision as u32)
            };

            assert_eq!(parsed.nanosecond(), expected_nanos, "precision {precision}");
            assert_eq!(parsed.second(), 37);
        }
    }

    #[test]
    fn test_timestamp_nanoseconds() {
        let parsed = parse_timestamp("2023-12-18 11:00:37.683147823").unwrap();
        assert_eq!(parsed.nanosecond(), 683_147_823);
        assert_eq!(parsed.year(), 2023);
    }

    #[test]
    fn test_timestamp_precision_clamped() {
        let parsed = parse_timestamp("2023-12-18 11:00:37.6831478239999").unwrap();
        assert_eq!(parsed.nanosecond(), 683_147_823);
    }

    #[test]
    fn test_timestamptz_offsets() {
        let parsed = parse_timestamptz("2023-12-18 11:00:37.683147+01").unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 3600);
        assert_eq!(parsed.nanosecond(), 683_147_000);

        let parsed = parse_timestamptz("2023-12-18 11:00:37+05:30").unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 5 * 3600 + 30 * 60);
        assert_eq!(parsed.nanosecond(), 0);

        let parsed = parse_timestamptz("2023-12-18 11:00:37.1234567891-03").unwrap();
        assert_eq!(parsed.nanosecond(), 123_456_789);
        assert_eq!(parsed.offset().local_minus_utc(), -3 * 3600);
    }

    #[test]
    fn test_time_and_date() {
        let time = parse_time("13:45:10.5").unwrap();
        assert_eq!(time.nanosecond(), 500_000_000);
        assert_eq!(
            parse_text(FieldType::Date, "2023-12-18").unwrap(),
            FieldValue::Date(NaiveDate::from_ymd_opt(2023, 12, 18).unwrap())
        );
    }

    #[test]
    fn test_bytea() {
        assert_eq!(parse_bytea(r"\xdeadBEEF").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_bytea(r"\x").unwrap(), Vec::<u8>::new());
        assert!(matches!(
            parse_bytea("deadbeef").unwrap_err(),
            Error::IllegalArgument(_)
        ));
        assert!(parse_bytea(r"\xabc").is_err());
    }

    #[test]
    fn test_bytea_rejects_non_hex_text() {
        for bad in ["\\x1\u{e9}1", "\\x\u{e9}", "\\xzz", "\\x+1"] {
            assert!(
                matches!(parse_bytea(bad).unwrap_err(), Error::IllegalArgument(_)),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_scalars() {
        assert_eq!(parse_text(FieldType::Int16, "-12").unwrap(), FieldValue::Int16(-12));
        assert_eq!(
            parse_text(FieldType::Int64, "9223372036854775807").unwrap(),
            FieldValue::Int64(i64::MAX)
        );
        assert_eq!(parse_text(FieldType::Double, "1.5").unwrap(), FieldValue::Double(1.5));
        assert_eq!(parse_text(FieldType::Boolean, "t").unwrap(), FieldValue::Boolean(true));
        assert_eq!(parse_text(FieldType::Boolean, "f").unwrap(), FieldValue::Boolean(false));
        assert_eq!(
            parse_text(FieldType::Char, "ab ").unwrap(),
            FieldValue::Char("ab ".into())
        );
        assert!(parse_text(FieldType::Int32, "4x").is_err());
        assert!(parse_text(FieldType::Uuid, "not-a-uuid").is_err());
    }

    #[test]
    fn test_arrays() {
        assert_eq!(
            parse_text(FieldType::Int32Array, "{1,2,3}").unwrap(),
            FieldValue::Int32Array(vec![1, 2, 3])
        );
        assert_eq!(
            parse_text(FieldType::BooleanArray, "{t,f}").unwrap(),
            FieldValue::BooleanArray(vec![true, false])
        );
        assert_eq!(
            parse_text(FieldType::BytesArray, r#"{"\\x0102","\\xff"}"#).unwrap(),
            FieldValue::BytesArray(vec![vec![1, 2], vec![0xff]])
        );
        assert_eq!(
            parse_text(FieldType::TimestampArray, r#"{"2023-12-18 11:00:37.5"}"#)
                .unwrap()
                .field_type(),
            FieldType::TimestampArray
        );
    }

    #[test]
    fn test_binary_values() {
        assert_eq!(
            parse_binary(FieldType::Bytes, &[1, 2]).unwrap(),
            FieldValue::Bytes(vec![1, 2])
        );
        assert!(matches!(
            parse_binary(FieldType::Int32, &[0, 0, 0, 1]).unwrap_err(),
            Error::NotImplemented(_)
        ));
    }

    #[test]
    fn test_pg_timestamp_to_utc() {
        let ts = pg_timestamp_to_utc(753_122_966_178_750).unwrap();
        assert_eq!(ts.timestamp(), 946_684_800 + 753_122_966);
        assert_eq!(ts.timestamp_subsec_micros(), 178_750);
        assert_eq!(pg_timestamp_to_utc(0).unwrap().year(), 2000);
    }
}
