//! Value helpers shared by the filter, expression and pipeline evaluators
//!
//! Dates that come out of expressions use the extended-JSON shape
//! `{"$date": "<RFC3339>"}` so rows stay plain `serde_json` values.

use super::Document;
use crate::error::AssistantError;
use crate::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

pub const DATE_KEY: &str = "$date";

//
// ================= Paths =================
//

/// Resolve a dotted path (`_id.fiscal_year`) against a value.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub fn lookup_in<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let first = doc.get(head)?;
    match rest {
        Some(rest) => lookup(first, rest),
        None => Some(first),
    }
}

/// Set a dotted path, creating intermediate objects as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

pub fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

//
// ================= Dates =================
//

pub fn date_value(dt: DateTime<Utc>) -> Value {
    let mut map = Map::new();
    map.insert(
        DATE_KEY.to_string(),
        Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Value::Object(map)
}

pub fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    let Value::Object(map) = value else {
        return None;
    };
    if map.len() != 1 {
        return None;
    }
    match map.get(DATE_KEY)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

pub fn is_date(value: &Value) -> bool {
    as_date(value).is_some()
}

/// Parse the textual timestamps written by the ingestion pipeline.
pub fn parse_date_string(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    None
}

//
// ================= Numbers =================
//

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub fn is_integer(value: &Value) -> bool {
    matches!(value, Value::Number(n) if n.is_i64() || n.is_u64())
}

/// Non-finite results become `null` (JSON cannot carry NaN).
pub fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

//
// ================= Types =================
//

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) => match n.as_i64() {
            Some(i) if i32::try_from(i).is_ok() => "int",
            Some(_) => "long",
            None if n.is_u64() => "long",
            None => "double",
        },
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) if is_date(value) => "date",
        Value::Object(_) => "object",
    }
}

/// `$type` matcher: string aliases, numeric codes, or a list of either.
pub fn matches_type(value: &Value, spec: &Value) -> Result<bool> {
    match spec {
        Value::Array(specs) => {
            for spec in specs {
                if matches_type(value, spec)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::String(alias) => {
            let actual = type_name(value);
            Ok(match alias.as_str() {
                "number" => matches!(actual, "int" | "long" | "double"),
                "double" | "int" | "long" | "string" | "bool" | "null" | "date" | "object"
                | "array" => actual == alias,
                "decimal" => false,
                other => {
                    return Err(AssistantError::QueryExecution(format!(
                        "Unknown type name alias: {}",
                        other
                    )))
                }
            })
        }
        Value::Number(code) => {
            let alias = match code.as_i64() {
                Some(1) => "double",
                Some(2) => "string",
                Some(3) => "object",
                Some(4) => "array",
                Some(8) => "bool",
                Some(9) => "date",
                Some(10) => "null",
                Some(16) => "int",
                Some(18) => "long",
                _ => {
                    return Err(AssistantError::QueryExecution(format!(
                        "Invalid numerical type code: {}",
                        code
                    )))
                }
            };
            matches_type(value, &Value::String(alias.to_string()))
        }
        other => Err(AssistantError::QueryExecution(format!(
            "type must be represented as a number or a string, got {}",
            other
        ))),
    }
}

//
// ================= Ordering =================
//

/// Cross-type sort rank (null < numbers < strings < objects < arrays < bools < dates)
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(_) if is_date(value) => 9,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
        Value::Bool(_) => 8,
    }
}

/// Total order used by `$sort`, `$min`, `$max` and expression comparisons.
pub fn compare(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => match (as_date(a), as_date(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.to_string().cmp(&b.to_string()),
        },
        _ => Ordering::Equal,
    }
}

/// Query-operator comparison: only values in the same type bracket compare.
pub fn compare_in_bracket(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::Bool(_), Value::Bool(_)) => Some(compare(a, b)),
        _ => match (as_date(a), as_date(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => None,
        },
    }
}

/// Equality with numeric coercion (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare(a, b) == Ordering::Equal,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| values_equal(l, r))
        }
        _ => match (as_date(a), as_date(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

/// Aggregation truthiness: false, null, zero and missing are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}
