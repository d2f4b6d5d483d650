//! Aggregation expression evaluator
//!
//! Evaluates `$field` paths, literals and operator objects against one
//! document. Missing fields evaluate to `null`.

use super::value::{
    as_date, as_f64, compare, date_value, float_value, is_integer, lookup_in, parse_date_string,
    truthy, values_equal,
};
use super::Document;
use crate::error::AssistantError;
use crate::Result;
use chrono::{DateTime, Datelike, NaiveDateTime, SecondsFormat, TimeDelta, TimeZone, Timelike, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;

pub fn evaluate(expr: &Value, doc: &Document) -> Result<Value> {
    match expr {
        Value::String(s) if s == "$$ROOT" || s == "$$CURRENT" => Ok(Value::Object(doc.clone())),
        Value::String(s) if s.starts_with("$$") => Err(AssistantError::QueryExecution(format!(
            "Use of undefined variable: {}",
            s
        ))),
        Value::String(s) if s.starts_with('$') => {
            Ok(lookup_in(doc, &s[1..]).cloned().unwrap_or(Value::Null))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate(item, doc))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => match operator_of(map) {
            Some((op, arg)) => apply(op, arg, doc),
            None => {
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    if key.starts_with('$') {
                        return Err(execution(format!(
                            "Unrecognized expression operator '{}' mixed with fields",
                            key
                        )));
                    }
                    out.insert(key.clone(), evaluate(value, doc)?);
                }
                Ok(Value::Object(out))
            }
        },
        literal => Ok(literal.clone()),
    }
}

fn operator_of(map: &Map<String, Value>) -> Option<(&str, &Value)> {
    if map.len() != 1 {
        return None;
    }
    map.iter()
        .next()
        .filter(|(key, _)| key.starts_with('$'))
        .map(|(key, value)| (key.as_str(), value))
}

fn execution(message: String) -> AssistantError {
    AssistantError::QueryExecution(message)
}

/// Evaluate an operator argument list, wrapping a scalar into one argument.
fn eval_args(arg: &Value, doc: &Document) -> Result<Vec<Value>> {
    match arg {
        Value::Array(items) => items.iter().map(|item| evaluate(item, doc)).collect(),
        single => Ok(vec![evaluate(single, doc)?]),
    }
}

fn exact_args<const N: usize>(op: &str, arg: &Value, doc: &Document) -> Result<[Value; N]> {
    let values = eval_args(arg, doc)?;
    let count = values.len();
    values.try_into().map_err(|_| {
        execution(format!(
            "Expression {} takes exactly {} arguments. {} were passed in.",
            op, N, count
        ))
    })
}

fn apply(op: &str, arg: &Value, doc: &Document) -> Result<Value> {
    match op {
        "$literal" => Ok(arg.clone()),

        // ---------- dates ----------
        "$dateFromString" => date_from_string(arg, doc),
        "$toDate" => {
            let [value] = exact_args::<1>(op, arg, doc)?;
            to_date(&value)
        }
        "$year" | "$month" | "$dayOfMonth" | "$dayOfWeek" | "$dayOfYear" | "$hour" => {
            date_part(op, arg, doc)
        }
        "$dateToString" => date_to_string(arg, doc),

        // ---------- conditionals ----------
        "$switch" => switch(arg, doc),
        "$cond" => cond(arg, doc),
        "$ifNull" => {
            let values = eval_args(arg, doc)?;
            if values.len() < 2 {
                return Err(execution("$ifNull needs at least two arguments".to_string()));
            }
            let last = values.len() - 1;
            Ok(values
                .iter()
                .take(last)
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| values[last].clone()))
        }

        // ---------- comparison / set ----------
        "$in" => {
            let [needle, haystack] = exact_args::<2>(op, arg, doc)?;
            let Value::Array(items) = haystack else {
                return Err(execution(
                    "$in requires an array as a second argument".to_string(),
                ));
            };
            Ok(Value::Bool(items.iter().any(|item| values_equal(item, &needle))))
        }
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let [left, right] = exact_args::<2>(op, arg, doc)?;
            let ordering = compare(&left, &right);
            let result = match op {
                "$eq" => values_equal(&left, &right),
                "$ne" => !values_equal(&left, &right),
                "$gt" => ordering == Ordering::Greater,
                "$gte" => ordering != Ordering::Less,
                "$lt" => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            };
            Ok(Value::Bool(result))
        }
        "$cmp" => {
            let [left, right] = exact_args::<2>(op, arg, doc)?;
            Ok(Value::from(match compare(&left, &right) {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            }))
        }

        // ---------- boolean ----------
        "$and" => Ok(Value::Bool(eval_args(arg, doc)?.iter().all(truthy))),
        "$or" => Ok(Value::Bool(eval_args(arg, doc)?.iter().any(truthy))),
        "$not" => {
            let [value] = exact_args::<1>(op, arg, doc)?;
            Ok(Value::Bool(!truthy(&value)))
        }

        // ---------- arithmetic ----------
        "$add" => add(eval_args(arg, doc)?),
        "$subtract" => {
            let [left, right] = exact_args::<2>(op, arg, doc)?;
            subtract(&left, &right)
        }
        "$multiply" => multiply(eval_args(arg, doc)?),
        "$divide" => {
            let [left, right] = exact_args::<2>(op, arg, doc)?;
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            let (l, r) = (numeric(op, &left)?, numeric(op, &right)?);
            if r == 0.0 {
                return Err(execution("can't $divide by zero".to_string()));
            }
            Ok(float_value(l / r))
        }
        "$round" => {
            let values = eval_args(arg, doc)?;
            let (value, places) = match values.as_slice() {
                [value] => (value, 0),
                [value, places] => (value, as_f64(places).unwrap_or(0.0) as i32),
                _ => return Err(execution("$round takes one or two arguments".to_string())),
            };
            if value.is_null() {
                return Ok(Value::Null);
            }
            let number = numeric(op, value)?;
            let factor = 10f64.powi(places);
            let rounded = (number * factor).round() / factor;
            if is_integer(value) && places >= 0 {
                return Ok(value.clone());
            }
            Ok(float_value(rounded))
        }
        "$abs" => {
            let [value] = exact_args::<1>(op, arg, doc)?;
            match value {
                Value::Null => Ok(Value::Null),
                Value::Number(ref n) if n.as_i64().is_some() => {
                    Ok(Value::from(n.as_i64().unwrap_or_default().abs()))
                }
                other => Ok(float_value(numeric(op, &other)?.abs())),
            }
        }

        // ---------- strings / arrays ----------
        "$concat" => {
            let mut out = String::new();
            for value in eval_args(arg, doc)? {
                match value {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => out.push_str(&s),
                    other => {
                        return Err(execution(format!(
                            "$concat only supports strings, not {}",
                            super::value::type_name(&other)
                        )))
                    }
                }
            }
            Ok(Value::String(out))
        }
        "$toUpper" | "$toLower" => {
            let [value] = exact_args::<1>(op, arg, doc)?;
            let text = match value {
                Value::Null => String::new(),
                Value::String(s) => s,
                other => stringify(&other),
            };
            Ok(Value::String(if op == "$toUpper" {
                text.to_uppercase()
            } else {
                text.to_lowercase()
            }))
        }
        "$toString" => {
            let [value] = exact_args::<1>(op, arg, doc)?;
            Ok(match value {
                Value::Null => Value::Null,
                other => Value::String(stringify(&other)),
            })
        }
        "$size" => {
            let [value] = exact_args::<1>(op, arg, doc)?;
            match value {
                Value::Array(items) => Ok(Value::from(items.len())),
                other => Err(execution(format!(
                    "The argument to $size must be an array. Type of argument: {}",
                    super::value::type_name(&other)
                ))),
            }
        }

        unknown => Err(execution(format!(
            "Unrecognized expression '{}'",
            unknown
        ))),
    }
}

fn numeric(op: &str, value: &Value) -> Result<f64> {
    as_f64(value).ok_or_else(|| {
        execution(format!(
            "{} only supports numeric types, not {}",
            op,
            super::value::type_name(value)
        ))
    })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => match as_date(other) {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => other.to_string(),
        },
    }
}

//
// ================= Arithmetic =================
//

fn add(values: Vec<Value>) -> Result<Value> {
    let mut date: Option<DateTime<Utc>> = None;
    let mut int_total: i64 = 0;
    let mut float_total = 0.0;
    let mut all_int = true;

    for value in &values {
        if value.is_null() {
            return Ok(Value::Null);
        }
        if let Some(dt) = as_date(value) {
            if date.is_some() {
                return Err(execution("only one date allowed in an $add expression".to_string()));
            }
            date = Some(dt);
            continue;
        }
        let number = numeric("$add", value)?;
        float_total += number;
        match value.as_i64() {
            Some(i) if all_int => match int_total.checked_add(i) {
                Some(sum) => int_total = sum,
                None => all_int = false,
            },
            _ => all_int = false,
        }
    }

    if let Some(dt) = date {
        return Ok(date_value(shift_date(dt, float_total)?));
    }
    Ok(if all_int {
        Value::from(int_total)
    } else {
        float_value(float_total)
    })
}

/// Move `dt` by a millisecond offset; out-of-range results are query errors.
fn shift_date(dt: DateTime<Utc>, millis: f64) -> Result<DateTime<Utc>> {
    let out_of_range = || execution("date out of range".to_string());
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    let delta = TimeDelta::try_milliseconds(millis as i64).ok_or_else(out_of_range)?;
    dt.checked_add_signed(delta).ok_or_else(out_of_range)
}

fn subtract(left: &Value, right: &Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    match (as_date(left), as_date(right)) {
        (Some(l), Some(r)) => Ok(Value::from((l - r).num_milliseconds())),
        (Some(l), None) => {
            let millis = numeric("$subtract", right)?;
            Ok(date_value(shift_date(l, -millis)?))
        }
        (None, Some(_)) => Err(execution(
            "can't $subtract a date from a number".to_string(),
        )),
        (None, None) => match (left.as_i64(), right.as_i64()) {
            (Some(l), Some(r)) if l.checked_sub(r).is_some() => Ok(Value::from(l - r)),
            _ => Ok(float_value(
                numeric("$subtract", left)? - numeric("$subtract", right)?,
            )),
        },
    }
}

fn multiply(values: Vec<Value>) -> Result<Value> {
    let mut int_product: i64 = 1;
    let mut float_product = 1.0;
    let mut all_int = true;
    for value in &values {
        if value.is_null() {
            return Ok(Value::Null);
        }
        float_product *= numeric("$multiply", value)?;
        match value.as_i64() {
            Some(i) if all_int => match int_product.checked_mul(i) {
                Some(p) => int_product = p,
                None => all_int = false,
            },
            _ => all_int = false,
        }
    }
    Ok(if all_int {
        Value::from(int_product)
    } else {
        float_value(float_product)
    })
}

//
// ================= Dates =================
//

fn named_arg<'a>(op: &str, spec: &'a Map<String, Value>, name: &str) -> Result<&'a Value> {
    spec.get(name)
        .ok_or_else(|| execution(format!("Missing '{}' parameter to {}", name, op)))
}

fn date_from_string(arg: &Value, doc: &Document) -> Result<Value> {
    let Value::Object(spec) = arg else {
        return Err(execution(
            "$dateFromString only supports an object as an argument".to_string(),
        ));
    };
    let input = evaluate(named_arg("$dateFromString", spec, "dateString")?, doc)?;
    let format = match spec.get("format") {
        Some(format) => match evaluate(format, doc)? {
            Value::String(f) => Some(f),
            Value::Null => None,
            _ => return Err(execution("$dateFromString format must be a string".to_string())),
        },
        None => None,
    };

    let text = match input {
        Value::Null => {
            return match spec.get("onNull") {
                Some(on_null) => evaluate(on_null, doc),
                None => Ok(Value::Null),
            }
        }
        Value::String(text) => text,
        other => {
            return fallback(spec, doc, format!(
                "$dateFromString requires that 'dateString' be a string, found: {}",
                super::value::type_name(&other)
            ))
        }
    };

    let parsed = match format {
        Some(format) => {
            let pattern = format.replace("%L", "%3f");
            NaiveDateTime::parse_from_str(&text, &pattern)
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
                .or_else(|| {
                    chrono::NaiveDate::parse_from_str(&text, &pattern)
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|naive| Utc.from_utc_datetime(&naive))
                })
        }
        None => parse_date_string(&text),
    };

    match parsed {
        Some(dt) => Ok(date_value(dt)),
        None => fallback(
            spec,
            doc,
            format!("Error parsing date string '{}'", text),
        ),
    }
}

fn fallback(spec: &Map<String, Value>, doc: &Document, message: String) -> Result<Value> {
    match spec.get("onError") {
        Some(on_error) => evaluate(on_error, doc),
        None => Err(execution(message)),
    }
}

fn to_date(value: &Value) -> Result<Value> {
    if value.is_null() || as_date(value).is_some() {
        return Ok(value.clone());
    }
    match value {
        Value::String(text) => parse_date_string(text)
            .map(date_value)
            .ok_or_else(|| execution(format!("Error parsing date string '{}'", text))),
        Value::Number(n) => n
            .as_f64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
            .map(date_value)
            .ok_or_else(|| execution("$toDate value out of range".to_string())),
        other => Err(execution(format!(
            "Unsupported conversion from {} to date in $toDate",
            super::value::type_name(other)
        ))),
    }
}

fn date_part(op: &str, arg: &Value, doc: &Document) -> Result<Value> {
    let target = match arg {
        Value::Object(spec) if spec.contains_key("date") => named_arg(op, spec, "date")?,
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    };
    let value = evaluate(target, doc)?;
    if value.is_null() {
        return Ok(Value::Null);
    }
    let Some(dt) = as_date(&value) else {
        return Err(execution(format!(
            "can't convert from BSON type {} to Date",
            super::value::type_name(&value)
        )));
    };
    let part = match op {
        "$year" => dt.year() as i64,
        "$month" => dt.month() as i64,
        "$dayOfMonth" => dt.day() as i64,
        "$dayOfWeek" => dt.weekday().number_from_sunday() as i64,
        "$dayOfYear" => dt.ordinal() as i64,
        _ => dt.hour() as i64,
    };
    Ok(Value::from(part))
}

fn date_to_string(arg: &Value, doc: &Document) -> Result<Value> {
    let Value::Object(spec) = arg else {
        return Err(execution("$dateToString only supports an object as its argument".to_string()));
    };
    let value = evaluate(named_arg("$dateToString", spec, "date")?, doc)?;
    if value.is_null() {
        return match spec.get("onNull") {
            Some(on_null) => evaluate(on_null, doc),
            None => Ok(Value::Null),
        };
    }
    let Some(dt) = as_date(&value) else {
        return Err(execution(format!(
            "can't convert from BSON type {} to Date",
            super::value::type_name(&value)
        )));
    };
    let format = match spec.get("format") {
        Some(Value::String(format)) => format.replace("%L", "%3f"),
        Some(_) => return Err(execution("$dateToString format must be a string".to_string())),
        None => "%Y-%m-%dT%H:%M:%S%.3fZ".to_string(),
    };
    Ok(Value::String(dt.format(&format).to_string()))
}

//
// ================= Conditionals =================
//

fn switch(arg: &Value, doc: &Document) -> Result<Value> {
    let Value::Object(spec) = arg else {
        return Err(execution("$switch requires an object as an argument".to_string()));
    };
    let Some(Value::Array(branches)) = spec.get("branches") else {
        return Err(execution("$switch expected an array for 'branches'".to_string()));
    };
    for branch in branches {
        let Value::Object(branch) = branch else {
            return Err(execution("$switch expected each branch to be an object".to_string()));
        };
        let case = named_arg("$switch", branch, "case")?;
        let then = named_arg("$switch", branch, "then")?;
        if truthy(&evaluate(case, doc)?) {
            return evaluate(then, doc);
        }
    }
    match spec.get("default") {
        Some(default) => evaluate(default, doc),
        None => Err(execution(
            "$switch could not find a matching branch for an input, and no default was specified."
                .to_string(),
        )),
    }
}

fn cond(arg: &Value, doc: &Document) -> Result<Value> {
    let (condition, then, otherwise) = match arg {
        Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
        Value::Object(spec) => (
            named_arg("$cond", spec, "if")?,
            named_arg("$cond", spec, "then")?,
            named_arg("$cond", spec, "else")?,
        ),
        _ => return Err(execution("$cond requires 3 arguments".to_string())),
    };
    if truthy(&evaluate(condition, doc)?) {
        evaluate(then, doc)
    } else {
        evaluate(otherwise, doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test document must be an object"),
        }
    }

    #[test]
    fn test_field_paths_and_literals() {
        let d = doc(json!({"Total Price": 12.5, "nested": {"a": 1}}));
        assert_eq!(evaluate(&json!("$Total Price"), &d).unwrap(), json!(12.5));
        assert_eq!(evaluate(&json!("$nested.a"), &d).unwrap(), json!(1));
        assert_eq!(evaluate(&json!("$missing"), &d).unwrap(), json!(null));
        assert_eq!(evaluate(&json!({"$literal": "$x"}), &d).unwrap(), json!("$x"));
    }

    #[test]
    fn test_date_arithmetic_out_of_range_is_an_error() {
        let d = doc(json!({"Creation Date": "2013-08-27T00:00:00"}));
        let parsed = json!({"$dateFromString": {"dateString": "$Creation Date"}});

        let shifted = evaluate(&json!({"$add": [parsed.clone(), 86_400_000]}), &d).unwrap();
        assert_eq!(as_date(&shifted).map(|dt| dt.day()), Some(28));

        for expr in [
            json!({"$add": [parsed.clone(), 1e18]}),
            json!({"$add": [parsed.clone(), -1e18]}),
            json!({"$subtract": [parsed.clone(), 1e18]}),
            json!({"$subtract": [parsed.clone(), 1e300]}),
        ] {
            let err = evaluate(&expr, &d).unwrap_err();
            assert!(matches!(err, AssistantError::QueryExecution(ref m) if m == "date out of range"));
        }
    }

    #[test]
    fn test_month_requires_date_conversion() {
        let d = doc(json!({"Creation Date": "2013-08-27T00:00:00"}));

        let raw = evaluate(&json!({"$month": "$Creation Date"}), &d);
        assert!(matches!(raw, Err(AssistantError::QueryExecution(_))));

        let converted = evaluate(
            &json!({"$month": {"$dateFromString": {"dateString": "$Creation Date"}}}),
            &d,
        )
        .unwrap();
        assert_eq!(converted, json!(8));
    }

    #[test]
    fn test_date_from_string_fallbacks() {
        let d = doc(json!({"bad": "n/a"}));
        let on_null = evaluate(
            &json!({"$dateFromString": {"dateString": "$missing", "onNull": "none"}}),
            &d,
        )
        .unwrap();
        assert_eq!(on_null, json!("none"));

        let on_error = evaluate(
            &json!({"$dateFromString": {"dateString": "$bad", "onError": null}}),
            &d,
        )
        .unwrap();
        assert_eq!(on_error, json!(null));
    }

    #[test]
    fn test_switch_with_default() {
        let expr = json!({"$switch": {
            "branches": [
                {"case": {"$in": ["$m", [7, 8, 9]]}, "then": "Q1"},
                {"case": {"$in": ["$m", [10, 11, 12]]}, "then": "Q2"}
            ],
            "default": "Unknown"
        }});
        assert_eq!(evaluate(&expr, &doc(json!({"m": 8}))).unwrap(), json!("Q1"));
        assert_eq!(evaluate(&expr, &doc(json!({"m": 13}))).unwrap(), json!("Unknown"));
    }

    #[test]
    fn test_arithmetic() {
        let d = doc(json!({"q": 3, "p": 2.5}));
        assert_eq!(evaluate(&json!({"$multiply": ["$q", "$p"]}), &d).unwrap(), json!(7.5));
        assert_eq!(evaluate(&json!({"$add": [1, 2, 3]}), &d).unwrap(), json!(6));
        assert_eq!(evaluate(&json!({"$round": [{"$divide": [10, 3]}, 2]}), &d).unwrap(), json!(3.33));
        assert!(evaluate(&json!({"$divide": [1, 0]}), &d).is_err());
        assert!(evaluate(&json!({"$bogus": 1}), &d).is_err());
    }
}
