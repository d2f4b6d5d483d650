//! Query-filter matching (`find`, `count_documents`, `$match`)

use super::expr;
use super::value::{compare_in_bracket, lookup_in, matches_type, truthy, values_equal};
use super::Document;
use crate::error::AssistantError;
use crate::Result;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Whether `doc` satisfies `filter`. An empty filter matches everything.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let satisfied = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    if matches(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in clauses(key, condition)? {
                    if matches(doc, clause)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$expr" => truthy(&expr::evaluate(condition, doc)?),
            op if op.starts_with('$') => {
                return Err(AssistantError::QueryExecution(format!(
                    "unknown top level operator: {}",
                    op
                )))
            }
            path => field_matches(lookup_in(doc, path), condition)?,
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(op: &str, condition: &'a Value) -> Result<Vec<&'a Document>> {
    let Value::Array(items) = condition else {
        return Err(AssistantError::QueryExecution(format!(
            "{} must be an array",
            op
        )));
    };
    if items.is_empty() {
        return Err(AssistantError::QueryExecution(format!(
            "{} argument must be a non-empty array",
            op
        )));
    }
    items
        .iter()
        .map(|item| match item {
            Value::Object(clause) => Ok(clause),
            _ => Err(AssistantError::QueryExecution(format!(
                "{} argument's entries must be objects",
                op
            ))),
        })
        .collect()
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn field_matches(actual: Option<&Value>, condition: &Value) -> Result<bool> {
    match condition {
        Value::Object(ops) if is_operator_object(ops) => {
            for (op, operand) in ops {
                if op == "$options" {
                    continue;
                }
                if !apply_operator(actual, op, operand, ops)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        literal => Ok(equals(actual, literal)),
    }
}

/// Equality the way the query language sees it: `null` matches a missing
/// field, and an array field matches when any element is equal.
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(value) => {
            if values_equal(value, expected) {
                return true;
            }
            match value {
                Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
                _ => false,
            }
        }
    }
}

/// Candidate values for range operators: the value itself plus array elements.
fn candidates(actual: Option<&Value>) -> Vec<&Value> {
    match actual {
        None => Vec::new(),
        Some(whole @ Value::Array(items)) => {
            let mut all: Vec<&Value> = items.iter().collect();
            all.push(whole);
            all
        }
        Some(value) => vec![value],
    }
}

fn apply_operator(
    actual: Option<&Value>,
    op: &str,
    operand: &Value,
    siblings: &Map<String, Value>,
) -> Result<bool> {
    match op {
        "$eq" => Ok(equals(actual, operand)),
        "$ne" => Ok(!equals(actual, operand)),
        "$gt" | "$gte" | "$lt" | "$lte" => {
            if operand.is_null() {
                // Null only compares equal to null or missing.
                return Ok(matches!(op, "$gte" | "$lte") && equals(actual, operand));
            }
            Ok(candidates(actual).into_iter().any(|value| {
                match compare_in_bracket(value, operand) {
                    Some(ordering) => match op {
                        "$gt" => ordering == Ordering::Greater,
                        "$gte" => ordering != Ordering::Less,
                        "$lt" => ordering == Ordering::Less,
                        _ => ordering != Ordering::Greater,
                    },
                    None => false,
                }
            }))
        }
        "$in" | "$nin" => {
            let Value::Array(options) = operand else {
                return Err(AssistantError::QueryExecution(format!(
                    "{} needs an array",
                    op
                )));
            };
            let mut found = false;
            for option in options {
                let hit = match option {
                    Value::String(pattern) if is_regex_literal(pattern) => {
                        regex_matches(actual, &regex_from_literal(pattern)?)
                    }
                    other => equals(actual, other),
                };
                if hit {
                    found = true;
                    break;
                }
            }
            Ok(if op == "$in" { found } else { !found })
        }
        "$exists" => Ok(actual.is_some() == truthy(operand)),
        "$type" => match actual {
            None => Ok(false),
            Some(value) => matches_type(value, operand),
        },
        "$regex" => {
            let pattern = match operand {
                Value::String(pattern) => pattern,
                _ => {
                    return Err(AssistantError::QueryExecution(
                        "$regex has to be a string".to_string(),
                    ))
                }
            };
            let options = match siblings.get("$options") {
                Some(Value::String(options)) => options.as_str(),
                Some(_) => {
                    return Err(AssistantError::QueryExecution(
                        "$options has to be a string".to_string(),
                    ))
                }
                None => "",
            };
            Ok(regex_matches(actual, &build_regex(pattern, options)?))
        }
        "$not" => match operand {
            Value::Object(inner) if is_operator_object(inner) => {
                Ok(!field_matches(actual, operand)?)
            }
            Value::String(pattern) if is_regex_literal(pattern) => {
                Ok(!regex_matches(actual, &regex_from_literal(pattern)?))
            }
            _ => Err(AssistantError::QueryExecution(
                "$not needs a regex or a document".to_string(),
            )),
        },
        "$size" => {
            let Some(expected) = operand.as_u64() else {
                return Err(AssistantError::QueryExecution(
                    "$size needs a non-negative integer".to_string(),
                ));
            };
            Ok(matches!(actual, Some(Value::Array(items)) if items.len() as u64 == expected))
        }
        unknown => Err(AssistantError::QueryExecution(format!(
            "unknown operator: {}",
            unknown
        ))),
    }
}

fn build_regex(pattern: &str, options: &str) -> Result<Regex> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            other => {
                return Err(AssistantError::QueryExecution(format!(
                    "invalid flag in regex options: {}",
                    other
                )))
            }
        }
    }
    builder
        .build()
        .map_err(|e| AssistantError::QueryExecution(format!("Regular expression is invalid: {}", e)))
}

/// `/pattern/flags` written as a plain string inside `$in` or `$not`.
fn is_regex_literal(text: &str) -> bool {
    text.len() >= 2 && text.starts_with('/') && text[1..].contains('/')
}

fn regex_from_literal(text: &str) -> Result<Regex> {
    let (pattern, flags) = text[1..].rsplit_once('/').unwrap_or((&text[1..], ""));
    build_regex(pattern, flags)
}

fn regex_matches(actual: Option<&Value>, regex: &Regex) -> bool {
    match actual {
        Some(Value::String(text)) => regex.is_match(text),
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| matches!(item, Value::String(text) if regex.is_match(text))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test value must be an object"),
        }
    }

    fn record() -> Document {
        doc(json!({
            "Fiscal Year": "2013-2014",
            "Department Name": "Corrections and Rehabilitation, Department of",
            "Total Price": 1500.0,
            "Quantity": 3,
            "CalCard": "NO",
            "Classification Codes": ["43211503", "43211507"],
            "Supplier Name": null
        }))
    }

    #[test]
    fn test_equality_and_ranges() {
        let r = record();
        assert!(matches(&r, &doc(json!({"Fiscal Year": "2013-2014"}))).unwrap());
        assert!(!matches(&r, &doc(json!({"Fiscal Year": "2012-2013"}))).unwrap());
        assert!(matches(&r, &doc(json!({"Total Price": {"$gt": 0, "$type": "number"}}))).unwrap());
        assert!(!matches(&r, &doc(json!({"Total Price": {"$lt": 1000}}))).unwrap());
        assert!(matches(&r, &doc(json!({"Classification Codes": "43211507"}))).unwrap());
        assert!(matches(&r, &doc(json!({}))).unwrap());
    }

    #[test]
    fn test_string_price_fails_positivity() {
        let r = doc(json!({"Total Price": "1500"}));
        assert!(!matches(&r, &doc(json!({"Total Price": {"$gt": 0, "$type": "number"}}))).unwrap());
    }

    #[test]
    fn test_null_and_exists() {
        let r = record();
        assert!(matches(&r, &doc(json!({"Supplier Name": null}))).unwrap());
        assert!(matches(&r, &doc(json!({"Missing": null}))).unwrap());
        assert!(matches(&r, &doc(json!({"Missing": {"$exists": false}}))).unwrap());
        assert!(!matches(&r, &doc(json!({"Supplier Name": {"$exists": false}}))).unwrap());
    }

    #[test]
    fn test_logical_and_regex() {
        let r = record();
        let filter = doc(json!({
            "$or": [{"CalCard": "YES"}, {"Department Name": {"$regex": "corrections", "$options": "i"}}]
        }));
        assert!(matches(&r, &filter).unwrap());
        assert!(matches(&r, &doc(json!({"CalCard": {"$in": ["YES", "NO"]}}))).unwrap());
        assert!(matches(&r, &doc(json!({"CalCard": {"$nin": ["YES"]}}))).unwrap());
        assert!(!matches(&r, &doc(json!({"$nor": [{"CalCard": "NO"}]}))).unwrap());
    }

    #[test]
    fn test_expr_filter() {
        let r = record();
        let filter = doc(json!({"$expr": {"$gt": ["$Total Price", {"$multiply": ["$Quantity", 100]}]}}));
        assert!(matches(&r, &filter).unwrap());
    }

    #[test]
    fn test_unknown_operators_error() {
        let r = record();
        assert!(matches(&r, &doc(json!({"$where": "1"}))).is_err());
        assert!(matches(&r, &doc(json!({"Quantity": {"$between": [1, 2]}}))).is_err());
        assert!(matches(&r, &doc(json!({"$or": []}))).is_err());
    }
}
