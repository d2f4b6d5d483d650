//! Aggregation pipeline evaluation

use super::expr::evaluate;
use super::filter;
use super::value::{
    as_f64, compare, float_value, lookup_in, remove_path, set_path, truthy, values_equal,
};
use super::Document;
use crate::error::AssistantError;
use crate::Result;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::debug;

/// Run `stages` over `docs` in order.
pub fn run(docs: Vec<Document>, stages: &[Document]) -> Result<Vec<Document>> {
    stages.iter().try_fold(docs, |current, stage| apply_stage(current, stage))
}

fn execution(message: impl Into<String>) -> AssistantError {
    AssistantError::QueryExecution(message.into())
}

fn apply_stage(docs: Vec<Document>, stage: &Document) -> Result<Vec<Document>> {
    if stage.len() != 1 {
        return Err(execution(
            "A pipeline stage specification object must contain exactly one field.",
        ));
    }
    let Some((name, spec)) = stage.iter().next() else {
        return Err(execution("empty pipeline stage"));
    };
    debug!(stage = %name, input_rows = docs.len(), "Applying stage");

    match name.as_str() {
        "$match" => {
            let filter = object_spec(name, spec)?;
            let mut kept = Vec::with_capacity(docs.len());
            for doc in docs {
                if filter::matches(&doc, filter)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        "$addFields" | "$set" => {
            let fields = object_spec(name, spec)?;
            docs.into_iter()
                .map(|mut doc| {
                    for (path, expr) in fields {
                        let value = evaluate(expr, &doc)?;
                        set_path(&mut doc, path, value);
                    }
                    Ok(doc)
                })
                .collect()
        }
        "$project" => project(docs, object_spec(name, spec)?),
        "$group" => group(docs, object_spec(name, spec)?),
        "$sort" => sort(docs, object_spec(name, spec)?),
        "$limit" => {
            let n = positive_count(name, spec)?;
            Ok(docs.into_iter().take(n).collect())
        }
        "$skip" => {
            let n = spec
                .as_u64()
                .ok_or_else(|| execution("$skip must be a non-negative integer"))?;
            Ok(docs.into_iter().skip(n as usize).collect())
        }
        "$count" => {
            let Value::String(field) = spec else {
                return Err(execution("the count field must be a non-empty string"));
            };
            if field.is_empty() || field.starts_with('$') || field.contains('.') {
                return Err(execution("the count field must be a non-empty string without '$' or '.'"));
            }
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut row = Map::new();
            row.insert(field.clone(), Value::from(docs.len()));
            Ok(vec![row])
        }
        "$unwind" => unwind(docs, spec),
        other => Err(execution(format!(
            "Unrecognized pipeline stage name: '{}' (unsupported stage)",
            other
        ))),
    }
}

fn object_spec<'a>(name: &str, spec: &'a Value) -> Result<&'a Document> {
    match spec {
        Value::Object(map) => Ok(map),
        _ => Err(execution(format!(
            "the {} stage specification must be an object",
            name
        ))),
    }
}

fn positive_count(name: &str, spec: &Value) -> Result<usize> {
    spec.as_u64()
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .ok_or_else(|| execution(format!("the {} must be positive", name)))
}

//
// ================= $project =================
//

fn project(docs: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
    let mut exclude_id = false;
    let mut inclusions: Vec<(&String, Option<&Value>)> = Vec::new();
    let mut exclusions: Vec<&String> = Vec::new();

    for (path, value) in spec {
        let flag = match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
            _ => None,
        };
        match flag {
            Some(false) if path == "_id" => exclude_id = true,
            Some(false) => exclusions.push(path),
            Some(true) => inclusions.push((path, None)),
            None => inclusions.push((path, Some(value))),
        }
    }

    if !inclusions.is_empty() && !exclusions.is_empty() {
        return Err(execution(
            "Invalid $project: cannot mix inclusion and exclusion of fields",
        ));
    }

    docs.into_iter()
        .map(|doc| {
            if inclusions.is_empty() {
                let mut out = doc;
                for path in &exclusions {
                    remove_path(&mut out, path);
                }
                if exclude_id {
                    out.remove("_id");
                }
                return Ok(out);
            }

            let mut out = Map::new();
            if !exclude_id {
                if let Some(id) = doc.get("_id") {
                    out.insert("_id".to_string(), id.clone());
                }
            }
            for (path, expr) in &inclusions {
                match expr {
                    Some(expr) => set_path(&mut out, path, evaluate(expr, &doc)?),
                    None => {
                        if let Some(value) = lookup_in(&doc, path) {
                            set_path(&mut out, path, value.clone());
                        }
                    }
                }
            }
            Ok(out)
        })
        .collect()
}

//
// ================= $group =================
//

enum Accumulator {
    Sum { int: i64, float: f64, all_int: bool },
    Avg { total: f64, count: usize },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self> {
        Ok(match op {
            "$sum" | "$count" => Accumulator::Sum {
                int: 0,
                float: 0.0,
                all_int: true,
            },
            "$avg" => Accumulator::Avg { total: 0.0, count: 0 },
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(None),
            "$push" => Accumulator::Push(Vec::new()),
            "$addToSet" => Accumulator::AddToSet(Vec::new()),
            other => {
                return Err(execution(format!(
                    "unknown group operator '{}'",
                    other
                )))
            }
        })
    }

    fn feed(&mut self, value: Value) {
        match self {
            // Non-numeric inputs are ignored by $sum and $avg.
            Accumulator::Sum { int, float, all_int } => {
                if let Some(f) = as_f64(&value) {
                    *float += f;
                    match value.as_i64() {
                        Some(i) if *all_int => match int.checked_add(i) {
                            Some(total) => *int = total,
                            None => *all_int = false,
                        },
                        _ => *all_int = false,
                    }
                }
            }
            Accumulator::Avg { total, count } => {
                if let Some(f) = as_f64(&value) {
                    *total += f;
                    *count += 1;
                }
            }
            Accumulator::Min(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .map_or(true, |c| compare(&value, c) == Ordering::Less)
                {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .map_or(true, |c| compare(&value, c) == Ordering::Greater)
                {
                    *current = Some(value);
                }
            }
            Accumulator::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            Accumulator::Last(current) => *current = Some(value),
            Accumulator::Push(values) => values.push(value),
            Accumulator::AddToSet(values) => {
                if !values.iter().any(|v| values_equal(v, &value)) {
                    values.push(value);
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Sum { int, float, all_int } => {
                if all_int {
                    Value::from(int)
                } else {
                    float_value(float)
                }
            }
            Accumulator::Avg { total, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    float_value(total / count as f64)
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) | Accumulator::First(v) | Accumulator::Last(v) => {
                v.unwrap_or(Value::Null)
            }
            Accumulator::Push(values) | Accumulator::AddToSet(values) => Value::Array(values),
        }
    }
}

struct GroupSpec<'a> {
    id: &'a Value,
    fields: Vec<(&'a String, &'a str, &'a Value)>,
}

fn group_spec(spec: &Document) -> Result<GroupSpec<'_>> {
    let id = spec
        .get("_id")
        .ok_or_else(|| execution("a group specification must include an _id"))?;
    let mut fields = Vec::new();
    for (name, acc) in spec {
        if name == "_id" {
            continue;
        }
        let Value::Object(acc) = acc else {
            return Err(execution(format!(
                "The field '{}' must be an accumulator object",
                name
            )));
        };
        if acc.len() != 1 {
            return Err(execution(format!(
                "The field '{}' must specify one accumulator",
                name
            )));
        }
        if let Some((op, arg)) = acc.iter().next() {
            fields.push((name, op.as_str(), arg));
        }
    }
    Ok(GroupSpec { id, fields })
}

fn group(docs: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
    let spec = group_spec(spec)?;
    // Groups keep first-seen order; keys compare with numeric coercion.
    let mut groups: Vec<(Value, Vec<Accumulator>)> = Vec::new();

    for doc in &docs {
        let key = evaluate(spec.id, doc)?;
        let index = match groups.iter().position(|(k, _)| values_equal(k, &key)) {
            Some(index) => index,
            None => {
                let accumulators = spec
                    .fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<Vec<_>>>()?;
                groups.push((key, accumulators));
                groups.len() - 1
            }
        };
        for (acc, (_, op, arg)) in groups[index].1.iter_mut().zip(spec.fields.iter()) {
            let value = if *op == "$count" {
                Value::from(1)
            } else {
                evaluate(arg, doc)?
            };
            acc.feed(value);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut row = Map::new();
            row.insert("_id".to_string(), key);
            for ((name, _, _), acc) in spec.fields.iter().zip(accumulators) {
                row.insert((*name).clone(), acc.finish());
            }
            row
        })
        .collect())
}

//
// ================= $sort / $unwind =================
//

fn sort(mut docs: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
    if spec.is_empty() {
        return Err(execution("$sort stage must have at least one sort key"));
    }
    let keys = spec
        .iter()
        .map(|(path, direction)| match direction.as_i64() {
            Some(1) => Ok((path.as_str(), false)),
            Some(-1) => Ok((path.as_str(), true)),
            _ => Err(execution("$sort key ordering must be 1 (for ascending) or -1 (for descending)")),
        })
        .collect::<Result<Vec<_>>>()?;

    docs.sort_by(|a, b| {
        for (path, descending) in &keys {
            let left = lookup_in(a, path).unwrap_or(&Value::Null);
            let right = lookup_in(b, path).unwrap_or(&Value::Null);
            let ordering = compare(left, right);
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}

fn unwind(docs: Vec<Document>, spec: &Value) -> Result<Vec<Document>> {
    let (path, preserve) = match spec {
        Value::String(path) => (path.as_str(), false),
        Value::Object(options) => match options.get("path") {
            Some(Value::String(path)) => (
                path.as_str(),
                options
                    .get("preserveNullAndEmptyArrays")
                    .map(truthy)
                    .unwrap_or(false),
            ),
            _ => return Err(execution("$unwind requires a 'path' string")),
        },
        _ => return Err(execution("$unwind requires a string or an object")),
    };
    let Some(field) = path.strip_prefix('$') else {
        return Err(execution("$unwind path must be prefixed by a '$'"));
    };

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match lookup_in(&doc, field).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, field, item);
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(values: Vec<Value>) -> Vec<Document> {
        values
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect()
    }

    fn stages(value: Value) -> Vec<Document> {
        docs(value.as_array().cloned().unwrap_or_default())
    }

    fn sample() -> Vec<Document> {
        docs(vec![
            json!({"Fiscal Year": "2013-2014", "Department Name": "A", "Total Price": 100.0}),
            json!({"Fiscal Year": "2013-2014", "Department Name": "B", "Total Price": 250.5}),
            json!({"Fiscal Year": "2013-2014", "Department Name": "A", "Total Price": "bad"}),
            json!({"Fiscal Year": "2012-2013", "Department Name": "A", "Total Price": 40}),
            json!({"Fiscal Year": "2012-2013", "Department Name": "C", "Total Price": -5}),
        ])
    }

    #[test]
    fn test_group_sum_with_positivity() {
        let pipeline = stages(json!([
            {"$match": {"Total Price": {"$gt": 0, "$type": "number"}}},
            {"$group": {"_id": "$Fiscal Year", "total": {"$sum": "$Total Price"}, "n": {"$count": {}}}},
            {"$sort": {"total": -1}}
        ]));
        let rows = run(sample(), &pipeline).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("_id"), Some(&json!("2013-2014")));
        assert_eq!(rows[0].get("total"), Some(&json!(350.5)));
        assert_eq!(rows[0].get("n"), Some(&json!(2)));
        assert_eq!(rows[1].get("total"), Some(&json!(40)));
    }

    #[test]
    fn test_project_limit_skip_count() {
        let pipeline = stages(json!([
            {"$project": {"_id": 0, "dept": "$Department Name"}},
            {"$skip": 1},
            {"$limit": 2}
        ]));
        let rows = run(sample(), &pipeline).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("dept"), Some(&json!("B")));

        let counted = run(sample(), &stages(json!([{"$count": "records"}]))).unwrap();
        assert_eq!(counted[0].get("records"), Some(&json!(5)));
    }

    #[test]
    fn test_unwind_and_add_to_set() {
        let input = docs(vec![json!({"codes": ["1", "2", "1"]}), json!({"codes": []})]);
        let pipeline = stages(json!([
            {"$unwind": "$codes"},
            {"$group": {"_id": null, "unique": {"$addToSet": "$codes"}}}
        ]));
        let rows = run(input, &pipeline).unwrap();
        assert_eq!(rows[0].get("unique"), Some(&json!(["1", "2"])));
    }

    #[test]
    fn test_unsupported_stage_is_execution_error() {
        let err = run(sample(), &stages(json!([{"$lookup": {}}]))).unwrap_err();
        assert!(matches!(err, AssistantError::QueryExecution(msg) if msg.contains("unsupported stage")));
    }
}
