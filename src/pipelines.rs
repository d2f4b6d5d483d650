//! Canned aggregation pipelines
//!
//! Shared by the dataset explorer and deterministic intent routing. Every
//! pipeline that sums or averages price carries the positivity match.

use crate::schema::{
    SchemaDescriptor, FIELD_ACQUISITION_METHOD, FIELD_CREATION_DATE, FIELD_DEPARTMENT,
    FIELD_FISCAL_YEAR, FIELD_ITEM_NAME, FIELD_QUANTITY, FIELD_SUPPLIER, FIELD_TOTAL_PRICE,
};
use crate::store::Document;
use serde_json::{json, Map, Value};

/// `{"$gt": 0, "$type": "number"}`, the only valid price for spend math.
pub fn positive_price_condition() -> Value {
    json!({"$gt": 0, "$type": "number"})
}

/// `$match` body with the price guard plus any extra equality filters.
pub fn positive_price_match(extra: &[(&str, Value)]) -> Value {
    let mut filter = Map::new();
    for (field, value) in extra {
        filter.insert((*field).to_string(), value.clone());
    }
    filter.insert(FIELD_TOTAL_PRICE.to_string(), positive_price_condition());
    Value::Object(filter)
}

fn price_ref() -> String {
    format!("${}", FIELD_TOTAL_PRICE)
}

fn year_filter(fiscal_year: Option<&str>) -> Vec<(&'static str, Value)> {
    fiscal_year
        .map(|fy| vec![(FIELD_FISCAL_YEAR, Value::String(fy.to_string()))])
        .unwrap_or_default()
}

/// Stage list from a JSON array literal.
pub fn stages(value: Value) -> Vec<Document> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(stage) => Some(stage),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Serialize stages as a tool payload.
pub fn to_payload(stages: &[Document]) -> String {
    Value::Array(stages.iter().cloned().map(Value::Object).collect()).to_string()
}

pub fn total_spending(fiscal_year: Option<&str>) -> Vec<Document> {
    stages(json!([
        {"$match": positive_price_match(&year_filter(fiscal_year))},
        {"$group": {
            "_id": null,
            "total_spending": {"$sum": price_ref()},
            "order_count": {"$sum": 1}
        }}
    ]))
}

pub fn spending_by_fiscal_year() -> Vec<Document> {
    stages(json!([
        {"$match": positive_price_match(&[])},
        {"$group": {
            "_id": format!("${}", FIELD_FISCAL_YEAR),
            "total_spending": {"$sum": price_ref()},
            "order_count": {"$sum": 1},
            "avg_order_value": {"$avg": price_ref()}
        }},
        {"$sort": {"_id": 1}}
    ]))
}

fn top_by_spending(field: &str, top_n: usize) -> Vec<Document> {
    stages(json!([
        {"$match": positive_price_match(&[])},
        {"$group": {
            "_id": format!("${}", field),
            "total_spending": {"$sum": price_ref()},
            "order_count": {"$sum": 1}
        }},
        {"$sort": {"total_spending": -1}},
        {"$limit": top_n}
    ]))
}

pub fn top_departments(top_n: usize) -> Vec<Document> {
    top_by_spending(FIELD_DEPARTMENT, top_n)
}

pub fn top_suppliers(top_n: usize) -> Vec<Document> {
    top_by_spending(FIELD_SUPPLIER, top_n)
}

pub fn acquisition_methods() -> Vec<Document> {
    stages(json!([
        {"$match": positive_price_match(&[])},
        {"$group": {
            "_id": format!("${}", FIELD_ACQUISITION_METHOD),
            "count": {"$sum": 1},
            "total_spending": {"$sum": price_ref()},
            "avg_order_value": {"$avg": price_ref()}
        }},
        {"$sort": {"total_spending": -1}}
    ]))
}

/// Most frequently ordered items with a non-empty name.
pub fn top_items(top_n: usize) -> Vec<Document> {
    stages(json!([
        {"$match": positive_price_match(&[(FIELD_ITEM_NAME, json!({"$ne": ""}))])},
        {"$group": {
            "_id": format!("${}", FIELD_ITEM_NAME),
            "order_count": {"$sum": 1},
            "total_quantity": {"$sum": format!("${}", FIELD_QUANTITY)},
            "total_spending": {"$sum": price_ref()}
        }},
        {"$sort": {"order_count": -1}},
        {"$limit": top_n}
    ]))
}

/// Date conversion and fiscal quarter derivation from the creation date.
fn quarter_stages() -> Vec<Value> {
    vec![
        json!({"$addFields": {
            "date_obj": {"$dateFromString": {
                "dateString": format!("${}", FIELD_CREATION_DATE),
                "onError": null
            }}
        }}),
        json!({"$addFields": {
            "creation_month": {"$month": "$date_obj"},
            "creation_year": {"$year": "$date_obj"}
        }}),
        json!({"$addFields": {
            "quarter": SchemaDescriptor::quarter_switch("$creation_month")
        }}),
    ]
}

pub fn quarterly_spending(fiscal_year: Option<&str>) -> Vec<Document> {
    let mut pipeline = vec![json!({"$match": positive_price_match(&year_filter(fiscal_year))})];
    pipeline.extend(quarter_stages());
    pipeline.push(json!({"$group": {
        "_id": {"fiscal_year": format!("${}", FIELD_FISCAL_YEAR), "quarter": "$quarter"},
        "total_spending": {"$sum": price_ref()},
        "order_count": {"$sum": 1}
    }}));
    pipeline.push(json!({"$sort": {"_id.fiscal_year": 1, "_id.quarter": 1}}));
    stages(Value::Array(pipeline))
}

/// Single calendar-year quarter with the highest spend.
pub fn highest_quarter() -> Vec<Document> {
    let mut pipeline = vec![json!({"$match": positive_price_match(&[])})];
    pipeline.extend(quarter_stages());
    pipeline.push(json!({"$group": {
        "_id": {"year": "$creation_year", "quarter": "$quarter"},
        "total_spending": {"$sum": price_ref()}
    }}));
    pipeline.push(json!({"$sort": {"total_spending": -1}}));
    pipeline.push(json!({"$limit": 1}));
    stages(Value::Array(pipeline))
}

pub fn record_count(fiscal_year: Option<&str>) -> Vec<Document> {
    let mut filter = Map::new();
    for (field, value) in year_filter(fiscal_year) {
        filter.insert(field.to_string(), value);
    }
    stages(json!([
        {"$match": filter},
        {"$count": "record_count"}
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryRequest;
    use crate::store::pipeline::run;
    use crate::verification::VerificationEngine;

    fn docs() -> Vec<Document> {
        stages(json!([
            {"Fiscal Year": "2013-2014", "Creation Date": "2013-08-27T00:00:00", "Total Price": 1000.0,
             "Department Name": "A", "Item Name": "Paper", "Quantity": 10},
            {"Fiscal Year": "2013-2014", "Creation Date": "2013-11-02T00:00:00", "Total Price": 4000.0,
             "Department Name": "B", "Item Name": "Paper", "Quantity": 5},
            {"Fiscal Year": "2013-2014", "Creation Date": "2014-02-10T00:00:00", "Total Price": "n/a",
             "Department Name": "B", "Item Name": "", "Quantity": 1},
            {"Fiscal Year": "2014-2015", "Creation Date": "2014-08-01T00:00:00", "Total Price": 250.0,
             "Department Name": "A", "Item Name": "Toner", "Quantity": 2}
        ]))
    }

    #[test]
    fn test_every_canned_pipeline_passes_verification() {
        let engine = VerificationEngine::with_default_rules();
        let all = vec![
            total_spending(Some("2013-2014")),
            spending_by_fiscal_year(),
            top_departments(10),
            top_suppliers(10),
            acquisition_methods(),
            top_items(5),
            quarterly_spending(None),
            highest_quarter(),
            record_count(None),
        ];
        for stages in all {
            let request = QueryRequest::Pipeline { stages };
            assert!(engine.verify(&request).verified, "{}", to_payload(match &request {
                QueryRequest::Pipeline { stages } => stages,
                _ => unreachable!(),
            }));
        }
    }

    #[test]
    fn test_total_spending_for_year() {
        let rows = run(docs(), &total_spending(Some("2013-2014"))).unwrap();
        assert_eq!(rows[0].get("total_spending"), Some(&json!(5000.0)));
        assert_eq!(rows[0].get("order_count"), Some(&json!(2)));
    }

    #[test]
    fn test_quarters_follow_fiscal_calendar() {
        let rows = run(docs(), &quarterly_spending(Some("2013-2014"))).unwrap();
        let quarters: Vec<Value> = rows
            .iter()
            .filter_map(|r| r.get("_id").and_then(|id| id.get("quarter")).cloned())
            .collect();
        assert_eq!(quarters, vec![json!("Q1"), json!("Q2")]);

        let best = run(docs(), &highest_quarter()).unwrap();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].get("_id"), Some(&json!({"year": 2013, "quarter": "Q2"})));
    }

    #[test]
    fn test_top_items_skip_blank_names() {
        let rows = run(docs(), &top_items(5)).unwrap();
        assert_eq!(rows[0].get("_id"), Some(&json!("Paper")));
        assert_eq!(rows[0].get("total_quantity"), Some(&json!(15)));
        assert!(rows.iter().all(|r| r.get("_id") != Some(&json!(""))));
    }

    #[test]
    fn test_record_count() {
        let rows = run(docs(), &record_count(Some("2014-2015"))).unwrap();
        assert_eq!(rows[0].get("record_count"), Some(&json!(1)));
    }
}
