//! Schema descriptor for the purchase-order collection
//!
//! Immutable after construction and shared read-only (`Arc`) by the
//! executor, tools and reasoners. Carries the field table, the hard
//! rules every generated query must honour, and the fiscal quarter map.

use crate::store::{value, DocumentStore};
use crate::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Write;

pub const FIELD_CREATION_DATE: &str = "Creation Date";
pub const FIELD_PURCHASE_DATE: &str = "Purchase Date";
pub const FIELD_FISCAL_YEAR: &str = "Fiscal Year";
pub const FIELD_DEPARTMENT: &str = "Department Name";
pub const FIELD_SUPPLIER: &str = "Supplier Name";
pub const FIELD_ITEM_NAME: &str = "Item Name";
pub const FIELD_QUANTITY: &str = "Quantity";
pub const FIELD_TOTAL_PRICE: &str = "Total Price";
pub const FIELD_ACQUISITION_TYPE: &str = "Acquisition Type";
pub const FIELD_ACQUISITION_METHOD: &str = "Acquisition Method";

/// Fields stored as ISO-8601 text that need conversion before date math.
pub const TEXT_DATE_FIELDS: &[&str] = &[FIELD_CREATION_DATE, FIELD_PURCHASE_DATE];

pub const FISCAL_YEARS: &[&str] = &["2012-2013", "2013-2014", "2014-2015"];

/// Categorical fields whose distinct values are worth listing.
pub const CATEGORICAL_FIELDS: &[&str] = &[
    FIELD_FISCAL_YEAR,
    FIELD_ACQUISITION_TYPE,
    FIELD_ACQUISITION_METHOD,
    "CalCard",
    FIELD_DEPARTMENT,
];

const MAX_DISTINCT_VALUES: usize = 50;

/// California fiscal quarters keyed by calendar month.
pub const QUARTER_TABLE: &[(&str, [u32; 3])] = &[
    ("Q1", [7, 8, 9]),
    ("Q2", [10, 11, 12]),
    ("Q3", [1, 2, 3]),
    ("Q4", [4, 5, 6]),
];

pub const UNKNOWN_QUARTER: &str = "Unknown";

pub fn fiscal_quarter(month: i64) -> &'static str {
    QUARTER_TABLE
        .iter()
        .find(|(_, months)| months.iter().any(|m| i64::from(*m) == month))
        .map(|(quarter, _)| *quarter)
        .unwrap_or(UNKNOWN_QUARTER)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// ISO-8601 text
    TextDate,
    Text,
    Number,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub meaning: &'static str,
    /// Known value domain, when small and fixed
    pub domain: &'static [&'static str],
}

const fn field(name: &'static str, kind: FieldKind, meaning: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        meaning,
        domain: &[],
    }
}

const fn enumerated(
    name: &'static str,
    meaning: &'static str,
    domain: &'static [&'static str],
) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::Text,
        meaning,
        domain,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaDescriptor {
    pub version: u32,
    pub collection: String,
    pub fields: Vec<FieldSpec>,
    pub hard_rules: Vec<&'static str>,
}

impl SchemaDescriptor {
    pub fn purchase_orders(collection: impl Into<String>) -> Self {
        use FieldKind::*;
        let fields = vec![
            field(FIELD_CREATION_DATE, TextDate, "System date when the order was created"),
            field(FIELD_PURCHASE_DATE, TextDate, "Purchase date entered by the user"),
            enumerated(FIELD_FISCAL_YEAR, "Fiscal year, July 1 to June 30", FISCAL_YEARS),
            field("LPA Number", Text, "Contract number; present means contract spend"),
            field("Purchase Order Number", Text, "PO number"),
            field("Requisition Number", Text, "Requisition number"),
            enumerated(
                FIELD_ACQUISITION_TYPE,
                "Type of acquisition",
                &["IT Goods", "IT Services", "Non-IT Goods", "Non-IT Services"],
            ),
            field("Sub-Acquisition Type", Text, "Sub-category of acquisition"),
            field(
                FIELD_ACQUISITION_METHOD,
                Text,
                "Purchasing method (Statewide Contract, Informal Competitive, ...)",
            ),
            field("Sub-Acquisition Method", Text, "Sub-method of acquisition"),
            field(FIELD_DEPARTMENT, Text, "Purchasing department"),
            field("Supplier Code", Text, "Supplier identifier"),
            field(FIELD_SUPPLIER, Text, "Supplier name"),
            field(
                "Supplier Qualifications",
                Text,
                "Certifications (CA-MB, CA-SB, CA-DVBE, ...)",
            ),
            field("Supplier Zip Code", Text, "Supplier zip code"),
            enumerated("CalCard", "Whether the state credit card was used", &["YES", "NO"]),
            field(FIELD_ITEM_NAME, Text, "Name of the items purchased"),
            field("Item Description", Text, "Description of the items"),
            field(FIELD_QUANTITY, Number, "Quantity of items"),
            field("Unit Price", Number, "Price per unit"),
            field(
                FIELD_TOTAL_PRICE,
                Number,
                "Total price excluding tax and shipping; may be missing, text, zero or negative",
            ),
            field("Classification Codes", Text, "UNSPSC codes"),
            field("Normalized UNSPSC", Text, "First 8 digits of the UNSPSC code"),
            field("Commodity Title", Text, "Commodity name"),
            field("Class", Text, "UNSPSC class number"),
            field("Class Title", Text, "UNSPSC class title"),
            field("Family", Text, "UNSPSC family number"),
            field("Family Title", Text, "UNSPSC family title"),
            field("Segment", Text, "UNSPSC segment number"),
            field("Segment Title", Text, "UNSPSC segment title"),
            field("Location", Text, "Geographic location"),
        ];

        let hard_rules = vec![
            "Creation Date and Purchase Date are ISO text (e.g. \"2013-08-27T00:00:00\"). Convert with {\"$dateFromString\": {\"dateString\": \"$Creation Date\"}} before $month, $year or any other date operator.",
            "Before any $group that sums or averages \"$Total Price\", add {\"$match\": {\"Total Price\": {\"$gt\": 0, \"$type\": \"number\"}}}.",
            "Quarters follow the California fiscal year: Q1=Jul-Sep, Q2=Oct-Dec, Q3=Jan-Mar, Q4=Apr-Jun; any other month is \"Unknown\".",
            "Use \"Creation Date\" for time-based questions.",
            "String fields match exactly as stored (case-sensitive, including spaces).",
        ];

        Self {
            version: 1,
            collection: collection.into(),
            fields,
            hard_rules,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// `$switch` that maps a month expression onto the fiscal quarter.
    pub fn quarter_switch(month_expr: &str) -> Value {
        let branches: Vec<Value> = QUARTER_TABLE
            .iter()
            .map(|(quarter, months)| {
                json!({"case": {"$in": [month_expr, months.to_vec()]}, "then": quarter})
            })
            .collect();
        json!({"$switch": {"branches": branches, "default": UNKNOWN_QUARTER}})
    }

    /// Text handed to the reasoning step.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "DATABASE SCHEMA (v{})", self.version);
        let _ = writeln!(out, "Collection: {}\n", self.collection);
        let _ = writeln!(out, "Fields:");
        for field in &self.fields {
            let kind = match field.kind {
                FieldKind::TextDate => "ISO date text",
                FieldKind::Text => "string",
                FieldKind::Number => "number",
            };
            let _ = write!(out, "- {} ({}): {}", field.name, kind, field.meaning);
            if !field.domain.is_empty() {
                let _ = write!(out, " [values: {}]", field.domain.join(", "));
            }
            out.push('\n');
        }
        let _ = writeln!(out, "\nHARD RULES:");
        for (i, rule) in self.hard_rules.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, rule);
        }
        let _ = writeln!(out, "\nQuarterly analysis example:");
        let example = json!([
            {"$match": {"Total Price": {"$gt": 0, "$type": "number"}}},
            {"$addFields": {"date_obj": {"$dateFromString": {"dateString": "$Creation Date"}}}},
            {"$addFields": {"month": {"$month": "$date_obj"}}},
            {"$addFields": {"quarter": Self::quarter_switch("$month")}},
            {"$group": {"_id": "$quarter", "total_spending": {"$sum": "$Total Price"}}},
            {"$sort": {"total_spending": -1}}
        ]);
        out.push_str(&example.to_string());
        out
    }
}

/// Observed field types plus the distinct values of categorical fields.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaInfo {
    pub fields: BTreeMap<String, String>,
    pub categorical: BTreeMap<String, Vec<Value>>,
}

/// Inspect one sample document and the categorical domains of the store.
pub async fn inspect(store: &dyn DocumentStore) -> Result<SchemaInfo> {
    let sample = store.find(&Default::default(), Some(1)).await?;
    let fields = sample
        .first()
        .map(|doc| {
            doc.iter()
                .filter(|(name, _)| name.as_str() != "_id")
                .map(|(name, v)| (name.clone(), value::type_name(v).to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut categorical = BTreeMap::new();
    for field in CATEGORICAL_FIELDS {
        let mut values = store.distinct(field).await?;
        values.retain(|v| !v.is_null());
        if values.len() <= MAX_DISTINCT_VALUES {
            categorical.insert((*field).to_string(), values);
        }
    }

    Ok(SchemaInfo {
        fields,
        categorical,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_quarter_mapping() {
        for m in [7, 8, 9] {
            assert_eq!(fiscal_quarter(m), "Q1");
        }
        for m in [10, 11, 12] {
            assert_eq!(fiscal_quarter(m), "Q2");
        }
        for m in [1, 2, 3] {
            assert_eq!(fiscal_quarter(m), "Q3");
        }
        for m in [4, 5, 6] {
            assert_eq!(fiscal_quarter(m), "Q4");
        }
        for m in [0, 13, -1, 99] {
            assert_eq!(fiscal_quarter(m), "Unknown");
        }
    }

    #[test]
    fn test_quarter_switch_agrees_with_table() {
        let switch = SchemaDescriptor::quarter_switch("$m");
        for month in 0..=13 {
            let mut doc = crate::store::Document::new();
            doc.insert("m".to_string(), json!(month));
            let q = crate::store::expr::evaluate(&switch, &doc).unwrap();
            assert_eq!(q, json!(fiscal_quarter(month)));
        }
    }

    #[test]
    fn test_describe_mentions_rules_and_fields() {
        let schema = SchemaDescriptor::purchase_orders("purchase_orders");
        let text = schema.describe();
        assert!(text.contains("Total Price"));
        assert!(text.contains("$dateFromString"));
        assert!(text.contains("2013-2014"));
        assert_eq!(schema.field("Quantity").map(|f| f.kind), Some(FieldKind::Number));
    }

    #[tokio::test]
    async fn test_inspect_sample_and_domains() {
        let mut docs: Vec<crate::store::Document> = vec![
            serde_json::from_value(json!({"Fiscal Year": "2013-2014", "Total Price": 1.5, "CalCard": "NO", "Department Name": "Parks"}))
                .unwrap(),
            serde_json::from_value(json!({"Fiscal Year": "2014-2015", "Total Price": 2, "CalCard": "YES", "Department Name": "Transportation"}))
                .unwrap(),
        ];
        for i in 0..=MAX_DISTINCT_VALUES {
            docs.push(
                serde_json::from_value(json!({"Fiscal Year": "2013-2014", "Acquisition Method": format!("Method {}", i)}))
                    .unwrap(),
            );
        }
        let store = InMemoryStore::from_documents("purchase_orders", docs);
        let info = inspect(&store).await.unwrap();
        assert_eq!(info.fields.get("Total Price").map(String::as_str), Some("double"));
        assert_eq!(info.categorical["CalCard"], vec![json!("NO"), json!("YES")]);
        assert_eq!(
            info.categorical[FIELD_DEPARTMENT],
            vec![json!("Parks"), json!("Transportation")]
        );
        assert!(!info.categorical.contains_key(FIELD_ACQUISITION_METHOD));
    }
}
