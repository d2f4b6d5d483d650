//! Query verification before execution
//!
//! Rules-based, deterministic. Every `QueryRequest` passes through the
//! engine before it reaches the store; blocking failures come back to
//! the reasoning step as a recoverable execution error.

use crate::error::AssistantError;
use crate::models::QueryRequest;
use crate::schema::{FIELD_TOTAL_PRICE, TEXT_DATE_FIELDS};
use crate::store::Document;
use crate::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Trait for verification rules
pub trait VerificationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn severity(&self) -> Severity;

    fn verify(&self, request: &QueryRequest) -> VerificationCheckResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Logged, query still runs
    Warning,
    /// Query is rejected
    Blocking,
}

pub struct VerificationCheckResult {
    pub passed: bool,
    pub details: String,
}

impl VerificationCheckResult {
    fn pass() -> Self {
        Self {
            passed: true,
            details: String::new(),
        }
    }

    fn fail(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleCheck {
    pub rule_name: String,
    pub passed: bool,
    pub severity: Severity,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub verified: bool,
    pub checks: Vec<RuleCheck>,
    /// Blocking failures only
    pub issues: Vec<String>,
}

pub struct VerificationEngine {
    rules: Vec<Box<dyn VerificationRule>>,
}

impl VerificationEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Engine carrying the rules every generated query must satisfy.
    pub fn with_default_rules() -> Self {
        let mut engine = Self::new();
        engine.add_rule(Box::new(StageShapeRule));
        engine.add_rule(Box::new(PositivePriceFilterRule));
        engine.add_rule(Box::new(DateConversionRule));
        engine.add_rule(Box::new(UnboundedLookupRule));
        engine
    }

    pub fn add_rule(&mut self, rule: Box<dyn VerificationRule>) {
        self.rules.push(rule);
    }

    pub fn verify(&self, request: &QueryRequest) -> VerificationReport {
        let mut checks = Vec::with_capacity(self.rules.len());
        let mut issues = Vec::new();

        for rule in &self.rules {
            let result = rule.verify(request);
            let severity = rule.severity();

            if !result.passed {
                match severity {
                    Severity::Blocking => {
                        issues.push(format!("{}: {}", rule.name(), result.details))
                    }
                    Severity::Warning => {
                        warn!(rule = rule.name(), details = %result.details, "Query warning")
                    }
                }
            }

            checks.push(RuleCheck {
                rule_name: rule.name().to_string(),
                passed: result.passed,
                severity,
                details: result.details,
            });
        }

        let verified = issues.is_empty();
        debug!(
            rule_count = self.rules.len(),
            mode = %request.mode(),
            verified,
            "Query verification completed"
        );

        VerificationReport {
            verified,
            checks,
            issues,
        }
    }

    /// Reject the request when any blocking rule fails.
    pub fn enforce(&self, request: &QueryRequest) -> Result<()> {
        let report = self.verify(request);
        if report.verified {
            Ok(())
        } else {
            Err(AssistantError::QueryExecution(format!(
                "query rejected: {}",
                report.issues.join("; ")
            )))
        }
    }
}

impl Default for VerificationEngine {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

//
// ================= Helpers =================
//

fn stages(request: &QueryRequest) -> &[Document] {
    match request {
        QueryRequest::Pipeline { stages } => stages,
        QueryRequest::Lookup { .. } => &[],
    }
}

fn stage_body<'a>(stage: &'a Document, name: &str) -> Option<&'a Document> {
    stage.get(name).and_then(Value::as_object)
}

/// Whether an expression mentions `field_ref` (e.g. `"$Total Price"`) anywhere.
fn references(expr: &Value, field_ref: &str) -> bool {
    match expr {
        Value::String(s) => s == field_ref,
        Value::Array(items) => items.iter().any(|item| references(item, field_ref)),
        Value::Object(map) => map.values().any(|v| references(v, field_ref)),
        _ => false,
    }
}

fn is_number_type(spec: &Value) -> bool {
    match spec {
        Value::String(alias) => matches!(alias.as_str(), "number" | "double"),
        Value::Number(code) => code.as_i64() == Some(1),
        _ => false,
    }
}

fn is_positive_bound(op: &str, bound: &Value) -> bool {
    match (op, bound.as_f64()) {
        ("$gt", Some(b)) => b >= 0.0,
        ("$gte", Some(b)) => b > 0.0,
        _ => false,
    }
}

/// `{"Total Price": {"$gt": 0, "$type": "number"}}`, possibly inside `$and`.
fn filter_requires_positive_price(filter: &Document) -> bool {
    if let Some(Value::Object(cond)) = filter.get(FIELD_TOTAL_PRICE) {
        let positive = cond.iter().any(|(op, bound)| is_positive_bound(op, bound));
        let numeric = cond.get("$type").map(is_number_type).unwrap_or(false);
        if positive && numeric {
            return true;
        }
    }
    match filter.get("$and") {
        Some(Value::Array(clauses)) => clauses
            .iter()
            .filter_map(Value::as_object)
            .any(filter_requires_positive_price),
        _ => false,
    }
}

//
// ================= Rules =================
//

/// Rule: each stage has exactly one `$`-prefixed key
pub struct StageShapeRule;

impl VerificationRule for StageShapeRule {
    fn name(&self) -> &'static str {
        "stage_shape"
    }

    fn severity(&self) -> Severity {
        Severity::Blocking
    }

    fn verify(&self, request: &QueryRequest) -> VerificationCheckResult {
        for (i, stage) in stages(request).iter().enumerate() {
            let keys: Vec<&String> = stage.keys().collect();
            if keys.len() != 1 || !keys[0].starts_with('$') {
                return VerificationCheckResult::fail(format!(
                    "stage {} must have exactly one operator key such as \"$match\", found {:?}",
                    i, keys
                ));
            }
        }
        VerificationCheckResult::pass()
    }
}

/// Rule: price sums and averages only see present, numeric, positive prices
pub struct PositivePriceFilterRule;

impl VerificationRule for PositivePriceFilterRule {
    fn name(&self) -> &'static str {
        "positive_price_filter"
    }

    fn severity(&self) -> Severity {
        Severity::Blocking
    }

    fn verify(&self, request: &QueryRequest) -> VerificationCheckResult {
        let price_ref = format!("${}", FIELD_TOTAL_PRICE);
        let stages = stages(request);
        // Field references that carry the price, including aliases made by
        // earlier stages.
        let mut price_refs: Vec<String> = vec![
            price_ref.clone(),
            format!("$$ROOT.{}", FIELD_TOTAL_PRICE),
            format!("$$CURRENT.{}", FIELD_TOTAL_PRICE),
        ];
        let mentions_price =
            |expr: &Value, refs: &[String]| refs.iter().any(|r| references(expr, r));

        for (i, stage) in stages.iter().enumerate() {
            if let Some(fields) = stage_body(stage, "$addFields")
                .or_else(|| stage_body(stage, "$set"))
                .or_else(|| stage_body(stage, "$project"))
            {
                let aliases: Vec<String> = fields
                    .iter()
                    .filter(|&(_, expr)| mentions_price(expr, &price_refs[..]))
                    .map(|(name, _)| format!("${}", name))
                    .collect();
                price_refs.extend(aliases);
                continue;
            }

            let Some(group) = stage_body(stage, "$group") else {
                continue;
            };
            let price_outputs: Vec<(&String, bool)> = group
                .iter()
                .filter(|(name, _)| name.as_str() != "_id")
                .filter_map(|(name, acc)| Some((name, acc.as_object()?)))
                .filter(|(_, acc)| acc.values().any(|arg| mentions_price(arg, &price_refs[..])))
                .map(|(name, acc)| {
                    let sums = acc.keys().any(|op| matches!(op.as_str(), "$sum" | "$avg"));
                    (name, sums)
                })
                .collect();
            let aggregates_price = price_outputs.iter().any(|(_, sums)| *sums);
            price_refs.extend(price_outputs.iter().map(|(name, _)| format!("${}", name)));
            if !aggregates_price {
                continue;
            }

            let guarded = stages[..i]
                .iter()
                .filter_map(|s| stage_body(s, "$match"))
                .any(filter_requires_positive_price);
            if !guarded {
                return VerificationCheckResult::fail(format!(
                    "stage {} aggregates \"{}\" without a preceding {{\"$match\": {{\"{}\": {{\"$gt\": 0, \"$type\": \"number\"}}}}}}",
                    i, price_ref, FIELD_TOTAL_PRICE
                ));
            }
        }
        VerificationCheckResult::pass()
    }
}

const DATE_PART_OPERATORS: &[&str] = &[
    "$year",
    "$month",
    "$dayOfMonth",
    "$dayOfWeek",
    "$dayOfYear",
    "$hour",
    "$dateToString",
];

/// Rule: date operators never see the raw ISO text fields
pub struct DateConversionRule;

impl DateConversionRule {
    fn raw_date_argument(arg: &Value) -> Option<&'static str> {
        let target = match arg {
            Value::Object(spec) => spec.get("date")?,
            Value::Array(items) if items.len() == 1 => &items[0],
            other => other,
        };
        let Value::String(s) = target else {
            return None;
        };
        let field = s.strip_prefix('$')?;
        TEXT_DATE_FIELDS.iter().copied().find(|f| *f == field)
    }

    fn find_violation(expr: &Value) -> Option<(String, &'static str)> {
        match expr {
            Value::Array(items) => items.iter().find_map(Self::find_violation),
            Value::Object(map) => {
                for (key, arg) in map {
                    if DATE_PART_OPERATORS.contains(&key.as_str()) {
                        if let Some(field) = Self::raw_date_argument(arg) {
                            return Some((key.clone(), field));
                        }
                    }
                    if let Some(found) = Self::find_violation(arg) {
                        return Some(found);
                    }
                }
                None
            }
            _ => None,
        }
    }
}

impl VerificationRule for DateConversionRule {
    fn name(&self) -> &'static str {
        "date_conversion"
    }

    fn severity(&self) -> Severity {
        Severity::Blocking
    }

    fn verify(&self, request: &QueryRequest) -> VerificationCheckResult {
        let violation = match request {
            QueryRequest::Pipeline { stages } => stages.iter().find_map(|stage| {
                stage.values().find_map(Self::find_violation)
            }),
            QueryRequest::Lookup { filter, .. } => {
                filter.values().find_map(Self::find_violation)
            }
        };
        match violation {
            Some((op, field)) => VerificationCheckResult::fail(format!(
                "{} applied to \"{}\", which is stored as text; convert it first with {{\"$dateFromString\": {{\"dateString\": \"${}\"}}}}",
                op, field, field
            )),
            None => VerificationCheckResult::pass(),
        }
    }
}

/// Rule: a lookup without any filter returns arbitrary records
pub struct UnboundedLookupRule;

impl VerificationRule for UnboundedLookupRule {
    fn name(&self) -> &'static str {
        "unbounded_lookup"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn verify(&self, request: &QueryRequest) -> VerificationCheckResult {
        match request {
            QueryRequest::Lookup { filter, .. } if filter.is_empty() => {
                VerificationCheckResult::fail("lookup has an empty filter")
            }
            _ => VerificationCheckResult::pass(),
        }
    }
}
