//! Deterministic intent routing
//!
//! High-confidence questions (the quick questions and close variants) map
//! straight onto a canned pipeline and a fixed answer template, with no LLM
//! round trip.

use super::{Decision, Reasoner, ReasoningContext};
use crate::format::{format_count, format_currency};
use crate::memory::Turn;
use crate::models::Observation;
use crate::pipelines;
use crate::store::Document;
use crate::tools::AGGREGATE_TOOL;
use crate::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::fmt::Write;
use std::sync::LazyLock;

const DEFAULT_TOP_DEPARTMENTS: usize = 10;
const DEFAULT_TOP_SUPPLIERS: usize = 10;
const DEFAULT_TOP_ITEMS: usize = 5;
const MAX_TOP_N: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    FiscalYearTotal(String),
    SpendingByFiscalYear,
    HighestQuarter,
    QuarterlySpending(Option<String>),
    TopDepartments(usize),
    TopSuppliers(usize),
    TopItems(usize),
    AcquisitionMethods,
    RecordCount(Option<String>),
}

static RE_FISCAL_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(20\d{2})\s*(?:-|/|to)\s*(20\d{2}|\d{2})\b").unwrap());

static RE_TOP_N: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:top|first)\s+(\d{1,3})\b").unwrap());

/// `"2013-2014"`, `"2013/14"` and `"2013 to 2014"` all give `"2013-2014"`.
pub fn extract_fiscal_year(question: &str) -> Option<String> {
    let caps = RE_FISCAL_YEAR.captures(question)?;
    let start: u32 = caps.get(1)?.as_str().parse().ok()?;
    let end_raw = caps.get(2)?.as_str();
    let end: u32 = match end_raw.len() {
        2 => (start / 100) * 100 + end_raw.parse::<u32>().ok()?,
        _ => end_raw.parse().ok()?,
    };
    (end == start + 1).then(|| format!("{}-{}", start, end))
}

fn extract_top_n(question: &str) -> Option<usize> {
    let caps = RE_TOP_N.captures(question)?;
    caps.get(1)?
        .as_str()
        .parse::<usize>()
        .ok()
        .filter(|n| (1..=MAX_TOP_N).contains(n))
}

/// Words any routed question may carry besides its shape vocabulary.
const FILLER_WORDS: &[&str] = &[
    "a", "across", "all", "are", "been", "by", "data", "dataset", "did", "do", "does", "during",
    "each", "every", "fiscal", "for", "fy", "give", "had", "has", "have", "how", "in", "is", "list",
    "me", "of", "over", "overall", "per", "please", "s", "show", "tell", "the", "there", "total",
    "was", "were", "what", "whats", "which", "year", "years",
];

const SPENDING_WORDS: &[&str] = &[
    "amount", "cost", "costs", "expenditure", "expenditures", "much", "spend", "spending", "spent",
];

const RANKING_WORDS: &[&str] = &[
    "biggest", "highest", "largest", "leading", "most", "ranked", "ranking", "top",
];

/// A follow-up leans on the previous turn for its subject or filters.
const FOLLOW_UP_WORDS: &[&str] = &[
    "again", "also", "instead", "it", "its", "previous", "same", "than", "that", "them", "then",
    "these", "they", "this", "those", "too",
];

const FOLLOW_UP_OPENERS: &[&str] = &["and ", "but ", "how about", "now ", "only ", "what about"];

fn words(lowered: &str) -> impl Iterator<Item = &str> {
    lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty())
}

/// Whether `question` reads as a continuation of the previous turn.
pub fn is_follow_up(question: &str) -> bool {
    let lowered = question.trim().to_lowercase();
    FOLLOW_UP_OPENERS.iter().any(|o| lowered.starts_with(o))
        || words(&lowered).any(|w| FOLLOW_UP_WORDS.contains(&w))
}

impl Intent {
    /// Route a question onto a canned intent, if one clearly applies.
    ///
    /// Every word of the question must belong to the matched shape; a
    /// department, supplier, category or any other unmodelled filter
    /// leaves the question to the LLM.
    pub fn route(question: &str) -> Option<Intent> {
        let lowered = question.to_lowercase();
        let intent = Self::match_shape(&lowered)?;
        intent.covers(&lowered).then_some(intent)
    }

    /// Like [`Intent::route`], but never for a follow-up to earlier turns.
    pub fn route_in_context(question: &str, history: &[Turn]) -> Option<Intent> {
        if !history.is_empty() && is_follow_up(question) {
            return None;
        }
        Self::route(question)
    }

    fn match_shape(lowered: &str) -> Option<Intent> {
        let has_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

        let fiscal_year = extract_fiscal_year(lowered);
        let ranking = has_any(&["top", "most", "highest", "largest", "biggest", "leading"]);
        let spending = has_any(&["spend", "spent", "spending", "total", "cost", "amount"]);

        if has_any(&["how many"]) && has_any(&["order", "record", "purchase", "entries"]) {
            return Some(Intent::RecordCount(fiscal_year));
        }

        if lowered.contains("quarter") {
            if ranking && fiscal_year.is_none() {
                return Some(Intent::HighestQuarter);
            }
            if spending {
                return Some(Intent::QuarterlySpending(fiscal_year));
            }
            return None;
        }

        // Canned rankings span all years.
        if ranking {
            if fiscal_year.is_some() {
                return None;
            }
            let top_n = extract_top_n(lowered);
            if has_any(&["department", "agency", "agencies"]) {
                return Some(Intent::TopDepartments(top_n.unwrap_or(DEFAULT_TOP_DEPARTMENTS)));
            }
            if has_any(&["supplier", "vendor"]) {
                return Some(Intent::TopSuppliers(top_n.unwrap_or(DEFAULT_TOP_SUPPLIERS)));
            }
            if has_any(&["item", "product"]) && has_any(&["order", "frequent", "purchased", "bought"]) {
                return Some(Intent::TopItems(top_n.unwrap_or(DEFAULT_TOP_ITEMS)));
            }
            return None;
        }

        if has_any(&["acquisition method"]) {
            return Some(Intent::AcquisitionMethods);
        }

        if spending {
            if let Some(fy) = fiscal_year {
                return Some(Intent::FiscalYearTotal(fy));
            }
            if has_any(&[
                "each fiscal year",
                "per fiscal year",
                "by fiscal year",
                "each year",
                "per year",
                "by year",
                "every year",
            ]) {
                return Some(Intent::SpendingByFiscalYear);
            }
        }

        None
    }

    fn vocabulary(&self) -> &'static [&'static str] {
        match self {
            Intent::FiscalYearTotal(_) | Intent::SpendingByFiscalYear => &[
                "amount", "cost", "costs", "expenditure", "expenditures", "much", "order", "orders",
                "purchase", "purchases", "purchasing", "spend", "spending", "spent", "state", "value",
            ],
            Intent::HighestQuarter => &["calendar", "quarter", "quarters", "single", "with"],
            Intent::QuarterlySpending(_) => &[
                "break", "breakdown", "down", "quarter", "quarterly", "quarters",
            ],
            Intent::TopDepartments(_) => &[
                "agencies", "agency", "department", "departments", "spenders", "who",
            ],
            Intent::TopSuppliers(_) => &[
                "paid", "received", "supplier", "suppliers", "vendor", "vendors", "who",
            ],
            Intent::TopItems(_) => &[
                "bought", "common", "commonly", "frequent", "frequently", "item", "items", "order",
                "ordered", "orders", "product", "products", "purchased",
            ],
            Intent::AcquisitionMethods => &[
                "acquisition", "breakdown", "compare", "method", "methods", "used",
            ],
            Intent::RecordCount(_) => &[
                "database", "entries", "made", "many", "order", "orders", "placed", "purchase",
                "record", "records",
            ],
        }
    }

    /// True when nothing in `lowered` falls outside this intent's shape.
    fn covers(&self, lowered: &str) -> bool {
        let without_year = RE_FISCAL_YEAR.replace_all(lowered, " ");
        let ranked = matches!(
            self,
            Intent::TopDepartments(_) | Intent::TopSuppliers(_) | Intent::TopItems(_)
        );
        let spends = !matches!(self, Intent::RecordCount(_));
        let vocabulary = self.vocabulary();

        let covered = words(&without_year).all(|w| {
            FILLER_WORDS.contains(&w)
                || vocabulary.contains(&w)
                || (spends && SPENDING_WORDS.contains(&w))
                || ((ranked || *self == Intent::HighestQuarter) && RANKING_WORDS.contains(&w))
                || (ranked && w.chars().all(|c| c.is_ascii_digit()))
        });
        covered
    }

    pub fn pipeline(&self) -> Vec<Document> {
        match self {
            Intent::FiscalYearTotal(fy) => pipelines::total_spending(Some(fy)),
            Intent::SpendingByFiscalYear => pipelines::spending_by_fiscal_year(),
            Intent::HighestQuarter => pipelines::highest_quarter(),
            Intent::QuarterlySpending(fy) => pipelines::quarterly_spending(fy.as_deref()),
            Intent::TopDepartments(n) => pipelines::top_departments(*n),
            Intent::TopSuppliers(n) => pipelines::top_suppliers(*n),
            Intent::TopItems(n) => pipelines::top_items(*n),
            Intent::AcquisitionMethods => pipelines::acquisition_methods(),
            Intent::RecordCount(fy) => pipelines::record_count(fy.as_deref()),
        }
    }

    pub fn payload(&self) -> String {
        pipelines::to_payload(&self.pipeline())
    }

    /// Tool call that answers this intent.
    pub fn decision(&self) -> Decision {
        Decision::invoke(AGGREGATE_TOOL, self.payload())
    }

    /// Render the tool summary as prose.
    pub fn answer(&self, output: &Value) -> String {
        let rows: &[Value] = output
            .get("results")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let Some(first) = rows.first() else {
            return match self {
                Intent::FiscalYearTotal(fy) => {
                    format!("No purchase orders with a valid price were found for fiscal year {}.", fy)
                }
                Intent::RecordCount(Some(fy)) => {
                    format!("There are no purchase orders in fiscal year {}.", fy)
                }
                _ => "No results found for that question.".to_string(),
            };
        };
        let mut out = String::new();
        match self {
            Intent::FiscalYearTotal(fy) => {
                let _ = write!(
                    out,
                    "Total spending in fiscal year {} was {} across {} orders.",
                    fy,
                    money(first, "total_spending"),
                    count(first, "order_count")
                );
            }
            Intent::SpendingByFiscalYear => {
                out.push_str("Total spending by fiscal year:\n");
                for row in rows {
                    let _ = writeln!(
                        out,
                        "- {}: {} ({} orders, average {})",
                        label(row.get("_id")),
                        money(row, "total_spending"),
                        count(row, "order_count"),
                        money(row, "avg_order_value")
                    );
                }
            }
            Intent::HighestQuarter => {
                let id = first.get("_id");
                let _ = write!(
                    out,
                    "The highest spending quarter was fiscal {} of calendar year {}, with {} in total spending.",
                    label(id.and_then(|v| v.get("quarter"))),
                    label(id.and_then(|v| v.get("year"))),
                    money(first, "total_spending")
                );
            }
            Intent::QuarterlySpending(fy) => {
                match fy {
                    Some(fy) => {
                        let _ = writeln!(out, "Quarterly spending in fiscal year {}:", fy);
                    }
                    None => out.push_str("Quarterly spending by fiscal year:\n"),
                }
                for row in rows {
                    let id = row.get("_id");
                    let _ = writeln!(
                        out,
                        "- {} {}: {} ({} orders)",
                        label(id.and_then(|v| v.get("fiscal_year"))),
                        label(id.and_then(|v| v.get("quarter"))),
                        money(row, "total_spending"),
                        count(row, "order_count")
                    );
                }
            }
            Intent::TopDepartments(n) | Intent::TopSuppliers(n) => {
                let noun = if matches!(self, Intent::TopDepartments(_)) {
                    "departments"
                } else {
                    "suppliers"
                };
                let _ = writeln!(out, "Top {} {} by total spending:", n, noun);
                for (i, row) in rows.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "{}. {}: {} ({} orders)",
                        i + 1,
                        label(row.get("_id")),
                        money(row, "total_spending"),
                        count(row, "order_count")
                    );
                }
            }
            Intent::TopItems(n) => {
                let _ = writeln!(out, "Top {} most frequently ordered items:", n);
                for (i, row) in rows.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "{}. {}: {} orders, {} units, {} total",
                        i + 1,
                        label(row.get("_id")),
                        count(row, "order_count"),
                        count(row, "total_quantity"),
                        money(row, "total_spending")
                    );
                }
            }
            Intent::AcquisitionMethods => {
                out.push_str("Spending by acquisition method:\n");
                for row in rows {
                    let _ = writeln!(
                        out,
                        "- {}: {} ({} orders, average {})",
                        label(row.get("_id")),
                        money(row, "total_spending"),
                        count(row, "count"),
                        money(row, "avg_order_value")
                    );
                }
            }
            Intent::RecordCount(fy) => {
                let _ = write!(out, "There are {} purchase orders", count(first, "record_count"));
                if let Some(fy) = fy {
                    let _ = write!(out, " in fiscal year {}", fy);
                }
                out.push('.');
            }
        }

        if let Some(note) = output.get("note").and_then(Value::as_str).filter(|n| !n.is_empty()) {
            let _ = write!(out, "\n({})", note);
        }
        out.trim_end().to_string()
    }
}

fn money(row: &Value, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_f64)
        .map(format_currency)
        .unwrap_or_else(|| "N/A".to_string())
}

fn count(row: &Value, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_f64)
        .map(|n| format_count(n.max(0.0).round() as u64))
        .unwrap_or_else(|| "N/A".to_string())
}

fn label(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Null) | None => "Unknown".to_string(),
        Some(Value::String(_)) => "(blank)".to_string(),
        Some(other) => other.to_string(),
    }
}

/// The routed intent whose call produced `observation`, if any.
pub fn routed(question: &str, history: &[Turn], observation: &Observation) -> Option<Intent> {
    Intent::route_in_context(question, history).filter(|intent| {
        observation.tool_name == AGGREGATE_TOOL && observation.payload == intent.payload()
    })
}

/// Answers routed questions only; everything else gets a pointer to the
/// question shapes it understands.
pub struct IntentReasoner;

pub const UNROUTED_ANSWER: &str = "I can answer questions about total spending by fiscal year, \
quarterly spending, top departments, suppliers and items, acquisition methods and order counts. \
Could you rephrase your question along those lines?";

#[async_trait]
impl Reasoner for IntentReasoner {
    async fn decide(&self, ctx: &ReasoningContext<'_>) -> Result<Decision> {
        let Some(intent) = Intent::route_in_context(ctx.question, ctx.history) else {
            return Ok(Decision::Answer(UNROUTED_ANSWER.to_string()));
        };

        match ctx.observations.last() {
            None if ctx.tools_allowed => Ok(intent.decision()),
            None => Ok(Decision::Answer(UNROUTED_ANSWER.to_string())),
            Some(obs) if obs.is_success() => Ok(Decision::Answer(intent.answer(&obs.output))),
            Some(obs) => {
                let reason = obs
                    .output
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                Ok(Decision::Answer(format!(
                    "I'm sorry, I couldn't compute that: {}",
                    reason
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MessageRole;
    use serde_json::json;

    #[test]
    fn test_routes_quick_questions() {
        assert_eq!(
            Intent::route("What was the total spending for each fiscal year?"),
            Some(Intent::SpendingByFiscalYear)
        );
        assert_eq!(
            Intent::route("Which quarter had the highest spending across all years?"),
            Some(Intent::HighestQuarter)
        );
        assert_eq!(
            Intent::route("What are the top 5 most frequently ordered items?"),
            Some(Intent::TopItems(5))
        );
        assert_eq!(
            Intent::route("Which are the top 10 departments by total spending?"),
            Some(Intent::TopDepartments(10))
        );
    }

    #[test]
    fn test_routes_fiscal_year_variants() {
        assert_eq!(
            Intent::route("What was the total spending in fiscal year 2013-2014?"),
            Some(Intent::FiscalYearTotal("2013-2014".to_string()))
        );
        assert_eq!(
            Intent::route("How much was spent in FY 2014/15?"),
            Some(Intent::FiscalYearTotal("2014-2015".to_string()))
        );
        assert_eq!(
            Intent::route("How many orders were placed in 2012-2013?"),
            Some(Intent::RecordCount(Some("2012-2013".to_string())))
        );
        assert_eq!(extract_fiscal_year("2013-2015"), None);
    }

    #[test]
    fn test_unrouted_questions() {
        assert_eq!(Intent::route("Show me orders from Staples"), None);
        assert_eq!(Intent::route("And what about the next one?"), None);
    }

    #[test]
    fn test_extra_filters_are_not_routed() {
        assert_eq!(
            Intent::route(
                "What was the total spending in fiscal year 2013-2014 by the Department of Transportation?"
            ),
            None
        );
        assert_eq!(
            Intent::route("How many purchase orders did the Department of Corrections place?"),
            None
        );
        assert_eq!(Intent::route("How many suppliers received purchase orders?"), None);
        assert_eq!(Intent::route("What was the total spending by year for IT Goods?"), None);
        assert_eq!(Intent::route("Top 5 suppliers for the Department of Water Resources"), None);
    }

    #[test]
    fn test_follow_ups_skip_routing_with_history() {
        let history = vec![
            Turn::new(MessageRole::User, "Show me orders from Staples"),
            Turn::new(MessageRole::Assistant, "Found 12 orders."),
        ];
        let question = "And what was the total spending in fiscal year 2013-2014?";

        assert!(is_follow_up(question));
        assert_eq!(Intent::route_in_context(question, &history), None);

        let fresh = "What was the total spending in fiscal year 2013-2014?";
        assert!(!is_follow_up(fresh));
        assert_eq!(
            Intent::route_in_context(fresh, &history),
            Some(Intent::FiscalYearTotal("2013-2014".to_string()))
        );
        assert_eq!(
            Intent::route_in_context("Total spending for that in fiscal year 2013-2014", &history),
            None
        );
    }

    #[test]
    fn test_fiscal_year_answer() {
        let intent = Intent::FiscalYearTotal("2013-2014".to_string());
        let output = json!({
            "count": 1,
            "results": [{"_id": null, "total_spending": 29_990_000_000.0, "order_count": 120_000}],
            "note": ""
        });
        let answer = intent.answer(&output);
        assert_eq!(
            answer,
            "Total spending in fiscal year 2013-2014 was $29.99B across 120,000 orders."
        );
    }

    #[test]
    fn test_ranked_answer_and_empty() {
        let intent = Intent::TopDepartments(2);
        let output = json!({
            "count": 2,
            "results": [
                {"_id": "Corrections and Rehabilitation", "total_spending": 5_200_000.0, "order_count": 40},
                {"_id": "Transportation", "total_spending": 9_500.0, "order_count": 3}
            ],
            "note": ""
        });
        let answer = intent.answer(&output);
        assert!(answer.contains("1. Corrections and Rehabilitation: $5.20M (40 orders)"));
        assert!(answer.contains("2. Transportation: $9,500.00 (3 orders)"));

        let empty = json!({"message": "No results found", "count": 0});
        assert_eq!(intent.answer(&empty), "No results found for that question.");
    }

    #[test]
    fn test_top_n_bounds() {
        assert_eq!(extract_top_n("top 3 suppliers"), Some(3));
        assert_eq!(extract_top_n("top 500 suppliers"), None);
        assert_eq!(
            Intent::route("top 500 suppliers by spending"),
            Some(Intent::TopSuppliers(DEFAULT_TOP_SUPPLIERS))
        );
    }
}
