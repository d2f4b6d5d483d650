//! Question classifier
//!
//! Guesses whether a question wants an aggregation (totals, rankings,
//! trends) or a record lookup. The guess is a prompt hint only; the
//! reasoner makes the final choice.

use crate::models::QueryMode;

/// Static keyword lists, zero allocation
const AGGREGATION_KEYWORDS: &[&str] = &[
    // Totals
    "total", "sum", "spending", "spent", "spend",
    // Statistics
    "average", "avg", "mean", "median", "how many", "count", "number of",
    // Rankings
    "top", "most", "highest", "lowest", "least", "largest", "biggest", "rank",
    // Grouping and time
    "per ", " by ", "each", "quarter", "trend", "over time", "breakdown", "distribution",
    "compare",
];

const LOOKUP_KEYWORDS: &[&str] = &[
    "find", "show me", "list", "display", "which orders", "orders from", "orders for",
    "purchase order", "specific", "details", "record", "lookup", "look up",
];

pub struct QueryClassifier;

impl QueryClassifier {
    pub fn classify(question: &str) -> QueryMode {
        let text = format!(" {} ", question.to_lowercase());

        let aggregation_score = AGGREGATION_KEYWORDS
            .iter()
            .filter(|kw| text.contains(**kw))
            .count();

        let lookup_score = LOOKUP_KEYWORDS
            .iter()
            .filter(|kw| text.contains(**kw))
            .count();

        // Ties go to aggregation: most questions here are analytical.
        if lookup_score > aggregation_score {
            QueryMode::Lookup
        } else {
            QueryMode::Pipeline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_questions() {
        let cases = [
            "What was the total spending for each fiscal year?",
            "Which quarter had the highest spending across all years?",
            "What are the top 5 most frequently ordered items?",
            "How many orders were placed in 2013-2014?",
        ];
        for c in cases {
            assert_eq!(QueryClassifier::classify(c), QueryMode::Pipeline, "{}", c);
        }
    }

    #[test]
    fn test_lookup_questions() {
        let cases = [
            "Find orders from the Department of Consumer Affairs",
            "Show me purchase order details for supplier Staples",
            "List records for IT Goods",
        ];
        for c in cases {
            assert_eq!(QueryClassifier::classify(c), QueryMode::Lookup, "{}", c);
        }
    }

    #[test]
    fn test_unclear_defaults_to_aggregation() {
        assert_eq!(QueryClassifier::classify("hi"), QueryMode::Pipeline);
    }
}
