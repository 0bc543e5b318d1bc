//! Parameter extractors
//!
//! Pure functions from a task description to a typed parameter map. The
//! extractor is selected by agent id; unknown agents fall back to the
//! generic extractor.

use regex::Regex;
use serde_json::{json, Map, Value};

/// Named extractor families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    /// SQL-style market data queries (templates, conditions, ordering)
    SqlMarket,
    /// Prediction-market free-text search (topic + limit + session)
    PredictionSearch,
    /// Pass-through: description as query, optional ISO date
    Generic,
}

impl ExtractorKind {
    /// Select an extractor from the agent id.
    pub fn for_agent(agent_id: &str) -> Self {
        let id = agent_id.to_lowercase();
        if id.contains("market_data") || id.contains("marketdata") {
            ExtractorKind::SqlMarket
        } else if id.contains("prediction") || id.contains("polymarket") {
            ExtractorKind::PredictionSearch
        } else {
            ExtractorKind::Generic
        }
    }

    /// Run the extractor over a task description.
    pub fn extract(&self, description: &str) -> Value {
        match self {
            ExtractorKind::SqlMarket => extract_market_query(description),
            ExtractorKind::PredictionSearch => extract_prediction_search(description),
            ExtractorKind::Generic => extract_generic(description),
        }
    }
}

const DEFAULT_QUERY_LIMIT: u64 = 1000;
const DEFAULT_SEARCH_LIMIT: u64 = 10;
const MAX_SEARCH_LIMIT: u64 = 50;

fn date_re() -> Regex {
    Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap()
}

/// Extract SQL query parameters: symbol pattern, date filters, numeric
/// ranges and comparisons, ordering cues, and limits.
///
/// Output shape:
/// `{template, params, columns, limit, order_by_column, order_by_direction}`
pub fn extract_market_query(description: &str) -> Value {
    let lower = description.to_lowercase();

    let symbol_pattern = extract_symbol_pattern(description, &lower);

    let mut template = "by_symbol".to_string();
    let mut params = json!({ "symbol_pattern": symbol_pattern });

    // Absolute dates switch to the dated templates
    if let Some(date) = date_re().find(description) {
        template = if symbol_pattern == "%" {
            "by_date".to_string()
        } else {
            "by_symbol_and_date".to_string()
        };
        params["file_date"] = json!(date.as_str());
    }

    // Numeric ranges take precedence over single comparisons and switch to
    // the custom-conditions template
    let between = Regex::new(r"between\s+(\d+\.?\d*)\s+and\s+(\d+\.?\d*)").unwrap();
    let from_to = Regex::new(r"from\s+(\d+\.?\d*)\s+to\s+(\d+\.?\d*)").unwrap();
    let compare = Regex::new(r"price\s*([><=]+)\s*(\d+\.?\d*)").unwrap();

    let range = between.captures(&lower).or_else(|| from_to.captures(&lower));
    if let Some(caps) = range {
        let min: f64 = caps[1].parse().unwrap_or(0.0);
        let max: f64 = caps[2].parse().unwrap_or(0.0);

        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if symbol_pattern != "%" {
            conditions.push("symbol LIKE ?".to_string());
            values.push(json!(symbol_pattern));
        }
        conditions.push("price BETWEEN ? AND ?".to_string());
        values.push(json!(min));
        values.push(json!(max));
        conditions.push("is_valid = 1".to_string());

        template = "custom".to_string();
        params = json!({ "conditions": conditions.join(" AND "), "values": values });
    } else if let Some(caps) = compare.captures(&lower) {
        let operator = caps[1].to_string();
        let value: f64 = caps[2].parse().unwrap_or(0.0);

        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if symbol_pattern != "%" {
            conditions.push("symbol LIKE ?".to_string());
            values.push(json!(symbol_pattern));
        }
        conditions.push(format!("price {operator} ?"));
        values.push(json!(value));
        conditions.push("is_valid = 1".to_string());

        template = "custom".to_string();
        params = json!({ "conditions": conditions.join(" AND "), "values": values });
    }

    let (order_by_column, order_by_direction) = extract_ordering(&lower);
    let limit = extract_query_limit(&lower);

    let mut out = Map::new();
    out.insert("template".to_string(), json!(template));
    out.insert("params".to_string(), params);
    out.insert("columns".to_string(), Value::Null);
    out.insert("limit".to_string(), json!(limit));
    out.insert(
        "order_by_column".to_string(),
        order_by_column.map(|c| json!(c)).unwrap_or(Value::Null),
    );
    out.insert("order_by_direction".to_string(), json!(order_by_direction));
    Value::Object(out)
}

fn extract_symbol_pattern(description: &str, lower: &str) -> String {
    if contains_any(lower, &["btc", "bitcoin"]) {
        return "%BTC%".to_string();
    }
    if contains_any(lower, &["eth", "ethereum"]) {
        return "%ETH%".to_string();
    }
    if has_word(lower, "zn") {
        return "%ZN%".to_string();
    }
    // Option chains resolve by contract suffix
    if has_word(lower, "call") || has_word(lower, "calls") {
        return "%.C".to_string();
    }
    if has_word(lower, "put") || has_word(lower, "puts") {
        return "%.P".to_string();
    }
    if lower.contains("symbol") {
        let explicit = Regex::new(r"\b([A-Z]{2,5})\b").unwrap();
        if let Some(caps) = explicit.captures(description) {
            return format!("%{}%", &caps[1]);
        }
    }
    "%".to_string()
}

fn extract_ordering(lower: &str) -> (Option<&'static str>, &'static str) {
    let mut direction = "ASC";
    if contains_any(lower, &["descending", "desc", "latest", "most recent", "newest"]) {
        direction = "DESC";
    } else if contains_any(lower, &["ascending", "asc", "oldest", "earliest"]) {
        direction = "ASC";
    }

    let column = if contains_any(lower, &["date", "when", "recent", "latest", "earliest", "oldest"])
    {
        Some("file_date")
    } else if contains_any(lower, &["price", "highest", "lowest", "expensive", "cheap"]) {
        if contains_any(lower, &["highest", "expensive"]) {
            direction = "DESC";
        } else if contains_any(lower, &["lowest", "cheap"]) {
            direction = "ASC";
        }
        Some("price")
    } else if lower.contains("sort") || lower.contains("order") {
        Some("file_date")
    } else {
        None
    };

    if column.is_some() {
        (column, direction)
    } else {
        (None, "ASC")
    }
}

fn extract_query_limit(lower: &str) -> u64 {
    let counted = Regex::new(r"(?:most recent|latest|first|top)\s+(\d+)").unwrap();
    if let Some(caps) = counted.captures(lower) {
        return caps[1].parse().unwrap_or(DEFAULT_QUERY_LIMIT);
    }
    if contains_any(lower, &["most recent", "latest", "first", "oldest"]) {
        // Singular superlative without a count means one row
        return 1;
    }
    DEFAULT_QUERY_LIMIT
}

/// Extract a prediction-market search: free-text topic with stop-words,
/// dates, and comparison cues stripped, plus a capped result limit.
///
/// Output shape: `{query, limit, session_id}`
pub fn extract_prediction_search(description: &str) -> Value {
    let lower = description.to_lowercase();

    let counted = Regex::new(r"top\s+(\d+)|first\s+(\d+)|(\d+)\s+market").unwrap();
    let limit = counted
        .captures(&lower)
        .and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .and_then(|m| m.as_str().parse::<u64>().ok())
        })
        .map(|n| n.min(MAX_SEARCH_LIMIT))
        .unwrap_or(DEFAULT_SEARCH_LIMIT);

    json!({
        "query": extract_topic(&lower),
        "limit": limit,
        "session_id": Value::Null,
    })
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "find", "first", "for", "from", "get",
    "in", "is", "it", "me", "most", "of", "on", "or", "recent", "search", "show", "that", "the",
    "their", "then", "this", "to", "top", "was", "were", "what", "when", "which", "will", "with",
];

const COMPARISON_CUES: &[&str] = &["between", "above", "below", "over", "under", "than", "versus"];

fn extract_topic(lower: &str) -> String {
    let date = date_re();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .filter(|w| !STOP_WORDS.contains(w))
        .filter(|w| !COMPARISON_CUES.contains(w))
        .filter(|w| !date.is_match(w))
        .filter(|w| w.parse::<f64>().is_err())
        .collect();
    words.join(" ")
}

/// Generic pass-through: the description becomes the query; an ISO date is
/// surfaced when present.
///
/// Output shape: `{query, date?}`
pub fn extract_generic(description: &str) -> Value {
    let mut out = Map::new();
    out.insert("query".to_string(), json!(description));
    if let Some(date) = date_re().find(description) {
        out.insert("date".to_string(), json!(date.as_str()));
    }
    Value::Object(out)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| has_word(haystack, n))
}

/// Word-boundary containment check over a lowercase haystack.
fn has_word(haystack: &str, needle: &str) -> bool {
    let mut search_from = 0;
    while let Some(offset) = haystack[search_from..].find(needle) {
        let start = search_from + offset;
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
        if before_ok && after_ok {
            return true;
        }
        // Advance past the first char of the match, not one byte
        search_from = start
            + needle
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(1);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_options_resolve_to_contract_suffix() {
        let params = extract_market_query("Show all call options");
        assert_eq!(params["template"], "by_symbol");
        assert_eq!(params["params"]["symbol_pattern"], "%.C");
        assert_eq!(params["limit"], 1000);
    }

    #[test]
    fn test_put_options_resolve_to_contract_suffix() {
        let params = extract_market_query("list put options by price");
        assert_eq!(params["params"]["symbol_pattern"], "%.P");
    }

    #[test]
    fn test_zn_between_range_builds_custom_conditions() {
        let params = extract_market_query(
            "Most recent date when ZN closing price was between 112.5 and 112.9",
        );
        assert_eq!(params["template"], "custom");
        assert_eq!(
            params["params"]["conditions"],
            "symbol LIKE ? AND price BETWEEN ? AND ? AND is_valid = 1"
        );
        assert_eq!(
            params["params"]["values"],
            serde_json::json!(["%ZN%", 112.5, 112.9])
        );
        assert_eq!(params["order_by_column"], "file_date");
        assert_eq!(params["order_by_direction"], "DESC");
        assert_eq!(params["limit"], 1);
    }

    #[test]
    fn test_price_comparison_builds_custom_conditions() {
        let params = extract_market_query("bitcoin rows where price > 50000");
        assert_eq!(params["template"], "custom");
        assert_eq!(
            params["params"]["conditions"],
            "symbol LIKE ? AND price > ? AND is_valid = 1"
        );
        assert_eq!(
            params["params"]["values"],
            serde_json::json!(["%BTC%", 50000.0])
        );
    }

    #[test]
    fn test_date_switches_template() {
        let params = extract_market_query("ZN prices on 2024-03-05");
        assert_eq!(params["template"], "by_symbol_and_date");
        assert_eq!(params["params"]["file_date"], "2024-03-05");

        let params = extract_market_query("everything traded on 2024-03-05");
        assert_eq!(params["template"], "by_date");
    }

    #[test]
    fn test_top_n_limit() {
        let params = extract_market_query("top 25 highest price rows");
        assert_eq!(params["limit"], 25);
        assert_eq!(params["order_by_column"], "price");
        assert_eq!(params["order_by_direction"], "DESC");
    }

    #[test]
    fn test_oldest_sorts_ascending_with_limit_one() {
        let params = extract_market_query("oldest ZN record");
        assert_eq!(params["order_by_column"], "file_date");
        assert_eq!(params["order_by_direction"], "ASC");
        assert_eq!(params["limit"], 1);
    }

    #[test]
    fn test_prediction_search_strips_noise() {
        let params = extract_prediction_search("Find the top 5 Bitcoin predictions for 2024-06-01");
        assert_eq!(params["limit"], 5);
        let topic = params["query"].as_str().expect("topic");
        assert!(topic.contains("bitcoin"));
        assert!(topic.contains("predictions"));
        assert!(!topic.contains("top"));
        assert!(!topic.contains("2024-06-01"));
        assert_eq!(params["session_id"], Value::Null);
    }

    #[test]
    fn test_prediction_search_caps_limit() {
        let params = extract_prediction_search("top 500 election markets");
        assert_eq!(params["limit"], 50);
    }

    #[test]
    fn test_prediction_search_defaults() {
        let params = extract_prediction_search("election odds");
        assert_eq!(params["limit"], 10);
        assert_eq!(params["query"], "election odds");
    }

    #[test]
    fn test_generic_extractor_passes_description_and_date() {
        let params = extract_generic("summarize activity since 2024-01-15");
        assert_eq!(params["query"], "summarize activity since 2024-01-15");
        assert_eq!(params["date"], "2024-01-15");

        let params = extract_generic("summarize activity");
        assert!(params.get("date").is_none());
    }

    #[test]
    fn test_extractor_kind_selection() {
        assert_eq!(
            ExtractorKind::for_agent("market_data"),
            ExtractorKind::SqlMarket
        );
        assert_eq!(
            ExtractorKind::for_agent("prediction_search"),
            ExtractorKind::PredictionSearch
        );
        assert_eq!(
            ExtractorKind::for_agent("polymarket_agent"),
            ExtractorKind::PredictionSearch
        );
        assert_eq!(ExtractorKind::for_agent("analytics"), ExtractorKind::Generic);
    }
}
