//! Query body builders
//!
//! Small helpers producing the document store's JSON query DSL. Only the
//! shapes the control plane actually issues are covered: exact-match terms,
//! numeric range bounds, and boolean filter composition.

use serde_json::{Value, json};

/// Match every document in the index
#[must_use]
pub fn match_all() -> Value {
    json!({ "match_all": {} })
}

/// Exact-match filter on one field
pub fn term(field: &str, value: impl Into<Value>) -> Value {
    json!({ "term": { field: value.into() } })
}

/// Numeric `field <= bound` filter
#[must_use]
pub fn range_lte(field: &str, bound: i64) -> Value {
    json!({ "range": { field: { "lte": bound } } })
}

/// Numeric `field >= bound` filter
#[must_use]
pub fn range_gte(field: &str, bound: i64) -> Value {
    json!({ "range": { field: { "gte": bound } } })
}

/// All clauses must match; scoring is irrelevant to this control plane, so
/// everything composes as filters
#[must_use]
pub fn bool_filter(clauses: Vec<Value>) -> Value {
    json!({ "bool": { "filter": clauses } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_shapes() {
        assert_eq!(term("kind", "TEMP"), json!({"term": {"kind": "TEMP"}}));
        assert_eq!(term("deleted", false), json!({"term": {"deleted": false}}));
    }

    #[test]
    fn test_bool_filter_composition() {
        let q = bool_filter(vec![term("kind", "TEMP"), range_lte("expires_at", 42)]);
        assert_eq!(
            q,
            json!({
                "bool": { "filter": [
                    {"term": {"kind": "TEMP"}},
                    {"range": {"expires_at": {"lte": 42}}}
                ]}
            })
        );
    }
}
