//! Subscription Filters
//!
//! A filter is a JSONPath query over the invocation input. It matches when
//! the query selects at least one node. Filter selectors (`$[?...]`) select
//! children, so they are run against the input wrapped in a one-element
//! array: `$[?@.status == 'ACTIVE']` then tests the input object itself.

use serde_json::Value;
use serde_json_path::JsonPath;

use crate::error::{EtsError, Result};

#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    path: JsonPath,
    wraps_input: bool,
}

impl SubscriptionFilter {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let path = JsonPath::parse(trimmed)
            .map_err(|e| EtsError::validation("filter", format!("invalid JSONPath: {}", e)))?;
        Ok(Self {
            path,
            wraps_input: trimmed.starts_with("$[?"),
        })
    }

    pub fn matches(&self, input: &Value) -> bool {
        if self.wraps_input {
            let wrapped = Value::Array(vec![input.clone()]);
            !self.path.query(&wrapped).is_empty()
        } else {
            !self.path.query(input).is_empty()
        }
    }
}

/// Why a subscription's filter did not let an invocation through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Pass,
    NoMatch,
    /// The stored expression could not be evaluated
    Invalid(String),
}

/// Evaluate an optional stored filter expression against an input
pub fn evaluate(expression: Option<&str>, input: &Value) -> FilterVerdict {
    let Some(expression) = expression.filter(|e| !e.trim().is_empty()) else {
        return FilterVerdict::Pass;
    };
    match SubscriptionFilter::parse(expression) {
        Ok(filter) if filter.matches(input) => FilterVerdict::Pass,
        Ok(_) => FilterVerdict::NoMatch,
        Err(e) => FilterVerdict::Invalid(e.to_string()),
    }
}
