// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Query AST for document lookups.
//!
//! Translation of typed predicates into this AST is the caller's problem;
//! the core evaluates it either in the storage backend (when the backend
//! can honor it) or in memory against the JSON content.
//!
//! Property paths are dot-separated (`"address.city"`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A predicate over document content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Query {
    And { clauses: Vec<Query> },
    Or { clauses: Vec<Query> },
    Eq { path: String, value: Value },
    Neq { path: String, value: Value },
    Gt { path: String, value: Value },
    Gte { path: String, value: Value },
    Lt { path: String, value: Value },
    Lte { path: String, value: Value },
    /// String containment on string fields, element containment on arrays.
    Contains { path: String, value: Value },
}

impl Query {
    pub fn and(clauses: Vec<Query>) -> Self {
        Query::And { clauses }
    }

    pub fn or(clauses: Vec<Query>) -> Self {
        Query::Or { clauses }
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Eq { path: path.into(), value: value.into() }
    }

    pub fn neq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Neq { path: path.into(), value: value.into() }
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Gt { path: path.into(), value: value.into() }
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Gte { path: path.into(), value: value.into() }
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Lt { path: path.into(), value: value.into() }
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Lte { path: path.into(), value: value.into() }
    }

    pub fn contains(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Contains { path: path.into(), value: value.into() }
    }

    /// Evaluates the predicate against a document's JSON content.
    ///
    /// Missing fields fail every comparison except `Neq`, which treats a
    /// missing field as "not equal".
    pub fn matches(&self, content: &Value) -> bool {
        match self {
            Query::And { clauses } => clauses.iter().all(|c| c.matches(content)),
            Query::Or { clauses } => clauses.iter().any(|c| c.matches(content)),
            Query::Eq { path, value } => {
                lookup_path(content, path).is_some_and(|v| json_eq(v, value))
            }
            Query::Neq { path, value } => {
                !lookup_path(content, path).is_some_and(|v| json_eq(v, value))
            }
            Query::Gt { path, value } => cmp_at(content, path, value)
                .is_some_and(|o| o == Ordering::Greater),
            Query::Gte { path, value } => {
                cmp_at(content, path, value).is_some_and(|o| o != Ordering::Less)
            }
            Query::Lt { path, value } => {
                cmp_at(content, path, value).is_some_and(|o| o == Ordering::Less)
            }
            Query::Lte { path, value } => cmp_at(content, path, value)
                .is_some_and(|o| o != Ordering::Greater),
            Query::Contains { path, value } => {
                lookup_path(content, path).is_some_and(|v| json_contains(v, value))
            }
        }
    }

    /// True when any leaf of the query is a `Contains`.
    ///
    /// Backends that cannot express containment use this to decide on an
    /// in-memory fallback.
    pub fn uses_contains(&self) -> bool {
        match self {
            Query::And { clauses } | Query::Or { clauses } => {
                clauses.iter().any(Query::uses_contains)
            }
            Query::Contains { .. } => true,
            _ => false,
        }
    }
}

/// Resolves a dot-separated path inside a JSON value.
pub fn lookup_path<'a>(content: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = content;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        // Numeric compare so 30 == 30.0
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Partial order over JSON scalars: numbers with numbers, strings with
/// strings, booleans with booleans. Mixed types are unordered.
pub fn json_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn cmp_at(content: &Value, path: &str, value: &Value) -> Option<Ordering> {
    json_cmp(lookup_path(content, path)?, value)
}

fn json_contains(field: &Value, needle: &Value) -> bool {
    match (field, needle) {
        (Value::String(hay), Value::String(sub)) => hay.contains(sub.as_str()),
        (Value::Array(items), _) => items.iter().any(|item| json_eq(item, needle)),
        _ => false,
    }
}

#[cfg(test)]
#[path = "query_tests.rs"]
mod tests;
