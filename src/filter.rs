//! Metadata filter expressions for vector search.
//!
//! Builds an OData-style equality conjunction such as
//! `course_id eq 'c1' and module_id eq 'm2'`. Values are quoted with single
//! quotes; embedded quotes are doubled so a value can never terminate its
//! literal early.

use serde::{Deserialize, Serialize};

/// Optional metadata restrictions for a retrieval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    pub course_id: Option<String>,
    pub module_id: Option<String>,
}

impl Filters {
    /// Render the filter expression. Returns `None` when no field is set.
    ///
    /// Empty strings count as unset.
    pub fn to_expression(&self) -> Option<String> {
        let clauses: Vec<String> = [
            ("course_id", self.course_id.as_deref()),
            ("module_id", self.module_id.as_deref()),
        ]
        .into_iter()
        .filter_map(|(field, value)| match value {
            Some(v) if !v.is_empty() => Some(eq_clause(field, v)),
            _ => None,
        })
        .collect();

        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" and "))
        }
    }
}

fn eq_clause(field: &str, value: &str) -> String {
    format!("{} eq '{}'", field, escape_literal(value))
}

/// Double every single quote inside a string literal.
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}
