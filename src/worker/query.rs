//! Compiled queries handed to the driver.
//!
//! The query-authoring layer produces SQL text plus parameters and knows
//! whether the statement returns rows. The driver never parses SQL; the only
//! inspection done here is the leading-keyword check in [`CompiledQuery::raw`].

use serde::{Deserialize, Serialize};

use super::protocol::SqlValue;

/// Whether a statement returns rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Select,
    Mutation,
}

/// SQL text, bound parameters and the statement kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub parameters: Vec<SqlValue>,
    pub kind: QueryKind,
}

/// Leading keywords treated as row-returning by [`CompiledQuery::raw`].
const SELECT_KEYWORDS: &[&str] = &["select", "with", "values"];

impl CompiledQuery {
    /// A row-returning query.
    pub fn select(sql: impl Into<String>, parameters: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            parameters,
            kind: QueryKind::Select,
        }
    }

    /// A mutating statement.
    pub fn mutation(sql: impl Into<String>, parameters: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            parameters,
            kind: QueryKind::Mutation,
        }
    }

    /// A parameterless statement classified by its leading keyword.
    pub fn raw(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let first = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let kind = if SELECT_KEYWORDS.contains(&first.as_str()) {
            QueryKind::Select
        } else {
            QueryKind::Mutation
        };
        Self {
            sql,
            parameters: Vec::new(),
            kind,
        }
    }

    pub fn is_select(&self) -> bool {
        self.kind == QueryKind::Select
    }
}
