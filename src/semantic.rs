//! Declared table schemas: which dimensions and measures each table offers.
//!
//! The model serves three purposes. It gives generation providers a table
//! description to work from, it compiles structured provider answers
//! (table + dimensions + measures) into SQL, and it rejects prompts that
//! name fields the table does not have before anything external is called.

use crate::chart::{Cardinality, DimensionMeta};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SemanticError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown dimension: {name}. Available: {available}")]
    UnknownDimension { name: String, available: String },
    #[error("unknown measure: {name}. Available: {available}")]
    UnknownMeasure { name: String, available: String },
    #[error("prompt references unknown field `{field}` on table {table}")]
    UnknownField { field: String, table: String },
    #[error("query must select at least one measure")]
    NoMeasures,
    #[error("failed to read semantic model: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid semantic model: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionDef {
    #[serde(default)]
    pub column: Option<String>,
    /// SQL expression, used instead of `column` when present.
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cardinality: Option<Cardinality>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub is_time_dimension: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasureDef {
    /// Aggregate SQL expression, e.g. `SUM(revenue)`.
    pub aggregation: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableModel {
    /// Physical table name the SQL runs against.
    pub table: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dimensions: BTreeMap<String, DimensionDef>,
    #[serde(default)]
    pub measures: BTreeMap<String, MeasureDef>,
    /// Extra physical columns that may be referenced by name.
    #[serde(default)]
    pub columns: Vec<String>,
}

/// A structured query as returned by providers that answer in JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticQuery {
    pub table: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    pub measures: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticModel {
    pub tables: BTreeMap<String, TableModel>,
}

impl SemanticModel {
    pub fn load(path: &Path) -> Result<Self, SemanticError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, SemanticError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Looks a table up by model name or by physical table name.
    pub fn table(&self, name: &str) -> Option<&TableModel> {
        self.tables.get(name).or_else(|| {
            self.tables
                .values()
                .find(|t| t.table.eq_ignore_ascii_case(name))
        })
    }

    pub fn require_table(&self, name: &str) -> Result<&TableModel, SemanticError> {
        self.table(name)
            .ok_or_else(|| SemanticError::UnknownTable(name.to_string()))
    }
}

fn field_reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b[a-z][a-z0-9]*(?:_[a-z0-9]+)+\b").expect("field reference pattern is valid")
    })
}

impl TableModel {
    pub fn has_field(&self, name: &str) -> bool {
        self.dimensions.contains_key(name)
            || self.measures.contains_key(name)
            || self.columns.iter().any(|c| c.eq_ignore_ascii_case(name))
            || self
                .dimensions
                .values()
                .any(|d| d.column.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(name)))
    }

    /// Every snake_case identifier in the prompt is read as a field
    /// reference and must exist on this table. Plain words are free text.
    pub fn validate_prompt(&self, model_name: &str, prompt: &str) -> Result<(), SemanticError> {
        let lowered = prompt.to_lowercase();
        for found in field_reference_pattern().find_iter(&lowered) {
            let field = found.as_str();
            if field == self.table.to_lowercase() || field == model_name.to_lowercase() {
                continue;
            }
            if !self.has_field(field) {
                return Err(SemanticError::UnknownField {
                    field: field.to_string(),
                    table: self.table.clone(),
                });
            }
        }
        Ok(())
    }

    /// Table description handed to generation providers.
    pub fn describe(&self) -> String {
        let mut out = format!("Table: {}\n", self.table);
        if !self.description.is_empty() {
            out.push_str(&format!("{}\n", self.description));
        }

        out.push_str("\nDimensions:\n");
        for (name, dim) in &self.dimensions {
            out.push_str(&format!("- {} ({}): {}", name, dim.kind, dim.description));
            if !dim.values.is_empty() {
                out.push_str(&format!(" [{}]", dim.values.join(", ")));
            }
            out.push('\n');
        }

        out.push_str("\nMeasures:\n");
        for (name, measure) in &self.measures {
            out.push_str(&format!("- {}: {}", name, measure.description));
            if !measure.format.is_empty() {
                out.push_str(&format!(" ({})", measure.format));
            }
            out.push('\n');
        }

        if !self.columns.is_empty() {
            out.push_str(&format!("\nOther columns: {}\n", self.columns.join(", ")));
        }
        out
    }

    fn dimension(&self, name: &str) -> Result<&DimensionDef, SemanticError> {
        self.dimensions
            .get(name)
            .ok_or_else(|| SemanticError::UnknownDimension {
                name: name.to_string(),
                available: self.dimensions.keys().cloned().collect::<Vec<_>>().join(", "),
            })
    }

    fn measure(&self, name: &str) -> Result<&MeasureDef, SemanticError> {
        self.measures
            .get(name)
            .ok_or_else(|| SemanticError::UnknownMeasure {
                name: name.to_string(),
                available: self.measures.keys().cloned().collect::<Vec<_>>().join(", "),
            })
    }

    /// Builds `SELECT dims, measures FROM table [WHERE] [GROUP BY] [LIMIT]`.
    pub fn compile(&self, query: &SemanticQuery) -> Result<String, SemanticError> {
        if query.measures.is_empty() {
            return Err(SemanticError::NoMeasures);
        }

        let mut select = Vec::with_capacity(query.dimensions.len() + query.measures.len());
        for name in &query.dimensions {
            let dim = self.dimension(name)?;
            let expr = match (&dim.sql, &dim.column) {
                (Some(sql), _) => format!("({})", sql),
                (None, Some(column)) => column.clone(),
                (None, None) => name.clone(),
            };
            select.push(format!("{} AS {}", expr, name));
        }
        for name in &query.measures {
            let measure = self.measure(name)?;
            select.push(format!("{} AS {}", measure.aggregation, name));
        }

        let mut sql = format!("SELECT {} FROM {}", select.join(", "), self.table);
        if !query.filters.is_empty() {
            sql.push_str(&format!(" WHERE {}", query.filters.join(" AND ")));
        }
        if !query.dimensions.is_empty() {
            let positions: Vec<String> = (1..=query.dimensions.len()).map(|i| i.to_string()).collect();
            sql.push_str(&format!(" GROUP BY {}", positions.join(", ")));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(sql)
    }

    /// Chart metadata for the named dimensions; unknown names get defaults.
    pub fn dimension_meta(&self, names: &[String]) -> Vec<DimensionMeta> {
        names
            .iter()
            .map(|name| match self.dimensions.get(name) {
                Some(dim) => DimensionMeta {
                    is_temporal: dim.is_time_dimension
                        || matches!(dim.kind.as_str(), "date" | "timestamp" | "time"),
                    cardinality: dim.cardinality.unwrap_or_else(|| {
                        if dim.values.is_empty() {
                            Cardinality::High
                        } else {
                            Cardinality::from_distinct_count(dim.values.len())
                        }
                    }),
                    values: dim.values.clone(),
                },
                None => DimensionMeta::default(),
            })
            .collect()
    }
}
