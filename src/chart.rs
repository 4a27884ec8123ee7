//! Maps the dimension/measure shape of a query to a chart type.
//!
//! The rules form an ordered table and the first matching rule wins, so
//! every input combination has exactly one answer.

use serde::{Deserialize, Serialize};

/// Values that mark a dimension as a lifecycle/conversion funnel.
pub const FUNNEL_STAGES: &[&str] = &[
    "awareness",
    "consideration",
    "trial",
    "activation",
    "retention",
];

/// Dimensions with at most this many distinct values count as low cardinality.
pub const LOW_CARDINALITY_MAX: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Line,
    Funnel,
    Heatmap,
    Bar,
    Pie,
    Scatter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    Low,
    #[default]
    High,
}

impl Cardinality {
    pub fn from_distinct_count(count: usize) -> Self {
        if count <= LOW_CARDINALITY_MAX {
            Cardinality::Low
        } else {
            Cardinality::High
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionMeta {
    pub is_temporal: bool,
    pub cardinality: Cardinality,
    /// Known values of the dimension, when declared.
    #[serde(default)]
    pub values: Vec<String>,
}

impl DimensionMeta {
    fn is_funnel_stage(&self) -> bool {
        self.values
            .iter()
            .any(|v| FUNNEL_STAGES.contains(&v.to_lowercase().as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartRecommendation {
    pub chart_type: ChartType,
    pub reason: String,
}

struct Shape<'a> {
    dimensions: usize,
    measures: usize,
    meta: &'a [DimensionMeta],
}

struct Rule {
    matches: fn(&Shape) -> bool,
    chart_type: ChartType,
    reason: &'static str,
}

const RULES: &[Rule] = &[
    Rule {
        matches: |s| s.measures >= 1 && s.meta.iter().any(|d| d.is_temporal),
        chart_type: ChartType::Line,
        reason: "time dimension with at least one measure",
    },
    Rule {
        matches: |s| s.measures == 1 && s.meta.iter().any(DimensionMeta::is_funnel_stage),
        chart_type: ChartType::Funnel,
        reason: "dimension values are funnel stages",
    },
    Rule {
        matches: |s| s.dimensions == 2 && s.measures == 1,
        chart_type: ChartType::Heatmap,
        reason: "two dimensions with one measure",
    },
    Rule {
        matches: |s| s.dimensions == 1 && s.measures > 1,
        chart_type: ChartType::Bar,
        reason: "one dimension with several measures, grouped bars",
    },
    Rule {
        matches: |s| {
            s.dimensions == 1
                && s.measures == 1
                && s.meta.first().map(|d| d.cardinality) == Some(Cardinality::Low)
        },
        chart_type: ChartType::Pie,
        reason: "single low-cardinality dimension with one measure",
    },
    Rule {
        matches: |s| s.dimensions == 1 && s.measures == 1,
        chart_type: ChartType::Bar,
        reason: "single dimension with one measure",
    },
    Rule {
        matches: |s| s.dimensions >= 2 && s.measures >= 2,
        chart_type: ChartType::Scatter,
        reason: "several dimensions and several measures",
    },
];

const DEFAULT_REASON: &str = "no specific shape detected";

pub fn classify(
    dimension_count: usize,
    measure_count: usize,
    dimensions: &[DimensionMeta],
) -> ChartRecommendation {
    let shape = Shape {
        dimensions: dimension_count,
        measures: measure_count,
        meta: dimensions,
    };

    RULES
        .iter()
        .find(|rule| (rule.matches)(&shape))
        .map(|rule| ChartRecommendation {
            chart_type: rule.chart_type,
            reason: rule.reason.to_string(),
        })
        .unwrap_or_else(|| ChartRecommendation {
            chart_type: ChartType::Bar,
            reason: DEFAULT_REASON.to_string(),
        })
}
