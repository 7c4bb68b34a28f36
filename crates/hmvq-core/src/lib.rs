//! Core domain model for HMV fair-quote validation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hmvq-core";

pub const COL_DESCRIPTION: &str = "Description";
pub const COL_CORRECTIVE_ACTION: &str = "Corrective Action";
pub const COL_TOTAL_HOURS: &str = "Total Hours";
pub const COL_YEAR: &str = "Year";
pub const COL_CARD: &str = "Orig. Card #";

pub const REQUIRED_COLUMNS: [&str; 5] = [
    COL_DESCRIPTION,
    COL_CORRECTIVE_ACTION,
    COL_TOTAL_HOURS,
    COL_YEAR,
    COL_CARD,
];

/// Annotation stripped from discrepancy text (never from corrective action)
/// before normalization.
pub const REFERENCE_ONLY_MARKER: &str = "(FOR REFERENCE ONLY)";

/// Separator between the two normalized fields of a combined key.
pub const KEY_SEPARATOR: &str = " | ";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("missing required column(s): {}{}", .missing.join(", "), render_suggestions(.suggestions))]
    Schema {
        missing: Vec<String>,
        suggestions: Vec<ColumnSuggestion>,
    },
    #[error("row {row}, column {column:?}: {reason}")]
    Data {
        row: usize,
        column: String,
        reason: String,
    },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// Closest present header for a missing required column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSuggestion {
    pub missing: String,
    pub found: String,
}

fn render_suggestions(suggestions: &[ColumnSuggestion]) -> String {
    if suggestions.is_empty() {
        return String::new();
    }
    let hints = suggestions
        .iter()
        .map(|s| format!("{:?} -> did you mean {:?}?", s.missing, s.found))
        .collect::<Vec<_>>()
        .join("; ");
    format!(" ({hints})")
}

/// One cell of an uploaded table, before column coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Number(n) => n.is_nan(),
            CellValue::Bool(_) => false,
        }
    }

    /// Text rendering used for free-text columns. Integral numbers lose
    /// their fractional part so card numbers read `1234`, not `1234.0`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Empty => None,
            CellValue::Text(s) => Some(s.clone()),
            CellValue::Number(n) if n.is_nan() => None,
            CellValue::Number(n) => Some(n.to_string()),
            CellValue::Bool(b) => Some(b.to_string()),
        }
    }
}

/// Tabular input: a header row plus data rows, as read from a workbook or
/// JSON upload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RawTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.trim() == name)
    }

    pub fn cell(&self, row: usize, column: usize) -> &CellValue {
        static EMPTY: CellValue = CellValue::Empty;
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .unwrap_or(&EMPTY)
    }
}

/// One historical work order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub description: String,
    pub corrective_action: String,
    pub total_hours: f64,
    pub year: Option<i32>,
    pub card_number: Option<String>,
    /// Spreadsheet row the record was read from (header = row 1); `None`
    /// for records built in code.
    #[serde(default)]
    pub source_row: Option<usize>,
}

/// Normalized view of a record; recomputed from the record, never stored on
/// its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub normalized_discrepancy: String,
    pub normalized_corrective_action: String,
    pub combined_key: String,
}

impl NormalizedRecord {
    pub fn new(normalized_discrepancy: String, normalized_corrective_action: String) -> Self {
        let combined_key = format!("{normalized_discrepancy}{KEY_SEPARATOR}{normalized_corrective_action}");
        Self {
            normalized_discrepancy,
            normalized_corrective_action,
            combined_key,
        }
    }

    /// Both fields empty after normalization. Blank keys are neither
    /// clustered nor matched.
    pub fn is_blank(&self) -> bool {
        self.normalized_discrepancy.is_empty() && self.normalized_corrective_action.is_empty()
    }
}

/// Stable index of a cluster inside a dataset's cluster table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub usize);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub mean_hours: f64,
    pub occurrence_count: usize,
    pub fair_quote_hours: f64,
}

/// A cluster of near-duplicate combined keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub representative: String,
    pub members: Vec<String>,
    pub stats: ClusterStats,
}

/// A record enriched with its normalized fields and cluster annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    /// Position in the dataset (0-based). Skipped empty table rows are not
    /// counted; see `source_row` for the spreadsheet row.
    pub row_index: usize,
    pub record: Record,
    pub normalized: NormalizedRecord,
    pub cluster: Option<ClusterId>,
    pub stats: Option<ClusterStats>,
}

impl DatasetRow {
    pub fn is_eligible(&self) -> bool {
        self.cluster.is_some()
    }

    pub fn fair_quote_hours(&self) -> Option<f64> {
        self.stats.map(|s| s.fair_quote_hours)
    }

    /// Spreadsheet row number for display, falling back to the dataset
    /// position as if the rows had come from a gap-free sheet.
    pub fn source_row(&self) -> usize {
        self.record.source_row.unwrap_or(self.row_index + 2)
    }

    pub fn occurrence_count(&self) -> Option<usize> {
        self.stats.map(|s| s.occurrence_count)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub source_name: Option<String>,
    pub fingerprint: Option<String>,
    pub built_at: DateTime<Utc>,
    pub rows: usize,
    pub eligible_rows: usize,
    pub distinct_keys: usize,
    pub clusters: usize,
}

/// A submitted task to be priced against history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub discrepancy: String,
    pub corrective_action: String,
    pub supplier_hours: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchTier {
    Exact,
    Approximate,
    Nearest,
}

impl MatchTier {
    pub fn label(self) -> &'static str {
        match self {
            MatchTier::Exact => "Exact Match",
            MatchTier::Approximate => "Approximate Match",
            MatchTier::Nearest => "Nearest Reference",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRow {
    pub row: DatasetRow,
    /// Heuristic 0-100 similarity; not a metric.
    pub overlap_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum MatchResult {
    Exact { rows: Vec<MatchedRow> },
    Approximate { rows: Vec<MatchedRow> },
    Nearest { row: MatchedRow },
    NoData,
}

impl MatchResult {
    pub fn tier(&self) -> Option<MatchTier> {
        match self {
            MatchResult::Exact { .. } => Some(MatchTier::Exact),
            MatchResult::Approximate { .. } => Some(MatchTier::Approximate),
            MatchResult::Nearest { .. } => Some(MatchTier::Nearest),
            MatchResult::NoData => None,
        }
    }

    pub fn rows(&self) -> &[MatchedRow] {
        match self {
            MatchResult::Exact { rows } | MatchResult::Approximate { rows } => rows,
            MatchResult::Nearest { row } => std::slice::from_ref(row),
            MatchResult::NoData => &[],
        }
    }

    /// Row whose fair quote drives the conclusion.
    pub fn primary(&self) -> Option<&MatchedRow> {
        self.rows().first()
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, MatchResult::NoData)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    NoHistoricalData,
    FairApprove,
    InRangeConsiderApprove,
    BeyondRangeNeedsReview,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Verdict::NoHistoricalData => "No historical hours - flag for manual review",
            Verdict::FairApprove => "Fair quote - approve quote",
            Verdict::InRangeConsiderApprove => "In expected range (±5%) - consider approving",
            Verdict::BeyondRangeNeedsReview => "Beyond expected range - needs to be reviewed",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Verdict::FairApprove => Severity::Approve,
            Verdict::InRangeConsiderApprove => Severity::Neutral,
            Verdict::NoHistoricalData | Verdict::BeyondRangeNeedsReview => Severity::Review,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Approve,
    Neutral,
    Review,
}

impl Severity {
    pub fn css_class(self) -> &'static str {
        match self {
            Severity::Approve => "severity-approve",
            Severity::Neutral => "severity-neutral",
            Severity::Review => "severity-review",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Conclusion {
    pub verdict: Verdict,
    pub severity: Severity,
    pub supplier_hours: f64,
    pub fair_quote_hours: f64,
    /// `None` when the fair quote is zero ("N/A").
    pub percent_difference: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteAssessment {
    pub query: Query,
    pub result: MatchResult,
    pub conclusion: Option<Conclusion>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_key_joins_with_separator() {
        let n = NormalizedRecord::new("REPLACE SEAL".into(), "REPLACED SEAL AND TESTED".into());
        assert_eq!(n.combined_key, "REPLACE SEAL | REPLACED SEAL AND TESTED");
        assert!(!n.is_blank());
        assert!(NormalizedRecord::new(String::new(), String::new()).is_blank());
    }

    #[test]
    fn number_cells_render_without_trailing_zero() {
        assert_eq!(CellValue::Number(1234.0).as_text().as_deref(), Some("1234"));
        assert_eq!(CellValue::Number(12.5).as_text().as_deref(), Some("12.5"));
        assert_eq!(CellValue::Number(f64::NAN).as_text(), None);
        assert!(CellValue::Text("  ".into()).is_empty());
    }

    #[test]
    fn schema_error_lists_missing_columns_and_hints() {
        let err = EngineError::Schema {
            missing: vec!["Total Hours".into()],
            suggestions: vec![ColumnSuggestion {
                missing: "Total Hours".into(),
                found: "Total Hrs".into(),
            }],
        };
        let text = err.to_string();
        assert!(text.contains("Total Hours"));
        assert!(text.contains("did you mean \"Total Hrs\""));
    }

    #[test]
    fn match_result_serializes_with_tier_tag() {
        let json = serde_json::to_value(MatchResult::NoData).unwrap();
        assert_eq!(json["tier"], "no_data");
        assert!(MatchResult::NoData.primary().is_none());
    }
}
