//! Fair-quote engine: text normalization, greedy clustering of historical
//! work orders, per-cluster hour statistics, tiered query matching and
//! quote conclusions.
//!
//! Both similarity measures here are heuristics. Neither the token-set score
//! used for clustering nor the alignment overlap used for matching is a
//! distance metric: no triangle inequality, and the overlap score is not
//! guaranteed symmetric.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use hmvq_core::{
    CellValue, Cluster, ClusterId, ClusterStats, ColumnSuggestion, Conclusion, DatasetRow,
    DatasetSummary, EngineError, MatchResult, MatchedRow, NormalizedRecord, Query,
    QuoteAssessment, RawTable, Record, Verdict, COL_CARD, COL_CORRECTIVE_ACTION, COL_DESCRIPTION,
    COL_TOTAL_HOURS, COL_YEAR, REFERENCE_ONLY_MARKER, REQUIRED_COLUMNS,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::{debug, info, info_span, warn};

pub const CRATE_NAME: &str = "hmvq-engine";

pub const CLUSTER_SIMILARITY_THRESHOLD: u8 = 90;
pub const APPROXIMATE_OVERLAP_THRESHOLD: f64 = 50.0;
pub const APPROXIMATE_LIMIT: usize = 2;
pub const IN_RANGE_TOLERANCE: f64 = 0.05;

/// Absorbs binary rounding so hour values exactly 5% above the fair quote
/// (2.10 vs 2.00) land inside the band.
const TOLERANCE_EPSILON: f64 = 1e-9;

const HEADER_SUGGESTION_THRESHOLD: f64 = 0.85;

// ---------------------------------------------------------------------------
// Text normalization
// ---------------------------------------------------------------------------

/// Canonical comparable form of a free-text field: uppercased, date-like
/// tokens (`05/12/2023`, `5-12-23`) removed, whitespace collapsed.
pub fn normalize(text: &str) -> String {
    lazy_static::lazy_static! {
        static ref DATE_RE: Regex = Regex::new(r"\b\d{1,2}[-/]\d{1,2}[-/]\d{2,4}\b").unwrap();
        static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
    }

    if text.trim().is_empty() {
        return String::new();
    }
    let upper = text.to_uppercase();
    let without_dates = DATE_RE.replace_all(&upper, "");
    WHITESPACE_RE
        .replace_all(&without_dates, " ")
        .trim()
        .to_string()
}

/// Removes the reference-only annotation. Applied to discrepancy text only.
pub fn strip_reference_marker(text: &str) -> String {
    text.replace(REFERENCE_ONLY_MARKER, "")
}

pub fn normalize_pair(discrepancy: &str, corrective_action: &str) -> NormalizedRecord {
    NormalizedRecord::new(
        normalize(&strip_reference_marker(discrepancy)),
        normalize(corrective_action),
    )
}

pub fn normalize_record(record: &Record) -> NormalizedRecord {
    normalize_pair(&record.description, &record.corrective_action)
}

// ---------------------------------------------------------------------------
// Token-set similarity (clustering)
// ---------------------------------------------------------------------------

/// Sorted token set of a processed string: Latin-1 supplement characters
/// dropped, non-word characters turned into spaces, lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenSet {
    tokens: BTreeSet<String>,
}

impl TokenSet {
    pub fn new(text: &str) -> Self {
        let processed = text
            .chars()
            .filter(|c| !('\u{80}'..='\u{ff}').contains(c))
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
            .collect::<String>()
            .to_lowercase();
        Self {
            tokens: processed.split_whitespace().map(str::to_string).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

/// Order-independent token overlap score, 0-100.
pub fn token_set_ratio(a: &str, b: &str) -> u8 {
    token_set_ratio_prepared(&TokenSet::new(a), &TokenSet::new(b))
}

pub fn token_set_ratio_prepared(a: &TokenSet, b: &TokenSet) -> u8 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let join = |tokens: Vec<&String>| {
        tokens
            .into_iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    };
    let sect = join(a.tokens.intersection(&b.tokens).collect());
    let only_a = join(a.tokens.difference(&b.tokens).collect());
    let only_b = join(b.tokens.difference(&a.tokens).collect());

    let combined_a = format!("{sect} {only_a}").trim().to_string();
    let combined_b = format!("{sect} {only_b}").trim().to_string();

    [
        indel_ratio(&sect, &combined_a),
        indel_ratio(&sect, &combined_b),
        indel_ratio(&combined_a, &combined_b),
    ]
    .into_iter()
    .max()
    .unwrap_or(0)
}

/// `2 * LCS / (|a| + |b|)` over characters, scaled to 0-100 and rounded
/// half-to-even. Identical strings score 100, an empty side scores 0.
fn indel_ratio(a: &str, b: &str) -> u8 {
    if a == b {
        return 100;
    }
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let a = a.chars().collect::<Vec<_>>();
    let b = b.chars().collect::<Vec<_>>();
    let lcs = lcs_len(&a, &b);
    let score = 200.0 * lcs as f64 / (a.len() + b.len()) as f64;
    score.round_ties_even() as u8
}

fn lcs_len<T: Eq>(a: &[T], b: &[T]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ---------------------------------------------------------------------------
// Alignment overlap (matching)
// ---------------------------------------------------------------------------

/// Longest-matching-block aligner (Ratcliff/Obershelp). Elements of `b`
/// occurring more than `1% + 1` times are pruned when `b` has 200 or more
/// elements.
struct BlockMatcher<'a, T> {
    a: &'a [T],
    b: &'a [T],
    b2j: HashMap<&'a T, Vec<usize>>,
}

impl<'a, T: Eq + Hash> BlockMatcher<'a, T> {
    fn new(a: &'a [T], b: &'a [T]) -> Self {
        let mut b2j: HashMap<&'a T, Vec<usize>> = HashMap::new();
        for (j, elt) in b.iter().enumerate() {
            b2j.entry(elt).or_default().push(j);
        }
        if b.len() >= 200 {
            let ntest = b.len() / 100 + 1;
            b2j.retain(|_, indices| indices.len() <= ntest);
        }
        Self { a, b, b2j }
    }

    fn find_longest_match(&self, alo: usize, ahi: usize, blo: usize, bhi: usize) -> (usize, usize, usize) {
        let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0usize);
        let mut j2len: HashMap<usize, usize> = HashMap::new();
        for i in alo..ahi {
            let mut next_j2len = HashMap::new();
            if let Some(indices) = self.b2j.get(&self.a[i]) {
                for &j in indices {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let k = j
                        .checked_sub(1)
                        .and_then(|prev| j2len.get(&prev))
                        .copied()
                        .unwrap_or(0)
                        + 1;
                    next_j2len.insert(j, k);
                    if k > best_size {
                        best_i = i + 1 - k;
                        best_j = j + 1 - k;
                        best_size = k;
                    }
                }
            }
            j2len = next_j2len;
        }

        // Pruned elements can still extend a block on either side.
        while best_i > alo && best_j > blo && self.a[best_i - 1] == self.b[best_j - 1] {
            best_i -= 1;
            best_j -= 1;
            best_size += 1;
        }
        while best_i + best_size < ahi
            && best_j + best_size < bhi
            && self.a[best_i + best_size] == self.b[best_j + best_size]
        {
            best_size += 1;
        }
        (best_i, best_j, best_size)
    }

    fn matched_elements(&self) -> usize {
        let mut total = 0;
        let mut pending = vec![(0, self.a.len(), 0, self.b.len())];
        while let Some((alo, ahi, blo, bhi)) = pending.pop() {
            let (i, j, k) = self.find_longest_match(alo, ahi, blo, bhi);
            if k == 0 {
                continue;
            }
            total += k;
            if alo < i && blo < j {
                pending.push((alo, i, blo, j));
            }
            if i + k < ahi && j + k < bhi {
                pending.push((i + k, ahi, j + k, bhi));
            }
        }
        total
    }
}

/// `2 * M / (|a| + |b|)` where `M` counts elements in matching blocks. Two
/// empty sequences score 1.0.
pub fn sequence_ratio<T: Eq + Hash>(a: &[T], b: &[T]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matched = BlockMatcher::new(a, b).matched_elements();
    2.0 * matched as f64 / total as f64
}

/// Word-level alignment ratio of two normalized strings, 0-100. Argument
/// order matters for some token multisets.
pub fn word_overlap(query_text: &str, row_text: &str) -> f64 {
    let a = query_text.split_whitespace().collect::<Vec<_>>();
    let b = row_text.split_whitespace().collect::<Vec<_>>();
    sequence_ratio(&a, &b) * 100.0
}

/// Mean of the discrepancy and corrective-action overlaps.
pub fn overlap_score(query: &NormalizedRecord, row: &NormalizedRecord) -> f64 {
    let discrepancy = word_overlap(&query.normalized_discrepancy, &row.normalized_discrepancy);
    let corrective = word_overlap(
        &query.normalized_corrective_action,
        &row.normalized_corrective_action,
    );
    (discrepancy + corrective) / 2.0
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ClusterConfig {
    pub similarity_threshold: u8,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: CLUSTER_SIMILARITY_THRESHOLD,
        }
    }
}

/// Cluster table produced by [`RecordClusterer::cluster`]: clusters in
/// creation order, each with its member keys in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct ClusterAssignment {
    pub clusters: Vec<ClusterMembers>,
    pub key_index: HashMap<String, ClusterId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMembers {
    pub id: ClusterId,
    pub representative: String,
    pub members: Vec<String>,
}

impl ClusterAssignment {
    pub fn cluster_of(&self, key: &str) -> Option<ClusterId> {
        self.key_index.get(key).copied()
    }

    pub fn representative_of(&self, key: &str) -> Option<&str> {
        self.cluster_of(key)
            .map(|id| self.clusters[id.0].representative.as_str())
    }

    pub fn distinct_keys(&self) -> usize {
        self.key_index.len()
    }
}

/// Single forward pass over distinct combined keys. A key joins the first
/// existing representative (in creation order) scoring at or above the
/// threshold, else starts a new cluster. Clusters are never merged or
/// revisited, so results depend on input order and are not transitive.
pub struct RecordClusterer {
    config: ClusterConfig,
}

impl RecordClusterer {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn cluster<'a>(
        &self,
        records: impl IntoIterator<Item = &'a NormalizedRecord>,
    ) -> ClusterAssignment {
        let mut seen = HashSet::new();
        let mut distinct = Vec::new();
        for record in records {
            if record.is_blank() {
                continue;
            }
            if seen.insert(record.combined_key.as_str()) {
                distinct.push(record.combined_key.as_str());
            }
        }

        let mut assignment = ClusterAssignment::default();
        let mut representatives: Vec<TokenSet> = Vec::new();
        for key in distinct {
            let tokens = TokenSet::new(key);
            let joined = representatives
                .iter()
                .position(|rep| token_set_ratio_prepared(&tokens, rep) >= self.config.similarity_threshold);

            let id = match joined {
                Some(idx) => {
                    assignment.clusters[idx].members.push(key.to_string());
                    ClusterId(idx)
                }
                None => {
                    let id = ClusterId(assignment.clusters.len());
                    debug!(cluster = %id, representative = key, "new cluster");
                    assignment.clusters.push(ClusterMembers {
                        id,
                        representative: key.to_string(),
                        members: vec![key.to_string()],
                    });
                    representatives.push(tokens);
                    id
                }
            };
            assignment.key_index.insert(key.to_string(), id);
        }
        assignment
    }
}

// ---------------------------------------------------------------------------
// Cluster statistics
// ---------------------------------------------------------------------------

/// Rounds to 2 decimals, ties to even on the scaled value: 2.125 -> 2.12,
/// 2.375 -> 2.38.
pub fn round_hours(hours: f64) -> f64 {
    (hours * 100.0).round_ties_even() / 100.0
}

/// Mean hours and occurrence count per cluster, indexed by `ClusterId`.
/// Zero-hour records count like any other.
pub fn aggregate_cluster_stats(
    cluster_count: usize,
    assignments: impl IntoIterator<Item = (ClusterId, f64)>,
) -> Vec<ClusterStats> {
    let mut sums = vec![(0.0f64, 0usize); cluster_count];
    for (id, hours) in assignments {
        let slot = &mut sums[id.0];
        slot.0 += hours;
        slot.1 += 1;
    }
    sums.into_iter()
        .map(|(sum, count)| {
            let mean_hours = if count == 0 { 0.0 } else { sum / count as f64 };
            ClusterStats {
                mean_hours,
                occurrence_count: count,
                fair_quote_hours: round_hours(mean_hours),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Table coercion
// ---------------------------------------------------------------------------

struct ColumnMap {
    description: usize,
    corrective_action: usize,
    total_hours: usize,
    year: usize,
    card: usize,
}

impl ColumnMap {
    fn resolve(table: &RawTable) -> Result<Self, EngineError> {
        let missing = REQUIRED_COLUMNS
            .iter()
            .filter(|name| table.column_index(name).is_none())
            .map(|name| name.to_string())
            .collect::<Vec<_>>();

        if !missing.is_empty() {
            let suggestions = missing
                .iter()
                .filter_map(|name| closest_header(table, name))
                .collect();
            return Err(EngineError::Schema {
                missing,
                suggestions,
            });
        }

        let index = |name: &str| table.column_index(name).unwrap_or_default();
        Ok(Self {
            description: index(COL_DESCRIPTION),
            corrective_action: index(COL_CORRECTIVE_ACTION),
            total_hours: index(COL_TOTAL_HOURS),
            year: index(COL_YEAR),
            card: index(COL_CARD),
        })
    }
}

fn closest_header(table: &RawTable, missing: &str) -> Option<ColumnSuggestion> {
    let target = missing.to_lowercase();
    table
        .headers
        .iter()
        .filter(|h| !REQUIRED_COLUMNS.contains(&h.trim()))
        .map(|h| (h, jaro_winkler(&target, &h.trim().to_lowercase())))
        .filter(|(_, score)| *score >= HEADER_SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(h, _)| ColumnSuggestion {
            missing: missing.to_string(),
            found: h.trim().to_string(),
        })
}

fn parse_hours(cell: &CellValue) -> Result<f64, String> {
    let hours = match cell {
        CellValue::Number(n) => *n,
        CellValue::Text(s) if s.trim().is_empty() => return Err("missing value".into()),
        CellValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("{s:?} is not a number"))?,
        CellValue::Empty => return Err("missing value".into()),
        CellValue::Bool(b) => return Err(format!("{b} is not a number")),
    };
    if !hours.is_finite() {
        return Err(format!("{hours} is not a finite number"));
    }
    if hours < 0.0 {
        return Err(format!("{hours} is negative"));
    }
    Ok(hours)
}

fn parse_year(cell: &CellValue, row: usize) -> Option<i32> {
    let parsed = match cell {
        CellValue::Empty => return None,
        CellValue::Number(n) if n.fract() == 0.0 && n.abs() < i32::MAX as f64 => Some(*n as i32),
        CellValue::Text(s) if s.trim().is_empty() => return None,
        CellValue::Text(s) => s.trim().parse::<i32>().ok().or_else(|| {
            s.trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.fract() == 0.0 && n.abs() < i32::MAX as f64)
                .map(|n| n as i32)
        }),
        _ => None,
    };
    if parsed.is_none() {
        warn!(row, value = ?cell, "year is not an integer; leaving it unset");
    }
    parsed
}

/// Converts an uploaded table into records. Missing required columns fail
/// with `EngineError::Schema` before any row is read; a bad `Total Hours`
/// cell rejects the whole table with `EngineError::Data`. Rows with no
/// values at all are skipped.
pub fn records_from_table(table: &RawTable) -> Result<Vec<Record>, EngineError> {
    let columns = ColumnMap::resolve(table)?;
    let mut records = Vec::with_capacity(table.rows.len());

    for (idx, cells) in table.rows.iter().enumerate() {
        // Spreadsheet row number: the header occupies row 1.
        let row = idx + 2;
        if cells.iter().all(CellValue::is_empty) {
            debug!(row, "skipping empty row");
            continue;
        }

        let total_hours = parse_hours(table.cell(idx, columns.total_hours)).map_err(|reason| {
            EngineError::Data {
                row,
                column: COL_TOTAL_HOURS.to_string(),
                reason,
            }
        })?;

        records.push(Record {
            description: table
                .cell(idx, columns.description)
                .as_text()
                .unwrap_or_default(),
            corrective_action: table
                .cell(idx, columns.corrective_action)
                .as_text()
                .unwrap_or_default(),
            total_hours,
            year: parse_year(table.cell(idx, columns.year), row),
            card_number: table
                .cell(idx, columns.card)
                .as_text()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            source_row: Some(row),
        });
    }

    Ok(records)
}

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

/// Immutable, fully clustered history for one upload. Safe to share across
/// threads; matching never mutates it.
#[derive(Debug, Clone)]
pub struct Dataset {
    rows: Vec<DatasetRow>,
    clusters: Vec<Cluster>,
    key_index: HashMap<String, ClusterId>,
    source_name: Option<String>,
    fingerprint: Option<String>,
    built_at: DateTime<Utc>,
}

impl Dataset {
    pub fn build(records: Vec<Record>) -> Result<Self, EngineError> {
        Self::build_with(records, ClusterConfig::default())
    }

    pub fn build_with(records: Vec<Record>, config: ClusterConfig) -> Result<Self, EngineError> {
        let _span = info_span!("build_dataset", records = records.len()).entered();

        for (idx, record) in records.iter().enumerate() {
            if let Err(reason) = parse_hours(&CellValue::Number(record.total_hours)) {
                return Err(EngineError::Data {
                    row: record.source_row.unwrap_or(idx + 2),
                    column: COL_TOTAL_HOURS.to_string(),
                    reason,
                });
            }
        }

        // Phase 1: normalize and collect distinct keys in first-seen order.
        let normalized = records.iter().map(normalize_record).collect::<Vec<_>>();
        let assignment = RecordClusterer::new(config).cluster(normalized.iter());

        // Phase 2: fold rows into the indexed cluster table.
        let row_clusters = normalized
            .iter()
            .map(|n| assignment.cluster_of(&n.combined_key))
            .collect::<Vec<_>>();
        let stats = aggregate_cluster_stats(
            assignment.clusters.len(),
            row_clusters
                .iter()
                .zip(&records)
                .filter_map(|(cluster, record)| cluster.map(|id| (id, record.total_hours))),
        );

        let clusters = assignment
            .clusters
            .into_iter()
            .map(|c| Cluster {
                stats: stats[c.id.0],
                id: c.id,
                representative: c.representative,
                members: c.members,
            })
            .collect::<Vec<_>>();

        let rows = records
            .into_iter()
            .zip(normalized)
            .zip(row_clusters)
            .enumerate()
            .map(|(row_index, ((record, normalized), cluster))| DatasetRow {
                row_index,
                record,
                normalized,
                stats: cluster.map(|id| stats[id.0]),
                cluster,
            })
            .collect::<Vec<_>>();

        let dataset = Self {
            rows,
            clusters,
            key_index: assignment.key_index,
            source_name: None,
            fingerprint: None,
            built_at: Utc::now(),
        };
        let summary = dataset.summary();
        info!(
            rows = summary.rows,
            eligible_rows = summary.eligible_rows,
            distinct_keys = summary.distinct_keys,
            clusters = summary.clusters,
            "dataset built"
        );
        Ok(dataset)
    }

    pub fn with_source(mut self, name: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn rows(&self) -> &[DatasetRow] {
        &self.rows
    }

    pub fn eligible_rows(&self) -> impl Iterator<Item = &DatasetRow> {
        self.rows.iter().filter(|r| r.is_eligible())
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(id.0)
    }

    pub fn cluster_for_key(&self, combined_key: &str) -> Option<&Cluster> {
        self.key_index
            .get(combined_key)
            .and_then(|id| self.cluster(*id))
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            source_name: self.source_name.clone(),
            fingerprint: self.fingerprint.clone(),
            built_at: self.built_at,
            rows: self.rows.len(),
            eligible_rows: self.eligible_rows().count(),
            distinct_keys: self.key_index.len(),
            clusters: self.clusters.len(),
        }
    }

    /// Distinct years present, ascending.
    pub fn years(&self) -> Vec<i32> {
        self.rows
            .iter()
            .filter_map(|r| r.record.year)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn max_hours(&self) -> f64 {
        self.rows
            .iter()
            .map(|r| r.record.total_hours)
            .fold(0.0, f64::max)
    }

    pub fn filtered_rows<'a>(&'a self, filter: &'a RecordFilter) -> impl Iterator<Item = &'a DatasetRow> + 'a {
        self.rows.iter().filter(move |r| filter.accepts(r))
    }
}

/// Builds a dataset from already-typed records.
pub fn build_dataset(records: Vec<Record>) -> Result<Dataset, EngineError> {
    Dataset::build(records)
}

/// Validates the schema, coerces rows and builds the dataset.
pub fn build_dataset_from_table(table: &RawTable) -> Result<Dataset, EngineError> {
    let records = records_from_table(table)?;
    Dataset::build(records)
}

/// Display-only filters over dataset rows; they never influence matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub years: Vec<i32>,
    pub card_contains: Option<String>,
    pub min_hours: Option<f64>,
    pub max_hours: Option<f64>,
}

impl RecordFilter {
    pub fn accepts(&self, row: &DatasetRow) -> bool {
        let record = &row.record;
        if !self.years.is_empty() && !record.year.is_some_and(|y| self.years.contains(&y)) {
            return false;
        }
        if let Some(needle) = self.card_contains.as_deref().filter(|n| !n.is_empty()) {
            let needle = needle.to_lowercase();
            let matches = record
                .card_number
                .as_deref()
                .is_some_and(|card| card.to_lowercase().contains(&needle));
            if !matches {
                return false;
            }
        }
        if self.min_hours.is_some_and(|min| record.total_hours < min) {
            return false;
        }
        if self.max_hours.is_some_and(|max| record.total_hours > max) {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Query matching
// ---------------------------------------------------------------------------

pub fn validate_query(query: &Query) -> Result<(), EngineError> {
    if query.discrepancy.trim().is_empty() {
        return Err(EngineError::InvalidQuery("discrepancy is empty".into()));
    }
    if query.corrective_action.trim().is_empty() {
        return Err(EngineError::InvalidQuery("corrective action is empty".into()));
    }
    if !query.supplier_hours.is_finite() || query.supplier_hours < 0.0 {
        return Err(EngineError::InvalidQuery(format!(
            "supplier hours must be a non-negative number, got {}",
            query.supplier_hours
        )));
    }
    Ok(())
}

/// Tiered matcher over a built dataset: Exact, then Approximate, then
/// Nearest. Later tiers are only computed when earlier ones are empty.
pub struct QueryMatcher<'a> {
    dataset: &'a Dataset,
}

impl<'a> QueryMatcher<'a> {
    pub fn new(dataset: &'a Dataset) -> Self {
        Self { dataset }
    }

    pub fn match_query(&self, query: &Query) -> Result<MatchResult, EngineError> {
        validate_query(query)?;
        let normalized = normalize_pair(&query.discrepancy, &query.corrective_action);
        Ok(self.match_normalized(&normalized))
    }

    pub fn match_normalized(&self, query: &NormalizedRecord) -> MatchResult {
        let eligible = self.dataset.eligible_rows().collect::<Vec<_>>();
        if eligible.is_empty() {
            debug!("no eligible rows");
            return MatchResult::NoData;
        }

        let exact = eligible
            .iter()
            .filter(|row| row.normalized.combined_key == query.combined_key)
            .map(|row| MatchedRow {
                row: (*row).clone(),
                overlap_score: 100.0,
            })
            .collect::<Vec<_>>();
        if !exact.is_empty() {
            debug!(rows = exact.len(), "exact tier");
            return MatchResult::Exact { rows: exact };
        }

        let scored = eligible
            .iter()
            .map(|row| (*row, overlap_score(query, &row.normalized)))
            .collect::<Vec<_>>();

        let mut approximate = scored
            .iter()
            .filter(|(row, score)| {
                *score >= APPROXIMATE_OVERLAP_THRESHOLD && row.normalized.combined_key != query.combined_key
            })
            .collect::<Vec<_>>();
        // Stable: equal scores keep row order.
        approximate.sort_by(|a, b| b.1.total_cmp(&a.1));
        approximate.truncate(APPROXIMATE_LIMIT);
        if !approximate.is_empty() {
            debug!(rows = approximate.len(), best = approximate[0].1, "approximate tier");
            return MatchResult::Approximate {
                rows: approximate
                    .into_iter()
                    .map(|(row, score)| MatchedRow {
                        row: (*row).clone(),
                        overlap_score: *score,
                    })
                    .collect(),
            };
        }

        let nearest = scored
            .iter()
            .filter(|(_, score)| *score < APPROXIMATE_OVERLAP_THRESHOLD)
            .fold(None::<&(&DatasetRow, f64)>, |best, candidate| match best {
                Some(b) if b.1 >= candidate.1 => Some(b),
                _ => Some(candidate),
            });
        match nearest {
            Some((row, score)) => {
                debug!(score, "nearest tier");
                MatchResult::Nearest {
                    row: MatchedRow {
                        row: (*row).clone(),
                        overlap_score: *score,
                    },
                }
            }
            None => MatchResult::NoData,
        }
    }
}

pub fn match_query(dataset: &Dataset, query: &Query) -> Result<MatchResult, EngineError> {
    QueryMatcher::new(dataset).match_query(query)
}

// ---------------------------------------------------------------------------
// Conclusions
// ---------------------------------------------------------------------------

/// `(supplier - fair) / fair * 100`; `None` when the fair quote is zero.
pub fn percent_difference(supplier_hours: f64, fair_quote_hours: f64) -> Option<f64> {
    if fair_quote_hours == 0.0 {
        return None;
    }
    Some((supplier_hours - fair_quote_hours) / fair_quote_hours * 100.0)
}

pub fn verdict(supplier_hours: f64, fair_quote_hours: f64) -> Verdict {
    if fair_quote_hours == 0.0 {
        Verdict::NoHistoricalData
    } else if supplier_hours < fair_quote_hours {
        Verdict::FairApprove
    } else if (supplier_hours - fair_quote_hours).abs()
        <= fair_quote_hours * IN_RANGE_TOLERANCE + TOLERANCE_EPSILON
    {
        Verdict::InRangeConsiderApprove
    } else {
        Verdict::BeyondRangeNeedsReview
    }
}

pub fn conclude(supplier_hours: f64, fair_quote_hours: f64) -> Conclusion {
    let verdict = verdict(supplier_hours, fair_quote_hours);
    Conclusion {
        verdict,
        severity: verdict.severity(),
        supplier_hours,
        fair_quote_hours,
        percent_difference: percent_difference(supplier_hours, fair_quote_hours),
    }
}

/// Matches the query and concludes against the primary matched row's fair
/// quote. `conclusion` is `None` when there is no data to compare with.
pub fn assess_quote(dataset: &Dataset, query: &Query) -> Result<QuoteAssessment, EngineError> {
    let result = match_query(dataset, query)?;
    let conclusion = result
        .primary()
        .and_then(|m| m.row.fair_quote_hours())
        .map(|fair| conclude(query.supplier_hours, fair));
    if let Some(c) = &conclusion {
        info!(
            tier = ?result.tier(),
            verdict = ?c.verdict,
            fair_quote_hours = c.fair_quote_hours,
            supplier_hours = c.supplier_hours,
            "quote assessed"
        );
    }
    Ok(QuoteAssessment {
        query: query.clone(),
        result,
        conclusion,
    })
}

// ---------------------------------------------------------------------------
// Presentation helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightedWord {
    pub word: String,
    pub novel: bool,
}

/// Splits `text` into words, flagging those absent from `reference`.
pub fn highlight_novel_words(text: &str, reference: &str) -> Vec<HighlightedWord> {
    let known = reference.split_whitespace().collect::<HashSet<_>>();
    text.split_whitespace()
        .map(|word| HighlightedWord {
            word: word.to_string(),
            novel: !known.contains(word),
        })
        .collect()
}
