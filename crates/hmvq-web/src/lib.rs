//! Axum + Askama front-end for the HMV quote checker.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use hmvq_adapters::{format_for_content_type, format_for_path, load_table, read_table, TableFormat};
use hmvq_core::{EngineError, MatchResult, MatchTier, QuoteAssessment};
use hmvq_engine::{
    assess_quote, build_dataset_from_table, highlight_novel_words, normalize_pair, Dataset,
    HighlightedWord, RecordFilter,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "hmvq-web";

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

const NO_DATASET: &str = "no maintenance history loaded; upload a workbook first";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebConfig {
    pub port: u16,
    pub bind_addr: String,
    /// Workbook or JSON rows loaded before the listener starts.
    pub data_path: Option<PathBuf>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            data_path: None,
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: lookup("HMVQ_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            bind_addr: lookup("HMVQ_BIND_ADDR")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.bind_addr),
            data_path: lookup("HMVQ_DATA_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

/// Shared server state. The dataset is replaced wholesale on every upload;
/// readers keep whichever `Arc` they cloned.
pub struct AppState {
    pub config: WebConfig,
    dataset: RwLock<Option<Arc<Dataset>>>,
}

impl AppState {
    pub fn new(config: WebConfig) -> Self {
        Self {
            config,
            dataset: RwLock::new(None),
        }
    }

    pub fn with_dataset(config: WebConfig, dataset: Dataset) -> Self {
        Self {
            config,
            dataset: RwLock::new(Some(Arc::new(dataset))),
        }
    }

    pub async fn current_dataset(&self) -> Option<Arc<Dataset>> {
        self.dataset.read().await.clone()
    }

    pub async fn replace_dataset(&self, dataset: Dataset) {
        *self.dataset.write().await = Some(Arc::new(dataset));
    }
}

/// Reads a table from disk and builds a fully clustered dataset from it.
pub fn load_dataset(path: &Path) -> anyhow::Result<Dataset> {
    let loaded = load_table(path).with_context(|| format!("loading {}", path.display()))?;
    let dataset = build_dataset_from_table(&loaded.table)
        .with_context(|| format!("building dataset from {}", loaded.source_name))?;
    Ok(dataset.with_source(loaded.source_name, loaded.sha256))
}

fn dataset_from_bytes(name: &str, bytes: &[u8], format: TableFormat) -> anyhow::Result<Dataset> {
    let loaded = read_table(name, bytes, format)?;
    let dataset = build_dataset_from_table(&loaded.table)?;
    Ok(dataset.with_source(loaded.source_name, loaded.sha256))
}

#[derive(Debug, Clone, Default)]
struct SummaryView {
    source_name: String,
    fingerprint: String,
    built_at: String,
    rows: usize,
    eligible_rows: usize,
    distinct_keys: usize,
    clusters: usize,
    years: String,
    max_hours: String,
}

impl SummaryView {
    fn from_dataset(dataset: &Dataset) -> Self {
        let summary = dataset.summary();
        Self {
            source_name: summary.source_name.unwrap_or_else(|| "unnamed upload".into()),
            fingerprint: summary
                .fingerprint
                .map(|f| f.chars().take(12).collect())
                .unwrap_or_default(),
            built_at: summary.built_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            rows: summary.rows,
            eligible_rows: summary.eligible_rows,
            distinct_keys: summary.distinct_keys,
            clusters: summary.clusters,
            years: join_years(&dataset.years()),
            max_hours: format!("{:.2}", dataset.max_hours()),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    loaded: bool,
    summary: SummaryView,
}

#[derive(Debug, Clone)]
struct MatchedRowView {
    row_number: usize,
    description: String,
    corrective_action: String,
    total_hours: String,
    fair_quote_hours: String,
    occurrences: usize,
    overlap: String,
    year: String,
    card: String,
    description_words: Vec<HighlightedWord>,
    corrective_action_words: Vec<HighlightedWord>,
}

#[derive(Template)]
#[template(path = "quote_result.html")]
struct QuoteResultTemplate {
    tier_label: String,
    has_conclusion: bool,
    verdict_label: String,
    severity_class: String,
    supplier_hours: String,
    fair_quote_hours: String,
    percent_difference: String,
    show_novel_words: bool,
    rows: Vec<MatchedRowView>,
    message: String,
}

#[derive(Debug, Clone)]
struct RecordRowView {
    row_number: usize,
    description: String,
    corrective_action: String,
    total_hours: String,
    year: String,
    card: String,
    cluster: String,
    fair_quote_hours: String,
}

#[derive(Template)]
#[template(path = "records.html")]
struct RecordsTemplate {
    loaded: bool,
    rows: Vec<RecordRowView>,
    total: usize,
    page: usize,
    total_pages: usize,
    prev_href: String,
    next_href: String,
    years_available: String,
    max_hours_available: String,
    filter_years: String,
    filter_card: String,
    filter_min_hours: String,
    filter_max_hours: String,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    message: String,
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuoteForm {
    discrepancy: String,
    corrective_action: String,
    supplier_hours: String,
}

/// Display filters for `/records`. Hour bounds arrive as text so an empty
/// form field means "unbounded" rather than a rejected request.
#[derive(Debug, Serialize, Deserialize, Default)]
struct RecordsQuery {
    years: Option<String>,
    card: Option<String>,
    min_hours: Option<String>,
    max_hours: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterView {
    pub id: String,
    pub representative: String,
    pub members: Vec<String>,
    pub occurrence_count: usize,
    pub mean_hours: f64,
    pub fair_quote_hours: f64,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/upload", post(upload_handler))
        .route("/quote", post(quote_form_handler))
        .route("/api/quote", post(quote_api_handler))
        .route("/records", get(records_handler))
        .route("/clusters", get(clusters_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let state = AppState::new(config.clone());
    if let Some(path) = config.data_path.clone() {
        let dataset = tokio::task::spawn_blocking(move || load_dataset(&path))
            .await
            .context("dataset loader panicked")??;
        state.replace_dataset(dataset).await;
    }

    let listener = TcpListener::bind((config.bind_addr.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.bind_addr, config.port))?;
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "hmvq web listening");
    axum::serve(listener, app(Arc::new(state))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let dataset = state.current_dataset().await;
    render_html(IndexTemplate {
        loaded: dataset.is_some(),
        summary: dataset
            .as_deref()
            .map(SummaryView::from_dataset)
            .unwrap_or_default(),
    })
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let name = params
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "upload".to_string());
    let format = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(format_for_content_type)
        .or_else(|| format_for_path(&name));
    let Some(format) = format else {
        return json_error(
            StatusCode::BAD_REQUEST,
            format!("cannot tell the table format of {name:?}; send a workbook or JSON rows"),
        );
    };
    if body.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "empty upload".to_string());
    }

    let built = tokio::task::spawn_blocking(move || dataset_from_bytes(&name, &body, format)).await;
    match built {
        Ok(Ok(dataset)) => {
            let summary = dataset.summary();
            state.replace_dataset(dataset).await;
            Json(summary).into_response()
        }
        Ok(Err(err)) => {
            warn!(error = %err, "upload rejected");
            json_error(StatusCode::BAD_REQUEST, format!("{err:#}"))
        }
        Err(err) => server_error(anyhow::anyhow!("dataset build task failed: {err}")),
    }
}

async fn quote_form_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<QuoteForm>,
) -> Response {
    let Ok(supplier_hours) = form.supplier_hours.trim().parse::<f64>() else {
        return html_error(
            StatusCode::BAD_REQUEST,
            format!("supplier hours {:?} is not a number", form.supplier_hours),
        );
    };
    let Some(dataset) = state.current_dataset().await else {
        return html_error(StatusCode::CONFLICT, NO_DATASET.to_string());
    };
    let query = hmvq_core::Query {
        discrepancy: form.discrepancy,
        corrective_action: form.corrective_action,
        supplier_hours,
    };
    match assess_quote(&dataset, &query) {
        Ok(assessment) => render_html(quote_view(&assessment)),
        Err(err) => html_error(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

async fn quote_api_handler(
    State(state): State<Arc<AppState>>,
    Json(query): Json<hmvq_core::Query>,
) -> Response {
    let Some(dataset) = state.current_dataset().await else {
        return json_error(StatusCode::CONFLICT, NO_DATASET.to_string());
    };
    match assess_quote(&dataset, &query) {
        Ok(assessment) => Json(assessment).into_response(),
        Err(err @ EngineError::InvalidQuery(_)) => json_error(StatusCode::BAD_REQUEST, err.to_string()),
        Err(err) => server_error(err.into()),
    }
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let Some(dataset) = state.current_dataset().await else {
        return render_html(RecordsTemplate {
            loaded: false,
            rows: vec![],
            total: 0,
            page: 1,
            total_pages: 1,
            prev_href: String::new(),
            next_href: String::new(),
            years_available: String::new(),
            max_hours_available: String::new(),
            filter_years: String::new(),
            filter_card: String::new(),
            filter_min_hours: String::new(),
            filter_max_hours: String::new(),
        });
    };
    render_html(records_view(&dataset, &query))
}

async fn clusters_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.current_dataset().await {
        Some(dataset) => Json(cluster_listing(&dataset)).into_response(),
        None => json_error(StatusCode::CONFLICT, NO_DATASET.to_string()),
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Clusters by descending occurrence count; equal counts keep id order.
pub fn cluster_listing(dataset: &Dataset) -> Vec<ClusterView> {
    let mut clusters = dataset
        .clusters()
        .iter()
        .map(|c| ClusterView {
            id: c.id.to_string(),
            representative: c.representative.clone(),
            members: c.members.clone(),
            occurrence_count: c.stats.occurrence_count,
            mean_hours: c.stats.mean_hours,
            fair_quote_hours: c.stats.fair_quote_hours,
        })
        .collect::<Vec<_>>();
    clusters.sort_by(|a, b| b.occurrence_count.cmp(&a.occurrence_count));
    clusters
}

fn quote_view(assessment: &QuoteAssessment) -> QuoteResultTemplate {
    let query = normalize_pair(
        &assessment.query.discrepancy,
        &assessment.query.corrective_action,
    );
    let show_novel_words = matches!(assessment.result, MatchResult::Approximate { .. });

    let rows = assessment
        .result
        .rows()
        .iter()
        .map(|m| {
            let row = &m.row;
            // Each field is compared only with the same field of the query.
            let (description_words, corrective_action_words) = if show_novel_words {
                (
                    highlight_novel_words(
                        &row.normalized.normalized_discrepancy,
                        &query.normalized_discrepancy,
                    ),
                    highlight_novel_words(
                        &row.normalized.normalized_corrective_action,
                        &query.normalized_corrective_action,
                    ),
                )
            } else {
                (vec![], vec![])
            };
            MatchedRowView {
                row_number: row.source_row(),
                description: row.record.description.clone(),
                corrective_action: row.record.corrective_action.clone(),
                total_hours: format!("{:.2}", row.record.total_hours),
                fair_quote_hours: row
                    .fair_quote_hours()
                    .map(|h| format!("{h:.2}"))
                    .unwrap_or_default(),
                occurrences: row.occurrence_count().unwrap_or_default(),
                overlap: format!("{:.1}", m.overlap_score),
                year: row.record.year.map(|y| y.to_string()).unwrap_or_default(),
                card: row.record.card_number.clone().unwrap_or_default(),
                description_words,
                corrective_action_words,
            }
        })
        .collect();

    let tier_label = assessment
        .result
        .tier()
        .map(MatchTier::label)
        .unwrap_or("No Data")
        .to_string();

    match &assessment.conclusion {
        Some(c) => QuoteResultTemplate {
            tier_label,
            has_conclusion: true,
            verdict_label: c.verdict.label().to_string(),
            severity_class: c.severity.css_class().to_string(),
            supplier_hours: format!("{:.2}", c.supplier_hours),
            fair_quote_hours: format!("{:.2}", c.fair_quote_hours),
            percent_difference: c
                .percent_difference
                .map(|p| format!("{p:+.1}%"))
                .unwrap_or_else(|| "N/A".into()),
            show_novel_words,
            rows,
            message: String::new(),
        },
        None => QuoteResultTemplate {
            tier_label,
            has_conclusion: false,
            verdict_label: String::new(),
            severity_class: String::new(),
            supplier_hours: format!("{:.2}", assessment.query.supplier_hours),
            fair_quote_hours: String::new(),
            percent_difference: "N/A".into(),
            show_novel_words,
            rows,
            message: "No eligible historical records to compare against.".into(),
        },
    }
}

fn records_view(dataset: &Dataset, query: &RecordsQuery) -> RecordsTemplate {
    let filter = RecordFilter {
        years: parse_years(query.years.as_deref().unwrap_or_default()),
        card_contains: query
            .card
            .as_ref()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()),
        min_hours: parse_hours_bound(query.min_hours.as_deref()),
        max_hours: parse_hours_bound(query.max_hours.as_deref()),
    };

    let filtered = dataset.filtered_rows(&filter).collect::<Vec<_>>();
    let per_page = query.per_page.unwrap_or(50).max(1);
    let total_pages = filtered.len().max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;

    let rows = filtered
        .iter()
        .skip(start)
        .take(per_page)
        .map(|row| RecordRowView {
            row_number: row.source_row(),
            description: row.record.description.clone(),
            corrective_action: row.record.corrective_action.clone(),
            total_hours: format!("{:.2}", row.record.total_hours),
            year: row.record.year.map(|y| y.to_string()).unwrap_or_default(),
            card: row.record.card_number.clone().unwrap_or_default(),
            cluster: row.cluster.map(|c| c.to_string()).unwrap_or_default(),
            fair_quote_hours: row
                .fair_quote_hours()
                .map(|h| format!("{h:.2}"))
                .unwrap_or_default(),
        })
        .collect();

    let filter_years = join_years(&filter.years);
    let filter_card = filter.card_contains.clone().unwrap_or_default();
    let filter_min_hours = filter.min_hours.map(|h| h.to_string()).unwrap_or_default();
    let filter_max_hours = filter.max_hours.map(|h| h.to_string()).unwrap_or_default();
    let page_href = |target: usize| {
        let non_empty = |v: &String| Some(v.clone()).filter(|v| !v.is_empty());
        let link = RecordsQuery {
            years: non_empty(&filter_years),
            card: non_empty(&filter_card),
            min_hours: non_empty(&filter_min_hours),
            max_hours: non_empty(&filter_max_hours),
            page: Some(target),
            per_page: Some(per_page),
        };
        format!("/records?{}", serde_urlencoded::to_string(&link).unwrap_or_default())
    };

    let prev_href = if page > 1 { page_href(page - 1) } else { String::new() };
    let next_href = if page < total_pages { page_href(page + 1) } else { String::new() };

    RecordsTemplate {
        loaded: true,
        total: filtered.len(),
        prev_href,
        next_href,
        rows,
        page,
        total_pages,
        years_available: join_years(&dataset.years()),
        max_hours_available: format!("{:.2}", dataset.max_hours()),
        filter_years,
        filter_card,
        filter_min_hours,
        filter_max_hours,
    }
}

/// Comma or whitespace separated years; unparseable entries are ignored.
fn parse_years(raw: &str) -> Vec<i32> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|y| y.trim().parse().ok())
        .collect()
}

fn parse_hours_bound(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|h| h.is_finite())
}

fn join_years(years: &[i32]) -> String {
    years
        .iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn html_error(status: StatusCode, message: String) -> Response {
    match (ErrorTemplate { message }).render() {
        Ok(html) => (status, Html(html)).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
