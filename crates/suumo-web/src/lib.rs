//! Axum + Askama read-only dashboard over the snapshot store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use futures::TryStreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use suumo_core::{Category, DateRange, Listing, RunRecord};
use suumo_storage::SnapshotReader;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "suumo-web";

#[derive(Clone)]
pub struct AppState {
    pub reader: SnapshotReader,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(output_dir: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            reader: SnapshotReader::open(output_dir),
            workspace_root: workspace_root.into(),
        }
    }
}

/// A listing pre-formatted for templates.
#[derive(Debug, Clone, Serialize)]
pub struct WebListing {
    pub category: String,
    pub category_label: String,
    pub listing_id: String,
    pub title: String,
    pub address: String,
    pub price_text: String,
    pub area_sqm: String,
    pub area_tsubo: String,
    pub unit_price_per_tsubo: String,
    pub detail_url: String,
    pub observed_at: String,
}

impl From<&Listing> for WebListing {
    fn from(listing: &Listing) -> Self {
        let attrs = &listing.attributes;
        Self {
            category: listing.category.as_str().to_string(),
            category_label: listing.category.label_ja().to_string(),
            listing_id: listing.listing_id.clone(),
            title: attrs.title.clone(),
            address: attrs.address.clone(),
            price_text: attrs.price_text.clone(),
            area_sqm: format_number(attrs.area_sqm, 2),
            area_tsubo: format_number(attrs.area_tsubo, 2),
            unit_price_per_tsubo: format_number(attrs.unit_price_per_tsubo, 0),
            detail_url: attrs.detail_url.clone(),
            observed_at: listing.observed_at.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub observed_at: String,
    pub total_records: u64,
    pub committed_at: String,
    pub content_sha256: String,
}

impl From<&RunRecord> for RunRow {
    fn from(run: &RunRecord) -> Self {
        Self {
            observed_at: run.observed_at.to_string(),
            total_records: run.total_records,
            committed_at: run.committed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            content_sha256: run.content_sha256.chars().take(12).collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct CategoryCountRow {
    label: String,
    count: usize,
}

#[derive(Debug, Deserialize, Default)]
struct ListingsQuery {
    category: Option<String>,
    q: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    last_committed: String,
    latest_count: usize,
    category_counts: Vec<CategoryCountRow>,
    runs: Vec<RunRow>,
}

#[derive(Template)]
#[template(path = "listings.html")]
struct ListingsPageTemplate {
    selected_category: String,
    query: String,
    page: usize,
}

#[derive(Template)]
#[template(path = "listings_table_partial.html")]
struct ListingsTablePartialTemplate {
    listings: Vec<WebListing>,
    page: usize,
    total_pages: usize,
    total: usize,
}

#[derive(Template)]
#[template(path = "listings_facets_partial.html")]
struct ListingsFacetsPartialTemplate {
    category_counts: Vec<FacetCountRow>,
    all_selected: bool,
}

#[derive(Debug, Clone)]
struct FacetCountRow {
    category: String,
    label: String,
    count: usize,
    selected: bool,
}

#[derive(Template)]
#[template(path = "listing_detail.html")]
struct ListingDetailTemplate {
    listing: WebListing,
    price_yen: String,
    unit_price_per_sqm: String,
    details: Vec<(String, String)>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/listings", get(listings_page_handler))
        .route("/listings/table", get(listings_table_handler))
        .route("/listings/facets", get(listings_facets_handler))
        .route("/listings/{category}/{listing_id}", get(listing_detail_handler))
        .route("/history", get(history_page_handler))
        .route("/history/chart", get(history_chart_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, output_dir = %state.reader.layout().root().display(), "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let latest = match state.reader.read_latest_view().await {
        Ok(latest) => latest,
        Err(err) => return server_error(err.into()),
    };
    let runs = match state.reader.list_runs().await {
        Ok(runs) => runs,
        Err(err) => return server_error(err.into()),
    };

    let mut counts = BTreeMap::<Category, usize>::new();
    for listing in &latest {
        *counts.entry(listing.category).or_default() += 1;
    }
    render_html(IndexTemplate {
        last_committed: runs
            .first()
            .map(|r| RunRow::from(r).committed_at)
            .unwrap_or_else(|| "-".into()),
        latest_count: latest.len(),
        category_counts: counts
            .into_iter()
            .map(|(category, count)| CategoryCountRow {
                label: category.label_ja().to_string(),
                count,
            })
            .collect(),
        runs: runs.iter().take(30).map(RunRow::from).collect(),
    })
}

async fn listings_page_handler(Query(query): Query<ListingsQuery>) -> Response {
    render_html(ListingsPageTemplate {
        selected_category: query.category.unwrap_or_default(),
        query: query.q.unwrap_or_default(),
        page: query.page.unwrap_or(1).max(1),
    })
}

async fn listings_table_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Response {
    match state.reader.read_latest_view().await {
        Ok(latest) => {
            let filtered = filter_listings(&latest, &query);
            let total = filtered.len();
            let per_page = query.per_page.unwrap_or(50).max(1);
            let total_pages = total.max(1).div_ceil(per_page);
            let page = query.page.unwrap_or(1).clamp(1, total_pages);
            let listings = filtered
                .into_iter()
                .skip((page - 1) * per_page)
                .take(per_page)
                .map(WebListing::from)
                .collect();

            let mut resp = render_html(ListingsTablePartialTemplate {
                listings,
                page,
                total_pages,
                total,
            });
            resp.headers_mut().insert(
                header::HeaderName::from_static("hx-trigger"),
                header::HeaderValue::from_static("listingsTableLoaded"),
            );
            resp
        }
        Err(err) => server_error(err.into()),
    }
}

async fn listings_facets_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Response {
    match state.reader.read_latest_view().await {
        Ok(latest) => {
            let selected = query.category.clone().unwrap_or_default();
            let mut counts = BTreeMap::<Category, usize>::new();
            for listing in &latest {
                *counts.entry(listing.category).or_default() += 1;
            }
            let category_counts = counts
                .into_iter()
                .map(|(category, count)| FacetCountRow {
                    selected: selected == category.as_str(),
                    category: category.as_str().to_string(),
                    label: category.label_ja().to_string(),
                    count,
                })
                .collect();
            render_html(ListingsFacetsPartialTemplate {
                category_counts,
                all_selected: selected.is_empty(),
            })
        }
        Err(err) => server_error(err.into()),
    }
}

async fn listing_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((category, listing_id)): AxumPath<(String, String)>,
) -> Response {
    let Ok(category) = category.parse::<Category>() else {
        return not_found("Unknown category");
    };
    match state.reader.read_latest_view().await {
        Ok(latest) => {
            let Some(listing) = latest
                .iter()
                .find(|l| l.category == category && l.listing_id == listing_id)
            else {
                return not_found("Listing not found");
            };
            render_html(ListingDetailTemplate {
                listing: WebListing::from(listing),
                price_yen: format_number(listing.attributes.price_yen, 0),
                unit_price_per_sqm: format_number(listing.attributes.unit_price_per_sqm, 0),
                details: listing
                    .attributes
                    .details
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
        }
        Err(err) => server_error(err.into()),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChartSeries {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategoryChart {
    pub category: Category,
    pub label: String,
    /// One series per short address label.
    pub by_address: Vec<ChartSeries>,
    /// Okusawa 3-chome listings, one series per walking time to the station.
    pub by_walk_minutes: Vec<ChartSeries>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryChart {
    pub dates: Vec<NaiveDate>,
    pub categories: Vec<CategoryChart>,
}

async fn history_chart_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_history_chart(&state.reader).await {
        Ok(chart) => Json(chart).into_response(),
        Err(err) => server_error(err),
    }
}

const PLOT_WIDTH: f64 = 640.0;
const PLOT_HEIGHT: f64 = 240.0;
const PALETTE: [&str; 8] = [
    "#0369a1", "#dc2626", "#16a34a", "#9333ea", "#ea580c", "#0891b2", "#ca8a04", "#475569",
];

#[derive(Template)]
#[template(path = "history.html")]
struct HistoryPageTemplate {
    panels: Vec<ChartPanel>,
    width: f64,
    height: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct ChartPanel {
    title: String,
    lines: Vec<PlotLine>,
    y_min: String,
    y_max: String,
    first_date: String,
    last_date: String,
}

#[derive(Debug, Clone, PartialEq)]
struct PlotLine {
    name: String,
    color: &'static str,
    /// SVG `points` attribute; dates without a value are skipped.
    points: String,
}

async fn history_page_handler(State(state): State<Arc<AppState>>) -> Response {
    let chart = match load_history_chart(&state.reader).await {
        Ok(chart) => chart,
        Err(err) => return server_error(err),
    };
    let mut panels = Vec::new();
    for category in &chart.categories {
        panels.push(plot_panel(
            format!("{} 住所別", category.label),
            &category.by_address,
            &chart.dates,
        ));
        panels.push(plot_panel(
            format!("{} 奥沢3丁目 駅徒歩別", category.label),
            &category.by_walk_minutes,
            &chart.dates,
        ));
    }
    render_html(HistoryPageTemplate {
        panels,
        width: PLOT_WIDTH,
        height: PLOT_HEIGHT,
    })
}

/// Scales tsubo prices into the plot box: dates spread evenly left to right,
/// the cheapest value on the bottom edge and the dearest on the top edge.
fn plot_panel(title: String, series: &[ChartSeries], dates: &[NaiveDate]) -> ChartPanel {
    let values = series.iter().flat_map(|s| s.values.iter().flatten().copied());
    let (low, high) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    let (low, high) = match (low.is_finite(), low < high) {
        (false, _) => (0.0, 0.0),
        (true, true) => (low, high),
        (true, false) => (low * 0.9, high * 1.1),
    };

    let x = |index: usize| match dates.len() {
        0 | 1 => PLOT_WIDTH / 2.0,
        n => index as f64 / (n - 1) as f64 * PLOT_WIDTH,
    };
    let y = |value: f64| {
        if high > low {
            PLOT_HEIGHT - (value - low) / (high - low) * PLOT_HEIGHT
        } else {
            PLOT_HEIGHT / 2.0
        }
    };

    let lines = series
        .iter()
        .zip(PALETTE.iter().cycle())
        .map(|(s, color)| PlotLine {
            name: s.name.clone(),
            color: *color,
            points: s
                .values
                .iter()
                .enumerate()
                .filter_map(|(i, v)| v.map(|v| format!("{:.1},{:.1}", x(i), y(v))))
                .collect::<Vec<_>>()
                .join(" "),
        })
        .collect();

    let man_yen = |v: f64| format!("{}万円/坪", format_number(Some(v / 10_000.0), 0));
    ChartPanel {
        title,
        lines,
        y_min: man_yen(low),
        y_max: man_yen(high),
        first_date: dates.first().map(|d| d.to_string()).unwrap_or_default(),
        last_date: dates.last().map(|d| d.to_string()).unwrap_or_default(),
    }
}

type SeriesKey = (Category, String);

#[derive(Default)]
struct Averages {
    sums: BTreeMap<(SeriesKey, NaiveDate), (f64, usize)>,
    names: BTreeMap<Category, BTreeSet<String>>,
}

impl Averages {
    fn add(&mut self, category: Category, name: String, date: NaiveDate, value: f64) {
        self.names.entry(category).or_default().insert(name.clone());
        let slot = self.sums.entry(((category, name), date)).or_default();
        slot.0 += value;
        slot.1 += 1;
    }

    fn series(&self, category: Category, dates: &[NaiveDate]) -> Vec<ChartSeries> {
        let Some(names) = self.names.get(&category) else {
            return Vec::new();
        };
        names
            .iter()
            .map(|name| ChartSeries {
                name: name.clone(),
                values: dates
                    .iter()
                    .map(|date| {
                        self.sums
                            .get(&((category, name.clone()), *date))
                            .map(|(sum, n)| sum / *n as f64)
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Average price per tsubo for each sale category across every committed run.
pub async fn load_history_chart(reader: &SnapshotReader) -> anyhow::Result<HistoryChart> {
    let mut dates = Vec::new();
    let mut by_address = Averages::default();
    let mut by_walk = Averages::default();

    let mut history = std::pin::pin!(reader.read_history(DateRange::all()));
    while let Some(snapshot) = history.try_next().await? {
        dates.push(snapshot.observed_at);
        for listing in &snapshot.listings {
            if !listing.category.is_sale() {
                continue;
            }
            let Some(unit) = listing.attributes.unit_price_per_tsubo else {
                continue;
            };
            by_address.add(
                listing.category,
                short_address_label(&listing.attributes.address),
                snapshot.observed_at,
                unit,
            );
            if is_okusawa_3(&listing.attributes.address) {
                if let Some(minutes) = listing
                    .attributes
                    .details
                    .get("沿線・駅")
                    .and_then(|text| walk_minutes(text.as_str()))
                {
                    by_walk.add(
                        listing.category,
                        format!("徒歩{minutes}分"),
                        snapshot.observed_at,
                        unit,
                    );
                }
            }
        }
    }

    let categories = Category::ALL
        .into_iter()
        .filter(|c| c.is_sale())
        .map(|category| CategoryChart {
            category,
            label: category.label_ja().to_string(),
            by_address: by_address.series(category, &dates),
            by_walk_minutes: by_walk.series(category, &dates),
        })
        .collect();
    Ok(HistoryChart { dates, categories })
}

pub fn short_address_label(address: &str) -> String {
    let trimmed = address.trim();
    trimmed
        .strip_prefix("東京都")
        .unwrap_or(trimmed)
        .to_string()
}

fn is_okusawa_3(address: &str) -> bool {
    static OKUSAWA_3: OnceLock<Regex> = OnceLock::new();
    OKUSAWA_3
        .get_or_init(|| Regex::new(r"奥沢\s*[3三]\s*(丁目|[-−ー])?").expect("valid literal regex"))
        .is_match(address)
}

/// Shortest walk in `徒歩N分` phrases, e.g. `東急目黒線「奥沢」徒歩4分`.
pub fn walk_minutes(text: &str) -> Option<u32> {
    static WALK: OnceLock<Regex> = OnceLock::new();
    WALK.get_or_init(|| Regex::new(r"徒歩\s*(\d+)\s*分").expect("valid literal regex"))
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .min()
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response(),
    }
}

fn filter_listings<'a>(all: &'a [Listing], query: &ListingsQuery) -> Vec<&'a Listing> {
    let category = query
        .category
        .as_deref()
        .filter(|c| !c.is_empty())
        .and_then(|c| c.parse::<Category>().ok());
    let needle = query.q.as_deref().map(str::trim).unwrap_or_default();
    all.iter()
        .filter(|l| category.map_or(true, |c| l.category == c))
        .filter(|l| needle.is_empty() || l.attributes.address.contains(needle))
        .collect()
}

/// Thousands-separated number, or `-` when absent.
fn format_number(value: Option<f64>, decimals: usize) -> String {
    let Some(value) = value else {
        return "-".to_string();
    };
    let formatted = format!("{value:.decimals$}");
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };
    let (sign, digits) = match int_part.strip_prefix('-') {
        Some(d) => ("-", d),
        None => ("", int_part),
    };
    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    match frac_part {
        Some(f) => format!("{sign}{grouped}.{f}"),
        None => format!("{sign}{grouped}"),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Html(message.to_string())).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err:#}")),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use std::path::Path;
    use suumo_core::ListingAttributes;
    use suumo_storage::SnapshotStore;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn listing(category: Category, id: &str, address: &str, unit: f64, date: NaiveDate) -> Listing {
        let mut details = BTreeMap::new();
        details.insert("沿線・駅".to_string(), "東急目黒線「奥沢」徒歩4分".to_string());
        Listing {
            listing_id: id.to_string(),
            category,
            observed_at: date,
            attributes: ListingAttributes {
                title: format!("物件 {id}"),
                address: address.to_string(),
                price_text: "8,480万円".to_string(),
                price_yen: Some(84_800_000.0),
                area_sqm: Some(100.52),
                area_tsubo: Some(30.41),
                unit_price_per_sqm: Some(843_613.0),
                unit_price_per_tsubo: Some(unit),
                details,
                detail_url: format!("https://suumo.jp/tochi/tokyo/sc_setagaya/nc_{id}/"),
            },
        }
    }

    async fn seeded() -> (TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        let day1 = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        store
            .record_snapshot(
                &[
                    listing(Category::Land, "78912345", "東京都世田谷区奥沢3", 2_000_000.0, day1),
                    listing(Category::Land, "78912346", "東京都世田谷区奥沢3", 3_000_000.0, day1),
                ],
                day1,
            )
            .await
            .unwrap();
        store
            .record_snapshot(
                &[
                    listing(Category::Land, "78912345", "東京都世田谷区奥沢3", 2_100_000.0, day2),
                    listing(Category::Rental, "100012345678", "東京都世田谷区奥沢5", 0.0, day2),
                ],
                day2,
            )
            .await
            .unwrap();
        let router = app(AppState::new(dir.path(), workspace_root()));
        (dir, router)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn index_without_any_run_renders_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let (status, text) = get(app(AppState::new(dir.path(), workspace_root())), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("奥沢駅 SUUMOダッシュボード"));
        assert!(text.contains("データがありません"));
    }

    #[tokio::test]
    async fn index_shows_latest_counts() {
        let (_dir, app) = seeded().await;
        let (status, text) = get(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("2026-03-02"));
        assert!(text.contains("土地"));
    }

    #[tokio::test]
    async fn table_partial_filters_by_category() {
        let (_dir, app) = seeded().await;
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/listings/table?category=land")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["hx-trigger"], "listingsTableLoaded");
        let text = String::from_utf8(resp.into_body().collect().await.unwrap().to_bytes().to_vec()).unwrap();
        assert!(text.contains("78912345"));
        assert!(!text.contains("100012345678"));

        let (_, facets) = get(app, "/listings/facets?category=land").await;
        assert!(facets.contains("賃貸"));
    }

    #[tokio::test]
    async fn detail_page_and_missing_listing() {
        let (_dir, app) = seeded().await;
        let (status, text) = get(app.clone(), "/listings/land/78912345").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("徒歩4分"));

        let (status, _) = get(app.clone(), "/listings/land/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(app, "/listings/castle/1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn history_chart_averages_per_date() {
        let (_dir, app) = seeded().await;
        let resp = app
            .oneshot(axum::http::Request::builder().uri("/history/chart").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let chart: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(chart["dates"], serde_json::json!(["2026-03-01", "2026-03-02"]));
        let categories = chart["categories"].as_array().unwrap();
        assert_eq!(categories.len(), 3);
        let land = categories.iter().find(|c| c["category"] == "land").unwrap();
        assert_eq!(land["by_address"][0]["name"], "世田谷区奥沢3");
        assert_eq!(land["by_address"][0]["values"], serde_json::json!([2_500_000.0, 2_100_000.0]));
        assert_eq!(land["by_walk_minutes"][0]["name"], "徒歩4分");
    }

    #[tokio::test]
    async fn history_page_plots_each_sale_category() {
        let (_dir, app) = seeded().await;
        let (status, text) = get(app, "/history").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("土地 住所別"));
        assert!(text.contains("土地 奥沢3丁目 駅徒歩別"));
        assert!(text.contains("<polyline"));
        assert!(text.contains("世田谷区奥沢3"));
        assert!(text.contains("250万円/坪"));
    }

    #[test]
    fn plot_panel_scales_into_the_box() {
        let dates = [
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 3).unwrap(),
        ];
        let series = [ChartSeries {
            name: "世田谷区奥沢3".to_string(),
            values: vec![Some(3_000_000.0), None, Some(2_000_000.0)],
        }];
        let panel = plot_panel("土地".to_string(), &series, &dates);
        assert_eq!(panel.lines[0].points, "0.0,0.0 640.0,240.0");
        assert_eq!(panel.y_max, "300万円/坪");
        assert_eq!(panel.y_min, "200万円/坪");
        assert_eq!(panel.last_date, "2026-03-03");

        let empty = plot_panel("新築".to_string(), &[], &dates);
        assert!(empty.lines.is_empty());
    }

    #[tokio::test]
    async fn stylesheet_is_served() {
        let (_dir, app) = seeded().await;
        let (status, text) = get(app, "/assets/static/app.css").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("body"));
    }

    #[test]
    fn helpers() {
        assert_eq!(format_number(Some(84_800_000.0), 0), "84,800,000");
        assert_eq!(format_number(Some(100.52), 2), "100.52");
        assert_eq!(format_number(None, 0), "-");
        assert_eq!(walk_minutes("東急目黒線「奥沢」徒歩4分 / 東急大井町線「九品仏」徒歩9分"), Some(4));
        assert_eq!(short_address_label("東京都世田谷区奥沢3"), "世田谷区奥沢3");
    }
}
