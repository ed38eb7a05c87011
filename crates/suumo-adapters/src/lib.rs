//! SUUMO category adapters: list-page crawling and card parsing.

pub mod units;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use suumo_core::{Category, ListingDraft};
use suumo_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub use units::{
    extract_area_sqm, extract_area_tsubo, extract_price_yen, normalize_text, parse_jpy_amount,
    unit_price,
};

pub const CRATE_NAME: &str = "suumo-adapters";
pub const SUUMO_BASE_URL: &str = "https://suumo.jp";
pub const DEFAULT_MAX_PAGES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn html(url: impl Into<String>, body: impl Into<Vec<u8>>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            content_type: "text/html".to_string(),
            body: body.into(),
            fetched_at,
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Seed page of a category plus the crawl budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
    pub max_pages: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{0}`")]
    Selector(String),
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn category(&self) -> Category;

    /// Selector of one listing card; pages without a match carry no listings.
    fn card_selector(&self) -> &'static str;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &ListingTarget,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        crawl_listing_pages(http, ctx, self.category(), target).await
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<ListingDraft>, AdapterError>;

    fn has_cards(&self, page: &FetchedPage) -> Result<bool, AdapterError> {
        let document = Html::parse_document(&page.text());
        let cards = selector(self.card_selector())?;
        let found = document.select(&cards).next().is_some();
        Ok(found)
    }
}

/// Default seed URL for the Okusawa station (`ek_06660`) pages of a category.
pub fn default_seed_url(category: Category) -> &'static str {
    match category {
        Category::Rental => "https://suumo.jp/chintai/tokyo/ek_06660/",
        Category::NewHouse => "https://suumo.jp/ikkodate/tokyo/ek_06660/",
        Category::UsedHouse => "https://suumo.jp/chukoikkodate/tokyo/ek_06660/",
        Category::Land => "https://suumo.jp/tochi/tokyo/ek_06660/",
    }
}

struct RentAdapter;

struct SaleAdapter {
    category: Category,
}

pub fn adapter_for_category(category: Category) -> Box<dyn SourceAdapter> {
    match category {
        Category::Rental => Box::new(RentAdapter),
        sale => Box::new(SaleAdapter { category: sale }),
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector(format!("{css}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> String {
    normalize_text(&element.text().collect::<Vec<_>>().join(" "))
}

fn first_text(element: ElementRef<'_>, sel: &Selector) -> String {
    element.select(sel).next().map(element_text).unwrap_or_default()
}

fn first_href(element: ElementRef<'_>, sel: &Selector, base: &Url) -> Option<String> {
    element
        .select(sel)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| !href.trim().is_empty())
        .and_then(|href| base.join(href.trim()).ok())
        .map(String::from)
}

fn page_base(page: &FetchedPage) -> Result<Url, AdapterError> {
    Url::parse(&page.url)
        .or_else(|_| Url::parse(SUUMO_BASE_URL))
        .map_err(|source| AdapterError::InvalidUrl {
            url: page.url.clone(),
            source,
        })
}

fn capture_id(pattern: &'static OnceLock<Regex>, regex: &str, url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    let re = pattern.get_or_init(|| Regex::new(regex).expect("valid literal regex"));
    match re.captures(url) {
        Some(caps) => Some(caps[1].to_string()),
        None => Some(url.to_string()),
    }
}

fn insert_detail(details: &mut BTreeMap<String, String>, key: &str, value: &str) {
    if !value.is_empty() && value != "-" {
        details.insert(key.to_string(), value.to_string());
    }
}

impl SourceAdapter for RentAdapter {
    fn category(&self) -> Category {
        Category::Rental
    }

    fn card_selector(&self) -> &'static str {
        "div.cassetteitem"
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<ListingDraft>, AdapterError> {
        static ROOM_CODE: OnceLock<Regex> = OnceLock::new();

        let base = page_base(page)?;
        let document = Html::parse_document(&page.text());
        let cards = selector(self.card_selector())?;
        let title_sel = selector(".cassetteitem_content-title")?;
        let address_sel = selector("li.cassetteitem_detail-col1")?;
        let building_link = selector("a[href*='/chintai/jnc_']")?;
        let rows_sel = selector("table.cassetteitem_other tr.js-cassette_link")?;
        let cell_sel = selector("td")?;
        let room_link = selector("a[href*='bc=']")?;

        let mut drafts = Vec::new();
        for card in document.select(&cards) {
            let title = first_text(card, &title_sel);
            let address = first_text(card, &address_sel);
            let building_url = first_href(card, &building_link, &base).unwrap_or_default();

            for row in card.select(&rows_sel) {
                let cells: Vec<String> = row.select(&cell_sel).map(element_text).collect();
                if cells.len() < 4 {
                    continue;
                }
                // Wide rows lead with a checkbox and a thumbnail cell.
                let offset = if cells.len() >= 6 { 2 } else { 0 };
                let floor = &cells[offset];
                let rent_and_fee = &cells[offset + 1];
                let deposit_key = &cells[offset + 2];
                let layout_area = &cells[offset + 3];

                let price_text =
                    units::first_amount_token(rent_and_fee).unwrap_or_else(|| rent_and_fee.clone());
                let room_url = first_href(row, &room_link, &base).unwrap_or_else(|| building_url.clone());

                let mut details = BTreeMap::new();
                insert_detail(&mut details, "階", floor);
                insert_detail(&mut details, "賃料・管理費", rent_and_fee);
                insert_detail(&mut details, "敷金/礼金", deposit_key);
                insert_detail(&mut details, "間取り/専有面積", layout_area);

                drafts.push(ListingDraft {
                    category: Category::Rental,
                    listing_id: capture_id(&ROOM_CODE, r"bc=(\d+)", &room_url),
                    title: title.clone(),
                    address: address.clone(),
                    price_yen: extract_price_yen(&price_text),
                    price_text,
                    area_text: None,
                    details,
                    detail_url: (!room_url.is_empty()).then_some(room_url),
                    source_url: page.url.clone(),
                    fetched_at: page.fetched_at,
                });
            }
        }
        Ok(drafts)
    }
}

impl SourceAdapter for SaleAdapter {
    fn category(&self) -> Category {
        self.category
    }

    fn card_selector(&self) -> &'static str {
        "div.property_unit"
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<ListingDraft>, AdapterError> {
        static NC_CODE: OnceLock<Regex> = OnceLock::new();

        let base = page_base(page)?;
        let document = Html::parse_document(&page.text());
        let cards = selector(self.card_selector())?;
        let dl_sel = selector("dl")?;
        let dt_sel = selector("dt")?;
        let dd_sel = selector("dd")?;
        let detail_link = selector("a[href*='nc_']")?;

        let mut drafts = Vec::new();
        for card in document.select(&cards) {
            let mut details = BTreeMap::new();
            for dl in card.select(&dl_sel) {
                let (Some(dt), Some(dd)) = (dl.select(&dt_sel).next(), dl.select(&dd_sel).next())
                else {
                    continue;
                };
                let key = element_text(dt);
                if !key.is_empty() {
                    details.insert(key, element_text(dd));
                }
            }

            let field = |key: &str| details.get(key).cloned().unwrap_or_default();
            let title = field("物件名");
            let address = field("所在地");
            let price_text = field("販売価格");
            let area_text = ["土地面積", "建物面積", "専有面積"]
                .iter()
                .map(|key| field(key))
                .find(|text| !text.is_empty());
            let detail_url = first_href(card, &detail_link, &base).unwrap_or_default();

            drafts.push(ListingDraft {
                category: self.category,
                listing_id: capture_id(&NC_CODE, r"/nc_(\d+)/", &detail_url),
                title,
                address,
                price_yen: extract_price_yen(&price_text),
                price_text,
                area_text,
                details,
                detail_url: (!detail_url.is_empty()).then_some(detail_url),
                source_url: page.url.clone(),
                fetched_at: page.fetched_at,
            });
        }
        Ok(drafts)
    }
}

/// Breadth-first crawl from the seed page.
///
/// Follows only links on the seed's host whose path starts with the seed path,
/// stops after `max_pages` fetched pages and returns them sorted by URL.
pub async fn crawl_listing_pages(
    http: &HttpFetcher,
    ctx: &AdapterContext,
    category: Category,
    target: &ListingTarget,
) -> Result<Vec<FetchedPage>, AdapterError> {
    let seed = Url::parse(&target.url).map_err(|source| AdapterError::InvalidUrl {
        url: target.url.clone(),
        source,
    })?;

    let mut queue = VecDeque::from([String::from(seed.clone())]);
    let mut seen: HashSet<String> = queue.iter().cloned().collect();
    let mut pages = Vec::new();

    while let Some(url) = queue.pop_front() {
        if pages.len() >= target.max_pages {
            break;
        }
        let response = http
            .fetch_bytes(ctx.run_id, category, &url)
            .await
            .map_err(|source| AdapterError::Fetch {
                url: url.clone(),
                source,
            })?;

        for link in listing_links(&response.body, &seed, &url) {
            if seen.insert(link.clone()) {
                queue.push_back(link);
            }
        }
        pages.push(FetchedPage::html(url, response.body, Utc::now()));
    }

    pages.sort_by(|a, b| a.url.cmp(&b.url));
    debug!(category = category.as_str(), pages = pages.len(), "crawled listing pages");
    Ok(pages)
}

/// Links on `body` that stay within the seed's listing path.
pub fn listing_links(body: &[u8], seed: &Url, page_url: &str) -> Vec<String> {
    let Ok(anchors) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut base = Url::parse(page_url).unwrap_or_else(|_| seed.clone());
    base.set_fragment(None);
    let document = Html::parse_document(&String::from_utf8_lossy(body));

    let mut links = Vec::new();
    for href in document.select(&anchors).filter_map(|a| a.value().attr("href")) {
        let Ok(mut next) = base.join(href.trim()) else {
            continue;
        };
        next.set_fragment(None);
        if next == base
            || next.host_str() != seed.host_str()
            || !next.path().starts_with(seed.path())
        {
            continue;
        }
        let next = String::from(next);
        if !links.contains(&next) {
            links.push(next);
        }
    }
    links
}

/// Loads `fixtures/<category>/*.html` in file-name order as pages of the category's seed URL.
pub fn load_fixture_pages(
    fixtures_root: impl AsRef<Path>,
    category: Category,
    seed_url: &str,
) -> Result<Vec<FetchedPage>> {
    let dir = fixtures_root.as_ref().join(category.as_str());
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("listing {}", dir.display()))?
            .path();
        if path.extension().and_then(|e| e.to_str()) == Some("html") {
            files.push(path);
        }
    }
    files.sort();

    let fetched_at = Utc::now();
    files
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let body = fs::read(path).with_context(|| format!("reading fixture {}", path.display()))?;
            let url = if index == 0 {
                seed_url.to_string()
            } else {
                format!("{seed_url}?page={}", index + 1)
            };
            Ok(FetchedPage::html(url, body, fetched_at))
        })
        .collect()
}
