//! Daily scrape pipeline: fetch every enabled category, normalize, record one snapshot.

pub mod config;
pub mod normalize;
pub mod report;
pub mod schedule;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate, Utc};
use serde::Serialize;
use suumo_adapters::{
    adapter_for_category, load_fixture_pages, AdapterContext, AdapterError, FetchedPage,
    ListingTarget, SourceAdapter,
};
use suumo_core::{Category, Listing, ListingDraft};
use suumo_storage::{HttpFetcher, PageArchive, SnapshotReader, SnapshotStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{CategoryConfig, CategoryRegistry, ConfigError, SyncConfig};
pub use normalize::{AreaFilter, NormalizeReport, Normalizer};
pub use report::{report_daily_markdown, SnapshotDiff};
pub use schedule::{Registration, ScheduleEntry, ScheduleFailure, ScheduleRegistry};

pub const CRATE_NAME: &str = "suumo-sync";

#[derive(Debug, Error)]
pub enum RunError {
    #[error("fetch failed for {category}: {source}")]
    Fetch {
        category: Category,
        #[source]
        source: AdapterError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a run gets its drafts from.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_drafts(
        &self,
        run_id: Uuid,
        category: &CategoryConfig,
    ) -> Result<Vec<ListingDraft>, AdapterError>;
}

fn parse_pages(
    adapter: &dyn SourceAdapter,
    pages: &[FetchedPage],
) -> Result<Vec<ListingDraft>, AdapterError> {
    let mut drafts = Vec::new();
    for page in pages {
        if !adapter.has_cards(page)? {
            debug!(url = %page.url, "no listing cards; skipping page");
            continue;
        }
        drafts.extend(adapter.parse_listing(page)?);
    }
    Ok(drafts)
}

/// Live SUUMO crawl, optionally archiving every fetched page.
pub struct SuumoSource {
    http: HttpFetcher,
    archive: Option<PageArchive>,
}

impl SuumoSource {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config.http_client_config())?,
            archive: config.artifacts_dir.clone().map(PageArchive::new),
        })
    }
}

#[async_trait]
impl ListingSource for SuumoSource {
    async fn fetch_drafts(
        &self,
        run_id: Uuid,
        category: &CategoryConfig,
    ) -> Result<Vec<ListingDraft>, AdapterError> {
        let adapter = adapter_for_category(category.category);
        let ctx = AdapterContext {
            run_id,
            fetched_at: Utc::now(),
        };
        let target = ListingTarget {
            url: category.seed_url.clone(),
            max_pages: category.max_pages,
        };
        let pages = adapter.fetch_listing(&self.http, &ctx, &target).await?;

        if let Some(archive) = &self.archive {
            for page in &pages {
                if let Err(err) = archive
                    .archive(category.category, page.fetched_at, &page.body)
                    .await
                {
                    warn!(url = %page.url, error = %format!("{err:#}"), "failed to archive page");
                }
            }
        }
        parse_pages(adapter.as_ref(), &pages)
    }
}

/// Offline source reading `fixtures/<category>/*.html`.
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ListingSource for FixtureSource {
    async fn fetch_drafts(
        &self,
        _run_id: Uuid,
        category: &CategoryConfig,
    ) -> Result<Vec<ListingDraft>, AdapterError> {
        let pages = load_fixture_pages(&self.root, category.category, &category.seed_url)?;
        let adapter = adapter_for_category(category.category);
        parse_pages(adapter.as_ref(), &pages)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub observed_at: NaiveDate,
    pub categories: BTreeMap<Category, usize>,
    pub drafts: usize,
    pub listings: usize,
    pub filtered_out: usize,
    pub duplicates_collapsed: usize,
    pub content_sha256: String,
    pub history_file: PathBuf,
    pub report_dir: Option<PathBuf>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: CategoryRegistry,
    normalizer: Normalizer,
    source: Box<dyn ListingSource>,
}

impl SyncPipeline {
    /// Loads `categories.yaml` from the workspace root and crawls SUUMO live.
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let registry = CategoryRegistry::load_or_default(&config.categories_path()).await?;
        let source = SuumoSource::new(&config)?;
        Self::from_parts(config, registry, Box::new(source))
    }

    pub fn from_parts(
        config: SyncConfig,
        registry: CategoryRegistry,
        source: Box<dyn ListingSource>,
    ) -> Result<Self> {
        let area = AreaFilter::new(registry.area_filter.as_deref())
            .context("compiling area_filter from the category registry")?;
        Ok(Self {
            config,
            registry,
            normalizer: Normalizer::new(area),
            source,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One run for today's local date.
    pub async fn run_once(&self) -> Result<SyncRunSummary, RunError> {
        self.run_once_on(Local::now().date_naive()).await
    }

    pub async fn run_once_on(&self, observed_at: NaiveDate) -> Result<SyncRunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %observed_at);
        self.run(run_id, observed_at).instrument(span).await
    }

    async fn run(&self, fetch_id: Uuid, observed_at: NaiveDate) -> Result<SyncRunSummary, RunError> {
        // Skip the crawl when the date is already committed.
        let reader = SnapshotReader::open(&self.config.output_dir);
        if reader.read_snapshot(observed_at).await?.is_some() {
            return Err(StoreError::AlreadyRecorded(observed_at).into());
        }

        let mut drafts = Vec::new();
        for category in self.registry.enabled() {
            let fetched = self
                .source
                .fetch_drafts(fetch_id, category)
                .await
                .map_err(|source| RunError::Fetch {
                    category: category.category,
                    source,
                })?;
            info!(category = category.category.as_str(), drafts = fetched.len(), "fetched category");
            drafts.extend(fetched);
        }

        let normalized = self.normalizer.normalize(drafts, observed_at);
        let report = normalized.report;
        info!(
            drafts = report.drafts,
            filtered_out = report.filtered_out,
            duplicates_collapsed = report.duplicates_collapsed,
            listings = report.listings,
            "normalized drafts"
        );

        let store = SnapshotStore::open(&self.config.output_dir)
            .await?
            .with_lock_ttl(self.config.lock_ttl());
        let previous = previous_snapshot(&store, observed_at).await?;
        let record = store
            .record_snapshot(&normalized.listings, observed_at)
            .await?;

        let report_dir = match report::write_run_reports(
            &self.config.reports_dir(),
            &record,
            &previous,
            &normalized.listings,
        )
        .await
        {
            Ok(dir) => Some(dir),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "run reports failed; snapshot stays committed");
                None
            }
        };

        let mut categories = BTreeMap::new();
        for listing in &normalized.listings {
            *categories.entry(listing.category).or_default() += 1;
        }

        Ok(SyncRunSummary {
            run_id: record.run_id,
            observed_at,
            categories,
            drafts: report.drafts,
            listings: report.listings,
            filtered_out: report.filtered_out,
            duplicates_collapsed: report.duplicates_collapsed,
            content_sha256: record.content_sha256,
            history_file: store.layout().history_path(observed_at),
            report_dir,
        })
    }
}

/// Listings of the newest committed snapshot strictly before `date`.
async fn previous_snapshot(store: &SnapshotStore, date: NaiveDate) -> Result<Vec<Listing>, StoreError> {
    let runs = store.list_runs().await?;
    let Some(previous) = runs.iter().find(|run| run.observed_at < date) else {
        return Ok(Vec::new());
    };
    Ok(store
        .read_snapshot(previous.observed_at)
        .await?
        .map(|snapshot| snapshot.listings)
        .unwrap_or_default())
}

/// Builds a pipeline from the environment and runs it once.
pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env().context("reading SUUMO_* configuration")?;
    let pipeline = SyncPipeline::new(config).await?;
    Ok(pipeline.run_once().await?)
}
