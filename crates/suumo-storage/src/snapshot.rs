//! Snapshot Store: dated history files, the latest view and the cumulative database.
//!
//! One snapshot is written as:
//! 1. stage the history and latest CSVs under `.pending/<date>/`;
//! 2. insert every listing row plus the `runs` row in one SQLite transaction
//!    (the commit point);
//! 3. rename the staged files into `history/` and `listings_latest.csv`.
//!
//! Readers only trust committed `runs` rows and renamed files, so an abandoned
//! write is never observable. [`SnapshotStore::open`] rolls leftover staging
//! forward (run committed) or back (run not committed).

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, Stream};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use suumo_core::{Category, DateRange, Listing, RunRecord, Snapshot};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::lock::{self, LockError, DEFAULT_LOCK_TTL};
use crate::tabular::{self, ListingRow};
use crate::{sha256_hex, write_synced};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const DATE_FORMAT: &str = "%Y-%m-%d";
const STAGED_HISTORY: &str = "history.csv";
const STAGED_LATEST: &str = "latest.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    Open,
    Lock,
    Stage,
    Commit,
    Publish,
    Recover,
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteStage::Open => "open",
            WriteStage::Lock => "lock",
            WriteStage::Stage => "stage",
            WriteStage::Commit => "commit",
            WriteStage::Publish => "publish",
            WriteStage::Recover => "recover",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write failure during {stage}: {source}")]
    Write {
        stage: WriteStage,
        #[source]
        source: BoxError,
    },
    #[error("snapshot for {0} is already recorded")]
    AlreadyRecorded(NaiveDate),
    #[error("snapshot rejected: {0}")]
    InvalidSnapshot(String),
    #[error("snapshot store is locked by {holder} since {acquired_at}")]
    Locked {
        holder: String,
        acquired_at: DateTime<Utc>,
    },
    #[error("read failure: {source}")]
    Read {
        #[source]
        source: BoxError,
    },
}

impl From<LockError> for StoreError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held {
                holder,
                acquired_at,
            } => StoreError::Locked {
                holder,
                acquired_at,
            },
            other => StoreError::Write {
                stage: WriteStage::Lock,
                source: Box::new(other),
            },
        }
    }
}

fn write_err<E: Into<BoxError>>(stage: WriteStage) -> impl FnOnce(E) -> StoreError {
    move |err| StoreError::Write {
        stage,
        source: err.into(),
    }
}

fn read_err<E: Into<BoxError>>(err: E) -> StoreError {
    StoreError::Read { source: err.into() }
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(text: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map_err(|e| read_err(format!("invalid date `{text}`: {e}")))
}

/// File layout of one output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn latest_path(&self) -> PathBuf {
        self.root.join("listings_latest.csv")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    pub fn history_file_name(date: NaiveDate) -> String {
        format!("listings_{}.csv", date.format("%Y%m%d"))
    }

    pub fn history_path(&self, date: NaiveDate) -> PathBuf {
        self.history_dir().join(Self::history_file_name(date))
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("suumo.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".snapshot.lock")
    }

    pub fn pending_root(&self) -> PathBuf {
        self.root.join(".pending")
    }

    pub fn pending_dir(&self, date: NaiveDate) -> PathBuf {
        self.pending_root().join(date.format("%Y%m%d").to_string())
    }

    fn parse_pending_name(name: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(name, "%Y%m%d").ok()
    }
}

/// Read-only access to committed snapshots. Never writes, migrates or recovers.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    layout: StoreLayout,
    pool: Arc<OnceCell<SqlitePool>>,
}

enum HistoryCursor {
    Start,
    Remaining(VecDeque<NaiveDate>),
    Done,
}

impl SnapshotReader {
    /// Opens lazily: a database created after this call is picked up on first read.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: StoreLayout::new(root),
            pool: Arc::new(OnceCell::new()),
        }
    }

    fn with_pool(layout: StoreLayout, pool: SqlitePool) -> Self {
        Self {
            layout,
            pool: Arc::new(OnceCell::new_with(Some(pool))),
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    async fn pool(&self) -> Result<Option<&SqlitePool>, StoreError> {
        if let Some(pool) = self.pool.get() {
            return Ok(Some(pool));
        }
        let db_path = self.layout.database_path();
        if !fs::try_exists(&db_path).await.map_err(read_err)? {
            return Ok(None);
        }
        let pool = self
            .pool
            .get_or_try_init(|| async {
                let options = SqliteConnectOptions::new()
                    .filename(&db_path)
                    .read_only(true)
                    .busy_timeout(Duration::from_secs(5));
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await
            })
            .await
            .map_err(read_err)?;
        Ok(Some(pool))
    }

    /// Listings of the most recent committed snapshot, in recorded order.
    pub async fn read_latest(&self) -> Result<Vec<Listing>, StoreError> {
        let Some(pool) = self.pool().await? else {
            return Ok(Vec::new());
        };
        match latest_committed(pool).await.map_err(read_err)? {
            Some(date) => load_listings(pool, date).await,
            None => Ok(Vec::new()),
        }
    }

    /// Lazily yields committed snapshots within `range`, oldest first.
    ///
    /// The committed dates are resolved on first poll; each snapshot is loaded
    /// when it is polled. Polling a fresh stream again yields the same sequence
    /// as long as no new snapshot was committed in between.
    pub fn read_history(
        &self,
        range: DateRange,
    ) -> impl Stream<Item = Result<Snapshot, StoreError>> + Send + '_ {
        stream::unfold(HistoryCursor::Start, move |cursor| async move {
            let mut dates = match cursor {
                HistoryCursor::Done => return None,
                HistoryCursor::Start => match self.committed_dates(range).await {
                    Ok(dates) => VecDeque::from(dates),
                    Err(err) => return Some((Err(err), HistoryCursor::Done)),
                },
                HistoryCursor::Remaining(dates) => dates,
            };
            let date = dates.pop_front()?;
            match self.load_snapshot(date).await {
                Ok(snapshot) => Some((Ok(snapshot), HistoryCursor::Remaining(dates))),
                Err(err) => Some((Err(err), HistoryCursor::Done)),
            }
        })
    }

    pub async fn read_snapshot(&self, date: NaiveDate) -> Result<Option<Snapshot>, StoreError> {
        let Some(pool) = self.pool().await? else {
            return Ok(None);
        };
        if !is_committed(pool, date).await.map_err(read_err)? {
            return Ok(None);
        }
        self.load_snapshot(date).await.map(Some)
    }

    /// Commit records, newest first.
    pub async fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let Some(pool) = self.pool().await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT observed_at, run_id, total_records, content_sha256, committed_at
              FROM runs
             ORDER BY observed_at DESC
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(read_err)?;
        rows.iter().map(run_from_row).collect()
    }

    /// Parses `listings_latest.csv`, the file the dashboard reads.
    pub async fn read_latest_view(&self) -> Result<Vec<Listing>, StoreError> {
        let path = self.layout.latest_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(read_err(err)),
        };
        tabular::decode_listings(&bytes).map_err(read_err)
    }

    async fn committed_dates(&self, range: DateRange) -> Result<Vec<NaiveDate>, StoreError> {
        let Some(pool) = self.pool().await? else {
            return Ok(Vec::new());
        };
        let raw: Vec<String> =
            sqlx::query_scalar("SELECT observed_at FROM runs ORDER BY observed_at ASC")
                .fetch_all(pool)
                .await
                .map_err(read_err)?;
        let mut dates = Vec::with_capacity(raw.len());
        for text in raw {
            let date = parse_date(&text)?;
            if range.contains(date) {
                dates.push(date);
            }
        }
        Ok(dates)
    }

    async fn load_snapshot(&self, date: NaiveDate) -> Result<Snapshot, StoreError> {
        let Some(pool) = self.pool().await? else {
            return Err(read_err(format!("no database for snapshot {date}")));
        };
        Ok(Snapshot {
            observed_at: date,
            listings: load_listings(pool, date).await?,
        })
    }
}

async fn latest_committed(pool: &SqlitePool) -> Result<Option<NaiveDate>, sqlx::Error> {
    let latest: Option<String> = sqlx::query_scalar("SELECT MAX(observed_at) FROM runs")
        .fetch_one(pool)
        .await?;
    Ok(latest.and_then(|text| NaiveDate::parse_from_str(&text, DATE_FORMAT).ok()))
}

async fn is_committed(pool: &SqlitePool, date: NaiveDate) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM runs WHERE observed_at = ?")
        .bind(format_date(date))
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

async fn load_listings(pool: &SqlitePool, date: NaiveDate) -> Result<Vec<Listing>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT observed_at, category, sub_category, listing_id, title, address,
               price_text, price_yen, area_sqm, area_tsubo,
               unit_price_per_sqm, unit_price_per_tsubo, detail_text, detail_url
          FROM listings
         WHERE observed_at = ?
         ORDER BY position
        "#,
    )
    .bind(format_date(date))
    .fetch_all(pool)
    .await
    .map_err(read_err)?;
    rows.iter().map(listing_from_row).collect()
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(read_err)
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing, StoreError> {
    let category: String = column(row, "category")?;
    let observed_at: String = column(row, "observed_at")?;
    let listing_row = ListingRow {
        observed_at: parse_date(&observed_at)?,
        category: Category::from_str(&category).map_err(read_err)?,
        sub_category: column(row, "sub_category")?,
        listing_id: column(row, "listing_id")?,
        title: column(row, "title")?,
        address: column(row, "address")?,
        price_text: column(row, "price_text")?,
        price_yen: column(row, "price_yen")?,
        area_sqm: column(row, "area_sqm")?,
        area_tsubo: column(row, "area_tsubo")?,
        unit_price_per_sqm: column(row, "unit_price_per_sqm")?,
        unit_price_per_tsubo: column(row, "unit_price_per_tsubo")?,
        detail_text: column(row, "detail_text")?,
        detail_url: column(row, "detail_url")?,
    };
    Ok(listing_row.into_listing())
}

fn run_from_row(row: &SqliteRow) -> Result<RunRecord, StoreError> {
    let observed_at: String = column(row, "observed_at")?;
    let run_id: String = column(row, "run_id")?;
    let total_records: i64 = column(row, "total_records")?;
    let committed_at: String = column(row, "committed_at")?;
    Ok(RunRecord {
        observed_at: parse_date(&observed_at)?,
        run_id: Uuid::parse_str(&run_id).map_err(read_err)?,
        total_records: u64::try_from(total_records).map_err(read_err)?,
        content_sha256: column(row, "content_sha256")?,
        committed_at: DateTime::parse_from_rfc3339(&committed_at)
            .map_err(read_err)?
            .with_timezone(&Utc),
    })
}

/// Writable store. One instance per output directory and process.
#[derive(Debug)]
pub struct SnapshotStore {
    reader: SnapshotReader,
    pool: SqlitePool,
    write_gate: Mutex<()>,
    lock_ttl: Duration,
    #[cfg(test)]
    fault: std::sync::Mutex<Option<WriteStage>>,
}

impl SnapshotStore {
    /// Creates the directory layout, applies migrations and recovers interrupted writes.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        fs::create_dir_all(layout.history_dir())
            .await
            .map_err(write_err(WriteStage::Open))?;

        let options = SqliteConnectOptions::new()
            .filename(layout.database_path())
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(write_err(WriteStage::Open))?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(write_err(WriteStage::Open))?;

        let store = Self {
            reader: SnapshotReader::with_pool(layout, pool.clone()),
            pool,
            write_gate: Mutex::new(()),
            lock_ttl: DEFAULT_LOCK_TTL,
            #[cfg(test)]
            fault: std::sync::Mutex::new(None),
        };
        store.recover().await?;
        Ok(store)
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        self.reader.layout()
    }

    pub fn reader(&self) -> &SnapshotReader {
        &self.reader
    }

    pub async fn read_latest(&self) -> Result<Vec<Listing>, StoreError> {
        self.reader.read_latest().await
    }

    pub fn read_history(
        &self,
        range: DateRange,
    ) -> impl Stream<Item = Result<Snapshot, StoreError>> + Send + '_ {
        self.reader.read_history(range)
    }

    pub async fn read_snapshot(&self, date: NaiveDate) -> Result<Option<Snapshot>, StoreError> {
        self.reader.read_snapshot(date).await
    }

    pub async fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        self.reader.list_runs().await
    }

    /// Persist one run as the snapshot for `date`.
    ///
    /// `listings` must already be unique per (category, listing_id) and observed
    /// on `date`. Either the history entry, the database rows and the latest
    /// view are all updated, or none of them is.
    pub async fn record_snapshot(
        &self,
        listings: &[Listing],
        date: NaiveDate,
    ) -> Result<RunRecord, StoreError> {
        validate_snapshot(listings, date)?;
        let span = info_span!("record_snapshot", %date, listings = listings.len());
        self.record_locked(listings, date).instrument(span).await
    }

    async fn record_locked(
        &self,
        listings: &[Listing],
        date: NaiveDate,
    ) -> Result<RunRecord, StoreError> {
        let _gate = self.write_gate.lock().await;
        let _lock = lock::acquire(&self.layout().lock_path(), self.lock_ttl, "record_snapshot")?;

        if is_committed(&self.pool, date)
            .await
            .map_err(write_err(WriteStage::Lock))?
        {
            return Err(StoreError::AlreadyRecorded(date));
        }

        let bytes = tabular::encode_listings(listings).map_err(write_err(WriteStage::Stage))?;
        let record = RunRecord {
            observed_at: date,
            run_id: Uuid::new_v4(),
            total_records: listings.len() as u64,
            content_sha256: sha256_hex(&bytes),
            committed_at: Utc::now(),
        };
        let pending = self.layout().pending_dir(date);

        if let Err(err) = self.stage(&pending, &bytes).await {
            discard_dir(&pending).await;
            return Err(err);
        }
        if let Err(err) = self.commit(listings, &record).await {
            discard_dir(&pending).await;
            return Err(err);
        }
        // An older date fills a gap in history but must not replace the latest view.
        let is_newest = match latest_committed(&self.pool).await {
            Ok(latest) => latest == Some(date),
            Err(err) => {
                self.compensate(date).await;
                return Err(write_err(WriteStage::Publish)(err));
            }
        };
        if let Err(err) = self.publish(date, is_newest, PublishMode::Fresh).await {
            self.compensate(date).await;
            return Err(err);
        }

        info!(
            run_id = %record.run_id,
            records = record.total_records,
            sha256 = %record.content_sha256,
            "snapshot committed"
        );
        Ok(record)
    }

    async fn stage(&self, pending: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        discard_dir(pending).await;
        fs::create_dir_all(pending)
            .await
            .map_err(write_err(WriteStage::Stage))?;
        write_synced(&pending.join(STAGED_HISTORY), bytes)
            .await
            .map_err(write_err(WriteStage::Stage))?;
        self.checkpoint(WriteStage::Stage)?;
        write_synced(&pending.join(STAGED_LATEST), bytes)
            .await
            .map_err(write_err(WriteStage::Stage))?;
        Ok(())
    }

    async fn commit(&self, listings: &[Listing], record: &RunRecord) -> Result<(), StoreError> {
        let date = format_date(record.observed_at);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(write_err(WriteStage::Commit))?;

        // Rows left behind by a rolled-back run on this date are not part of any snapshot.
        sqlx::query("DELETE FROM listings WHERE observed_at = ?")
            .bind(&date)
            .execute(&mut *tx)
            .await
            .map_err(write_err(WriteStage::Commit))?;

        for (position, listing) in listings.iter().enumerate() {
            let row = ListingRow::from_listing(listing).map_err(write_err(WriteStage::Commit))?;
            insert_listing(&mut tx, position as i64, &row)
                .await
                .map_err(write_err(WriteStage::Commit))?;
        }

        sqlx::query(
            r#"
            INSERT INTO runs (observed_at, run_id, total_records, content_sha256, committed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&date)
        .bind(record.run_id.to_string())
        .bind(record.total_records as i64)
        .bind(&record.content_sha256)
        .bind(record.committed_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(write_err(WriteStage::Commit))?;

        self.checkpoint(WriteStage::Commit)?;
        tx.commit().await.map_err(write_err(WriteStage::Commit))?;
        Ok(())
    }

    /// Moves staged files into place. History first, then the latest view.
    async fn publish(
        &self,
        date: NaiveDate,
        update_latest: bool,
        mode: PublishMode,
    ) -> Result<(), StoreError> {
        let layout = self.layout();
        let pending = layout.pending_dir(date);

        let staged_history = pending.join(STAGED_HISTORY);
        if staged_file_present(&staged_history, mode).await? {
            fs::rename(&staged_history, layout.history_path(date))
                .await
                .map_err(write_err(WriteStage::Publish))?;
        }
        self.checkpoint(WriteStage::Publish)?;

        let staged_latest = pending.join(STAGED_LATEST);
        if update_latest && staged_file_present(&staged_latest, mode).await? {
            fs::rename(&staged_latest, layout.latest_path())
                .await
                .map_err(write_err(WriteStage::Publish))?;
        }

        // The snapshot is fully visible here; leftover staging is swept on next open.
        discard_dir(&pending).await;
        Ok(())
    }

    /// Undo a committed run whose files could not be published.
    async fn compensate(&self, date: NaiveDate) {
        match delete_run(&self.pool, date).await {
            Ok(()) => {
                let history = self.layout().history_path(date);
                if let Err(err) = fs::remove_file(&history).await {
                    if err.kind() != ErrorKind::NotFound {
                        warn!(path = %history.display(), error = %err, "failed to remove unpublished history file");
                    }
                }
                discard_dir(&self.layout().pending_dir(date)).await;
                warn!(%date, "publish failed; snapshot rolled back");
            }
            Err(err) => {
                warn!(
                    %date,
                    error = %err,
                    "publish failed and rollback failed; snapshot will be rolled forward on next open"
                );
            }
        }
    }

    async fn recover(&self) -> Result<(), StoreError> {
        let pending_root = self.layout().pending_root();
        if !fs::try_exists(&pending_root)
            .await
            .map_err(write_err(WriteStage::Recover))?
        {
            return Ok(());
        }

        // Staging owned by a live writer is not ours to sweep.
        let _lock = match lock::acquire(&self.layout().lock_path(), self.lock_ttl, "recover") {
            Ok(guard) => guard,
            Err(LockError::Held { holder, .. }) => {
                info!(%holder, "snapshot store is being written; skipping recovery");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let latest = latest_committed(&self.pool)
            .await
            .map_err(write_err(WriteStage::Recover))?;
        let mut entries = fs::read_dir(&pending_root)
            .await
            .map_err(write_err(WriteStage::Recover))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(write_err(WriteStage::Recover))?
        {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let committed = match StoreLayout::parse_pending_name(&name) {
                Some(date) => is_committed(&self.pool, date)
                    .await
                    .map_err(write_err(WriteStage::Recover))?
                    .then_some(date),
                None => None,
            };
            match committed {
                Some(date) => {
                    info!(%date, "rolling committed snapshot forward");
                    self.publish(date, latest == Some(date), PublishMode::RollForward)
                        .await?;
                }
                None => {
                    info!(path = %path.display(), "discarding uncommitted staging");
                    discard_dir(&path).await;
                }
            }
        }
        Ok(())
    }

    fn checkpoint(&self, stage: WriteStage) -> Result<(), StoreError> {
        #[cfg(test)]
        {
            let mut fault = self.fault.lock().unwrap_or_else(|e| e.into_inner());
            if *fault == Some(stage) {
                *fault = None;
                return Err(StoreError::Write {
                    stage,
                    source: "injected fault".into(),
                });
            }
        }
        let _ = stage;
        Ok(())
    }

    #[cfg(test)]
    fn inject_fault(&self, stage: WriteStage) {
        *self.fault.lock().unwrap() = Some(stage);
    }
}

/// How `publish` treats a staged file that is not there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishMode {
    /// Right after staging: every staged file must exist.
    Fresh,
    /// Recovery: an earlier attempt may already have moved some files.
    RollForward,
}

async fn staged_file_present(path: &Path, mode: PublishMode) -> Result<bool, StoreError> {
    let present = fs::try_exists(path)
        .await
        .map_err(write_err(WriteStage::Publish))?;
    if !present && mode == PublishMode::Fresh {
        return Err(StoreError::Write {
            stage: WriteStage::Publish,
            source: format!("staged file {} disappeared before publish", path.display()).into(),
        });
    }
    Ok(present)
}

fn validate_snapshot(listings: &[Listing], date: NaiveDate) -> Result<(), StoreError> {
    let mut seen = HashSet::with_capacity(listings.len());
    for listing in listings {
        if listing.listing_id.trim().is_empty() {
            return Err(StoreError::InvalidSnapshot(format!(
                "{} listing without an id",
                listing.category
            )));
        }
        if listing.observed_at != date {
            return Err(StoreError::InvalidSnapshot(format!(
                "listing {} observed on {} but snapshot date is {date}",
                listing.key(),
                listing.observed_at
            )));
        }
        if !seen.insert(listing.key()) {
            return Err(StoreError::InvalidSnapshot(format!(
                "duplicate listing {}",
                listing.key()
            )));
        }
    }
    Ok(())
}

async fn insert_listing(
    tx: &mut Transaction<'_, Sqlite>,
    position: i64,
    row: &ListingRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO listings (
            observed_at, position, category, sub_category, listing_id, title, address,
            price_text, price_yen, area_sqm, area_tsubo,
            unit_price_per_sqm, unit_price_per_tsubo, detail_text, detail_url
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(format_date(row.observed_at))
    .bind(position)
    .bind(row.category.as_str())
    .bind(&row.sub_category)
    .bind(&row.listing_id)
    .bind(&row.title)
    .bind(&row.address)
    .bind(&row.price_text)
    .bind(row.price_yen)
    .bind(row.area_sqm)
    .bind(row.area_tsubo)
    .bind(row.unit_price_per_sqm)
    .bind(row.unit_price_per_tsubo)
    .bind(&row.detail_text)
    .bind(&row.detail_url)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn delete_run(pool: &SqlitePool, date: NaiveDate) -> Result<(), sqlx::Error> {
    let date = format_date(date);
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM listings WHERE observed_at = ?")
        .bind(&date)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM runs WHERE observed_at = ?")
        .bind(&date)
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}

async fn discard_dir(path: &Path) {
    match fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove staging directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use suumo_core::ListingAttributes;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn rental(id: &str, price: f64, date: NaiveDate) -> Listing {
        Listing {
            listing_id: id.to_string(),
            category: Category::Rental,
            observed_at: date,
            attributes: ListingAttributes {
                title: format!("奥沢ハイツ {id}"),
                address: "東京都世田谷区奥沢3".into(),
                price_text: format!("{}万円", price / 10_000.0),
                price_yen: Some(price),
                detail_url: format!("https://suumo.jp/chintai/bc_{id}/"),
                ..Default::default()
            },
        }
    }

    async fn history(store: &SnapshotStore) -> Vec<Snapshot> {
        store
            .read_history(DateRange::all())
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn empty_store_reads_nothing() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        assert!(store.read_latest().await.unwrap().is_empty());
        assert!(history(&store).await.is_empty());
        assert!(store.list_runs().await.unwrap().is_empty());

        let reader = SnapshotReader::open(dir.path().join("never-written"));
        assert!(reader.read_latest().await.unwrap().is_empty());
        assert!(reader.read_latest_view().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_equals_recorded_input() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        let mut listings = vec![rental("300", 98_000.0, day(1)), rental("100", 120_000.0, day(1))];
        listings.push(Listing {
            category: Category::Land,
            ..rental("100", 84_800_000.0, day(1))
        });

        let record = store.record_snapshot(&listings, day(1)).await.unwrap();

        assert_eq!(record.total_records, 3);
        assert_eq!(store.read_latest().await.unwrap(), listings);
        assert_eq!(store.reader().read_latest_view().await.unwrap(), listings);
        let history_bytes = std::fs::read(store.layout().history_path(day(1))).unwrap();
        assert_eq!(sha256_hex(&history_bytes), record.content_sha256);
        assert!(!store.layout().pending_dir(day(1)).exists());
        assert!(!store.layout().lock_path().exists());
    }

    #[tokio::test]
    async fn two_day_scenario_keeps_day_one_intact() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();

        let day1 = vec![rental("A", 1000.0, day(1)), rental("B", 2000.0, day(1))];
        store.record_snapshot(&day1, day(1)).await.unwrap();
        assert_eq!(store.read_latest().await.unwrap(), day1);
        assert_eq!(history(&store).await.len(), 1);
        let day1_file = std::fs::read(store.layout().history_path(day(1))).unwrap();

        let day2 = vec![rental("B", 1900.0, day(2)), rental("C", 3000.0, day(2))];
        store.record_snapshot(&day2, day(2)).await.unwrap();

        let latest = store.read_latest().await.unwrap();
        let ids: Vec<_> = latest.iter().map(|l| l.listing_id.as_str()).collect();
        assert_eq!(ids, vec!["B", "C"]);

        let snapshots = history(&store).await;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].observed_at, day(1));
        assert_eq!(snapshots[1].observed_at, day(2));
        let a = snapshots[0].find(Category::Rental, "A").unwrap();
        assert_eq!(a.attributes.price_yen, Some(1000.0));
        assert_eq!(snapshots[0].listings, day1);
        assert_eq!(
            std::fs::read(store.layout().history_path(day(1))).unwrap(),
            day1_file
        );
    }

    #[tokio::test]
    async fn backfilled_older_date_keeps_the_newest_latest_view() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        let newer = vec![rental("NEW", 2000.0, day(5))];
        let older = vec![rental("OLD", 1000.0, day(1))];

        store.record_snapshot(&newer, day(5)).await.unwrap();
        store.record_snapshot(&older, day(1)).await.unwrap();

        assert_eq!(store.read_latest().await.unwrap(), newer);
        assert_eq!(store.reader().read_latest_view().await.unwrap(), newer);
        assert!(store.layout().history_path(day(1)).exists());
        assert!(!store.layout().pending_dir(day(1)).exists());
        let dates: Vec<_> = history(&store).await.iter().map(|s| s.observed_at).collect();
        assert_eq!(dates, vec![day(1), day(5)]);
    }

    #[tokio::test]
    async fn history_is_chronological_restartable_and_ranged() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        for d in [1, 2, 3] {
            store
                .record_snapshot(&[rental("A", 1000.0 * d as f64, day(d))], day(d))
                .await
                .unwrap();
        }

        let first = history(&store).await;
        let second = history(&store).await;
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|s| s.observed_at).collect::<Vec<_>>(),
            vec![day(1), day(2), day(3)]
        );

        let ranged = store
            .read_history(DateRange::between(day(2), day(3)))
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(ranged.len(), 2);
        assert_eq!(ranged[0].observed_at, day(2));

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].observed_at, day(3));
    }

    #[tokio::test]
    async fn same_day_is_never_overwritten() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        store
            .record_snapshot(&[rental("A", 1000.0, day(1))], day(1))
            .await
            .unwrap();

        let err = store
            .record_snapshot(&[rental("A", 5.0, day(1))], day(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyRecorded(d) if d == day(1)));
        assert_eq!(
            store.read_latest().await.unwrap()[0].attributes.price_yen,
            Some(1000.0)
        );
    }

    #[tokio::test]
    async fn concurrent_writers_are_serialized() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        let a = [rental("A", 1000.0, day(1))];
        let b = [rental("B", 2000.0, day(1))];

        let (first, second) = tokio::join!(
            store.record_snapshot(&a, day(1)),
            store.record_snapshot(&b, day(1))
        );

        let oks = [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(oks, 1);
        assert_eq!(store.read_latest().await.unwrap().len(), 1);
        assert_eq!(history(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn input_must_be_deduplicated_and_dated() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();

        let dupes = [rental("A", 1000.0, day(1)), rental("A", 1100.0, day(1))];
        let err = store.record_snapshot(&dupes, day(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidSnapshot(_)));

        let misdated = [rental("A", 1000.0, day(2))];
        let err = store.record_snapshot(&misdated, day(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidSnapshot(_)));
        assert!(store.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn interrupted_write_leaves_previous_state() {
        for stage in [WriteStage::Stage, WriteStage::Commit, WriteStage::Publish] {
            let dir = tempdir().unwrap();
            let store = SnapshotStore::open(dir.path()).await.unwrap();
            let day1 = vec![rental("A", 1000.0, day(1))];
            store.record_snapshot(&day1, day(1)).await.unwrap();
            let latest_file = std::fs::read(store.layout().latest_path()).unwrap();

            store.inject_fault(stage);
            let day2 = vec![rental("B", 2000.0, day(2))];
            let err = store.record_snapshot(&day2, day(2)).await.unwrap_err();
            assert!(
                matches!(err, StoreError::Write { stage: s, .. } if s == stage),
                "unexpected error for {stage}: {err}"
            );

            assert_eq!(store.read_latest().await.unwrap(), day1, "latest after {stage}");
            let snapshots = history(&store).await;
            assert_eq!(snapshots.len(), 1, "history after {stage}");
            assert_eq!(std::fs::read(store.layout().latest_path()).unwrap(), latest_file);
            assert!(!store.layout().history_path(day(2)).exists());
            assert!(!store.layout().pending_dir(day(2)).exists());

            store.record_snapshot(&day2, day(2)).await.unwrap();
            assert_eq!(store.read_latest().await.unwrap(), day2);
        }
    }

    #[tokio::test]
    async fn reopen_rolls_committed_staging_forward_and_discards_the_rest() {
        let dir = tempdir().unwrap();
        let day2 = vec![rental("B", 2000.0, day(2))];
        {
            let store = SnapshotStore::open(dir.path()).await.unwrap();
            store
                .record_snapshot(&[rental("A", 1000.0, day(1))], day(1))
                .await
                .unwrap();

            // Crash after the commit point, before publishing.
            let bytes = tabular::encode_listings(&day2).unwrap();
            let pending = store.layout().pending_dir(day(2));
            store.stage(&pending, &bytes).await.unwrap();
            let record = RunRecord {
                observed_at: day(2),
                run_id: Uuid::new_v4(),
                total_records: 1,
                content_sha256: sha256_hex(&bytes),
                committed_at: Utc::now(),
            };
            store.commit(&day2, &record).await.unwrap();

            // Crash before the commit point.
            let orphan = store.layout().pending_dir(day(3));
            store.stage(&orphan, b"partial").await.unwrap();
        }

        let store = SnapshotStore::open(dir.path()).await.unwrap();
        assert_eq!(store.reader().read_latest_view().await.unwrap(), day2);
        assert!(store.layout().history_path(day(2)).exists());
        assert!(!store.layout().pending_root().join("20260303").exists());
        assert!(!store.layout().history_path(day(3)).exists());
        assert_eq!(history(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn reopen_leaves_a_live_writers_staging_alone() {
        let dir = tempdir().unwrap();
        let writer = SnapshotStore::open(dir.path()).await.unwrap();
        let day2 = vec![rental("B", 2000.0, day(2))];
        let bytes = tabular::encode_listings(&day2).unwrap();
        let pending = writer.layout().pending_dir(day(2));

        let guard = lock::acquire(&writer.layout().lock_path(), DEFAULT_LOCK_TTL, "test writer")
            .unwrap();
        writer.stage(&pending, &bytes).await.unwrap();

        let other = SnapshotStore::open(dir.path()).await.unwrap();
        assert!(pending.join(STAGED_HISTORY).exists());
        assert!(pending.join(STAGED_LATEST).exists());

        let record = RunRecord {
            observed_at: day(2),
            run_id: Uuid::new_v4(),
            total_records: 1,
            content_sha256: sha256_hex(&bytes),
            committed_at: Utc::now(),
        };
        writer.commit(&day2, &record).await.unwrap();
        writer
            .publish(day(2), true, PublishMode::Fresh)
            .await
            .unwrap();
        drop(guard);

        assert!(writer.layout().history_path(day(2)).exists());
        assert_eq!(other.reader().read_latest_view().await.unwrap(), day2);
    }

    #[tokio::test]
    async fn publish_refuses_missing_staged_files() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        let day1 = vec![rental("A", 1000.0, day(1))];
        let bytes = tabular::encode_listings(&day1).unwrap();
        let pending = store.layout().pending_dir(day(1));
        store.stage(&pending, &bytes).await.unwrap();
        std::fs::remove_dir_all(&pending).unwrap();

        let err = store
            .publish(day(1), true, PublishMode::Fresh)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Write {
                stage: WriteStage::Publish,
                ..
            }
        ));
        assert!(!store.layout().latest_path().exists());

        // Recovery tolerates files an earlier attempt already moved.
        store
            .publish(day(1), true, PublishMode::RollForward)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reader_sees_commits_made_after_it_was_opened() {
        let dir = tempdir().unwrap();
        let reader = SnapshotReader::open(dir.path());
        assert!(reader.read_latest().await.unwrap().is_empty());

        let store = SnapshotStore::open(dir.path()).await.unwrap();
        let day1 = vec![rental("A", 1000.0, day(1))];
        store.record_snapshot(&day1, day(1)).await.unwrap();

        assert_eq!(reader.read_latest().await.unwrap(), day1);
        assert_eq!(reader.read_snapshot(day(1)).await.unwrap().unwrap().listings, day1);
        assert!(reader.read_snapshot(day(2)).await.unwrap().is_none());
    }
}
