//! Post-commit run reports: day-over-day diff, daily brief, Parquet export.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use suumo_core::{Category, Listing, ListingKey, RunRecord};
use suumo_storage::{sha256_hex, write_atomic, SnapshotReader};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChange {
    pub key: ListingKey,
    pub title: String,
    pub before: Option<f64>,
    pub after: Option<f64>,
}

/// What changed between two consecutive snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotDiff {
    pub added: Vec<ListingKey>,
    pub removed: Vec<ListingKey>,
    pub price_changed: Vec<PriceChange>,
}

impl SnapshotDiff {
    pub fn between(previous: &[Listing], current: &[Listing]) -> Self {
        let before: HashMap<ListingKey, &Listing> =
            previous.iter().map(|l| (l.key(), l)).collect();
        let after: HashMap<ListingKey, &Listing> = current.iter().map(|l| (l.key(), l)).collect();

        let mut diff = SnapshotDiff::default();
        for listing in current {
            let key = listing.key();
            match before.get(&key) {
                None => diff.added.push(key),
                Some(old) if old.attributes.price_yen != listing.attributes.price_yen => {
                    diff.price_changed.push(PriceChange {
                        title: listing.attributes.title.clone(),
                        before: old.attributes.price_yen,
                        after: listing.attributes.price_yen,
                        key,
                    });
                }
                Some(_) => {}
            }
        }
        diff.removed = previous
            .iter()
            .map(Listing::key)
            .filter(|key| !after.contains_key(key))
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.price_changed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub observed_at: String,
    pub run_id: String,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn yen(value: Option<f64>) -> String {
    match value {
        Some(v) if v >= 10_000.0 => format!("{:.1}万円", v / 10_000.0),
        Some(v) => format!("{v:.0}円"),
        None => "-".to_string(),
    }
}

pub fn render_daily_brief(record: &RunRecord, current: &[Listing], diff: &SnapshotDiff) -> String {
    let mut counts: BTreeMap<Category, usize> = BTreeMap::new();
    for listing in current {
        *counts.entry(listing.category).or_default() += 1;
    }

    let mut out = String::new();
    let _ = writeln!(out, "# SUUMO Daily Brief {}\n", record.observed_at);
    let _ = writeln!(out, "- Run ID: `{}`", record.run_id);
    let _ = writeln!(out, "- Committed: {}", record.committed_at.to_rfc3339());
    let _ = writeln!(out, "- Listings: {}", record.total_records);
    let _ = writeln!(out, "- History sha256: `{}`\n", record.content_sha256);

    let _ = writeln!(out, "## Category Counts");
    for category in Category::ALL {
        let count = counts.get(&category).copied().unwrap_or(0);
        let _ = writeln!(out, "- {} ({}): {}", category.label_ja(), category, count);
    }

    let _ = writeln!(
        out,
        "\n## Changes\n- added: {}\n- removed: {}\n- price changed: {}",
        diff.added.len(),
        diff.removed.len(),
        diff.price_changed.len()
    );
    for key in &diff.added {
        let _ = writeln!(out, "  - new `{key}`");
    }
    for key in &diff.removed {
        let _ = writeln!(out, "  - gone `{key}`");
    }
    for change in &diff.price_changed {
        let _ = writeln!(
            out,
            "  - `{}` {}: {} -> {}",
            change.key,
            change.title,
            yen(change.before),
            yen(change.after)
        );
    }
    out
}

/// Writes `reports/<YYYYMMDD>/{daily_brief.md, listings.parquet, manifest.json}`.
pub async fn write_run_reports(
    reports_root: &Path,
    record: &RunRecord,
    previous: &[Listing],
    current: &[Listing],
) -> Result<PathBuf> {
    let report_dir = reports_root.join(record.observed_at.format("%Y%m%d").to_string());
    tokio::fs::create_dir_all(&report_dir)
        .await
        .with_context(|| format!("creating {}", report_dir.display()))?;

    let diff = SnapshotDiff::between(previous, current);
    let brief = render_daily_brief(record, current, &diff);
    write_atomic(&report_dir.join("daily_brief.md"), brief.as_bytes()).await?;

    let parquet_path = report_dir.join("listings.parquet");
    write_listings_parquet(&parquet_path, current)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        observed_at: record.observed_at.to_string(),
        run_id: record.run_id.to_string(),
        files: vec![manifest_entry("listings", &report_dir, &parquet_path)?],
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    write_atomic(&report_dir.join("manifest.json"), &bytes).await?;

    Ok(report_dir)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

pub fn write_listings_parquet(path: &Path, listings: &[Listing]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("observed_at", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("listing_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("address", DataType::Utf8, false),
        ArrowField::new("price_text", DataType::Utf8, false),
        ArrowField::new("price_yen", DataType::Float64, true),
        ArrowField::new("area_sqm", DataType::Float64, true),
        ArrowField::new("area_tsubo", DataType::Float64, true),
        ArrowField::new("unit_price_per_sqm", DataType::Float64, true),
        ArrowField::new("unit_price_per_tsubo", DataType::Float64, true),
        ArrowField::new("detail_url", DataType::Utf8, false),
    ]));

    let text = |f: fn(&Listing) -> String| {
        StringArray::from(listings.iter().map(|l| Some(f(l))).collect::<Vec<_>>())
    };
    let number = |f: fn(&Listing) -> Option<f64>| {
        Float64Array::from(listings.iter().map(f).collect::<Vec<_>>())
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text(|l| l.observed_at.to_string())),
            Arc::new(text(|l| l.category.as_str().to_string())),
            Arc::new(text(|l| l.listing_id.clone())),
            Arc::new(text(|l| l.attributes.title.clone())),
            Arc::new(text(|l| l.attributes.address.clone())),
            Arc::new(text(|l| l.attributes.price_text.clone())),
            Arc::new(number(|l| l.attributes.price_yen)),
            Arc::new(number(|l| l.attributes.area_sqm)),
            Arc::new(number(|l| l.attributes.area_tsubo)),
            Arc::new(number(|l| l.attributes.unit_price_per_sqm)),
            Arc::new(number(|l| l.attributes.unit_price_per_tsubo)),
            Arc::new(text(|l| l.attributes.detail_url.clone())),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, report_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(report_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Markdown summary of the last `runs` committed snapshots, newest first.
pub async fn report_daily_markdown(reader: &SnapshotReader, runs: usize) -> Result<String> {
    let records = reader.list_runs().await.context("listing committed runs")?;
    let reports_root = reader.layout().root().join("reports");

    let mut lines = vec!["# SUUMO Run Report".to_string(), String::new()];
    if records.is_empty() {
        lines.push("No snapshots recorded yet.".to_string());
    }

    for record in records.into_iter().take(runs.max(1)) {
        let snapshot = reader
            .read_snapshot(record.observed_at)
            .await
            .with_context(|| format!("reading snapshot {}", record.observed_at))?;
        let history = reader.layout().history_path(record.observed_at);
        let brief = reports_root
            .join(record.observed_at.format("%Y%m%d").to_string())
            .join("daily_brief.md");

        lines.push(format!("## {}", record.observed_at));
        lines.push(format!("- run: `{}`", record.run_id));
        lines.push(format!("- listings: {}", record.total_records));
        if let Some(snapshot) = snapshot {
            for (category, count) in snapshot.count_by_category() {
                lines.push(format!("  - {}: {count}", category.label_ja()));
            }
        }
        lines.push(format!("- committed: {}", record.committed_at.to_rfc3339()));
        lines.push(format!(
            "- history: `{}` (sha256 `{}`)",
            history.display(),
            record.content_sha256
        ));
        if brief.exists() {
            lines.push(format!("- daily brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
