//! Snapshot persistence, raw page archive and HTTP fetch utilities.

pub mod fetch;
pub mod lock;
pub mod snapshot;
pub mod tabular;

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use suumo_core::Category;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub use fetch::{
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RateLimiter, RetryPolicy,
    DEFAULT_USER_AGENT,
};
pub use snapshot::{SnapshotReader, SnapshotStore, StoreError, StoreLayout, WriteStage};

pub const CRATE_NAME: &str = "suumo-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Writes `bytes` next to `path` under a temp name, then renames over `path`.
///
/// Readers observe either the previous file or the complete new one.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    write_synced(&temp_path, bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

pub(crate) async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

/// A raw list page saved by [`PageArchive::archive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPage {
    pub path: PathBuf,
    pub sha256: String,
    /// The same body was already archived for this day and category.
    pub reused: bool,
}

/// Raw SUUMO pages as fetched, laid out as `<YYYYMMDD>/<category>/<sha256>.html`.
///
/// Kept so a day's parse can be replayed after a parser fix.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn day_dir(&self, fetched_at: DateTime<Utc>, category: Category) -> PathBuf {
        self.root
            .join(fetched_at.format("%Y%m%d").to_string())
            .join(category.as_str())
    }

    pub async fn archive(
        &self,
        category: Category,
        fetched_at: DateTime<Utc>,
        body: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let sha256 = sha256_hex(body);
        let path = self
            .day_dir(fetched_at, category)
            .join(format!("{sha256}.html"));
        let reused = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
        if !reused {
            write_atomic(&path, body).await?;
        }
        Ok(ArchivedPage {
            path,
            sha256,
            reused,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn same_body_on_same_day_is_archived_once() {
        let dir = tempdir().unwrap();
        let archive = PageArchive::new(dir.path());
        let morning = DateTime::parse_from_rfc3339("2026-03-01T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next_day = morning + chrono::Duration::days(1);

        let first = archive.archive(Category::Land, morning, b"<html>p1</html>").await.unwrap();
        let again = archive.archive(Category::Land, morning, b"<html>p1</html>").await.unwrap();
        let later = archive.archive(Category::Land, next_day, b"<html>p1</html>").await.unwrap();

        assert!(!first.reused);
        assert!(again.reused);
        assert_eq!(first.path, again.path);
        assert!(first.path.starts_with(dir.path().join("20260301").join("land")));
        assert!(!later.reused);
        assert_eq!(std::fs::read(&later.path).unwrap(), b"<html>p1</html>");
    }

    #[tokio::test]
    async fn atomic_write_replaces_whole_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.yaml");

        write_atomic(&path, b"first version").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
