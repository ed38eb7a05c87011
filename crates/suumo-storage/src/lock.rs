//! Cross-process write lock for the snapshot store.
//!
//! The lock is a small JSON file created with `create_new`, so only one
//! process can hold it. A lock older than its TTL is treated as abandoned
//! (for example a run killed mid-write) and taken over.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(10));
        now - self.acquired_at > ttl
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock held by {holder} since {acquired_at}")]
    Held {
        holder: String,
        acquired_at: DateTime<Utc>,
    },
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Removes the lock file when dropped.
#[derive(Debug)]
pub struct WriteLockGuard {
    path: PathBuf,
    holder_id: String,
}

impl WriteLockGuard {
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        // Only remove the file if it still names us; a stale takeover may have replaced it.
        let still_ours = read_lock_info(&self.path)
            .map(|info| info.holder_id == self.holder_id)
            .unwrap_or(false);
        if still_ours {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %err, "failed to release snapshot lock");
            }
        }
    }
}

pub fn acquire(path: &Path, ttl: Duration, operation: &str) -> Result<WriteLockGuard, LockError> {
    let info = LockInfo {
        holder_id: format!("{}-{}", std::process::id(), Uuid::new_v4()),
        acquired_at: Utc::now(),
        operation: Some(operation.to_string()),
    };

    // Second attempt only happens after removing a stale lock.
    for _ in 0..2 {
        match try_create(path, &info) {
            Ok(()) => {
                return Ok(WriteLockGuard {
                    path: path.to_path_buf(),
                    holder_id: info.holder_id,
                })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                match read_lock_info(path) {
                    Some(existing) if !existing.is_stale(ttl, Utc::now()) => {
                        return Err(LockError::Held {
                            holder: existing.holder_id,
                            acquired_at: existing.acquired_at,
                        });
                    }
                    existing => {
                        warn!(
                            path = %path.display(),
                            holder = existing.as_ref().map(|i| i.holder_id.as_str()).unwrap_or("<unreadable>"),
                            "taking over stale snapshot lock"
                        );
                        match fs::remove_file(path) {
                            Ok(()) => {}
                            Err(err) if err.kind() == ErrorKind::NotFound => {}
                            Err(source) => {
                                return Err(LockError::Io {
                                    path: path.to_path_buf(),
                                    source,
                                })
                            }
                        }
                    }
                }
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    match read_lock_info(path) {
        Some(existing) => Err(LockError::Held {
            holder: existing.holder_id,
            acquired_at: existing.acquired_at,
        }),
        None => Err(LockError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(ErrorKind::WouldBlock, "lock contended during takeover"),
        }),
    }
}

fn try_create(path: &Path, info: &LockInfo) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let bytes = serde_json::to_vec(info).map_err(std::io::Error::other)?;
    file.write_all(&bytes)?;
    file.sync_all()
}

fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}
