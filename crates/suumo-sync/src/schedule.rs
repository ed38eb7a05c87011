//! Daily run registrations and the in-process cron daemon.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{Local, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use suumo_storage::write_atomic;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::SyncPipeline;

#[derive(Debug, Error)]
pub enum ScheduleFailure {
    #[error("no schedule named `{0}`")]
    NotFound(String),
    #[error("invalid time `{0}`, expected HH:MM")]
    InvalidTime(String),
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Write(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub at: String,
    pub output_dir: PathBuf,
}

impl ScheduleEntry {
    /// Six-field cron (`sec min hour dom mon dow`) firing once a day at `at`.
    pub fn cron_expression(&self) -> Result<String, ScheduleFailure> {
        let time = parse_time(&self.at)?;
        Ok(format!("0 {} {} * * *", time.minute(), time.hour()))
    }
}

pub fn parse_time(at: &str) -> Result<NaiveTime, ScheduleFailure> {
    NaiveTime::parse_from_str(at.trim(), "%H:%M")
        .map_err(|_| ScheduleFailure::InvalidTime(at.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Replaced,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    schedules: Vec<ScheduleEntry>,
}

/// Named daily registrations persisted in a YAML file.
#[derive(Debug, Clone)]
pub struct ScheduleRegistry {
    path: PathBuf,
    entries: Vec<ScheduleEntry>,
}

impl ScheduleRegistry {
    /// A missing file is an empty registry.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, ScheduleFailure> {
        let path = path.into();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    entries: Vec::new(),
                })
            }
            Err(source) => return Err(ScheduleFailure::Read { path, source }),
        };
        let file: ScheduleFile = if text.trim().is_empty() {
            ScheduleFile::default()
        } else {
            serde_yaml::from_str(&text).map_err(|source| ScheduleFailure::Parse {
                path: path.clone(),
                source,
            })?
        };
        Ok(Self {
            path,
            entries: file.schedules,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ScheduleEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Adds or replaces `name`; the file always ends up with one entry per name.
    pub async fn register(
        &mut self,
        name: &str,
        at: &str,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Registration, ScheduleFailure> {
        let time = parse_time(at)?;
        let entry = ScheduleEntry {
            name: name.to_string(),
            at: time.format("%H:%M").to_string(),
            output_dir: output_dir.into(),
        };

        let outcome = match self.entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => {
                *existing = entry;
                Registration::Replaced
            }
            None => {
                self.entries.push(entry);
                Registration::Created
            }
        };
        self.save().await?;
        Ok(outcome)
    }

    pub async fn unregister(&mut self, name: &str) -> Result<(), ScheduleFailure> {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        if self.entries.len() == before {
            return Err(ScheduleFailure::NotFound(name.to_string()));
        }
        self.save().await
    }

    async fn save(&self) -> Result<(), ScheduleFailure> {
        let file = ScheduleFile {
            schedules: self.entries.clone(),
        };
        let text = serde_yaml::to_string(&file).context("serializing schedules")?;
        write_atomic(&self.path, text.as_bytes())
            .await
            .with_context(|| format!("saving {}", self.path.display()))?;
        Ok(())
    }
}

/// One cron job per entry, in local time, each running the pipeline into its output dir.
pub async fn build_scheduler(
    entries: &[ScheduleEntry],
    config: &SyncConfig,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for entry in entries {
        let cron = entry.cron_expression()?;
        let name = entry.name.clone();
        let config = config.clone().with_output_dir(entry.output_dir.clone());
        let job = Job::new_async_tz(cron.as_str(), Local, move |_uuid, _lock| {
            let name = name.clone();
            let config = config.clone();
            Box::pin(async move {
                match run_scheduled(config).await {
                    Ok(summary) => info!(
                        schedule = %name,
                        observed_at = %summary.observed_at,
                        listings = summary.listings,
                        "scheduled run committed"
                    ),
                    Err(err) => warn!(schedule = %name, error = %format!("{err:#}"), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating job `{}` for cron {cron}", entry.name))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(schedule = %entry.name, at = %entry.at, "registered daily job");
    }
    Ok(sched)
}

async fn run_scheduled(config: SyncConfig) -> anyhow::Result<crate::SyncRunSummary> {
    let pipeline = SyncPipeline::new(config).await?;
    Ok(pipeline.run_once().await?)
}

/// Runs every registered job until Ctrl-C.
pub async fn run_daemon(registry: &ScheduleRegistry, config: &SyncConfig) -> anyhow::Result<()> {
    if registry.entries().is_empty() {
        warn!(path = %registry.path().display(), "no schedules registered; daemon has nothing to run");
    }
    let mut sched = build_scheduler(registry.entries(), config).await?;
    sched.start().await.context("starting scheduler")?;
    info!(jobs = registry.entries().len(), "schedule daemon running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down schedule daemon");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cron_expression_fires_daily() {
        let entry = ScheduleEntry {
            name: "daily".into(),
            at: "06:30".into(),
            output_dir: "data/processed".into(),
        };
        assert_eq!(entry.cron_expression().unwrap(), "0 30 6 * * *");
        assert!(parse_time("25:00").is_err());
        assert!(parse_time("6:5pm").is_err());
    }

    #[tokio::test]
    async fn registering_twice_keeps_one_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schedules.yaml");

        let mut registry = ScheduleRegistry::load(&path).await.unwrap();
        assert!(registry.entries().is_empty());
        assert_eq!(
            registry.register("daily", "06:00", "data/a").await.unwrap(),
            Registration::Created
        );
        assert_eq!(
            registry.register("daily", "7:15", "data/b").await.unwrap(),
            Registration::Replaced
        );

        let reloaded = ScheduleRegistry::load(&path).await.unwrap();
        assert_eq!(reloaded.entries().len(), 1);
        let entry = reloaded.get("daily").unwrap();
        assert_eq!(entry.at, "07:15");
        assert_eq!(entry.output_dir, PathBuf::from("data/b"));
    }

    #[tokio::test]
    async fn unregistering_unknown_name_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schedules.yaml");
        let mut registry = ScheduleRegistry::load(&path).await.unwrap();
        registry.register("daily", "06:00", "data").await.unwrap();

        let err = registry.unregister("weekly").await.unwrap_err();
        assert!(matches!(err, ScheduleFailure::NotFound(ref name) if name == "weekly"));
        assert_eq!(registry.entries().len(), 1);

        registry.unregister("daily").await.unwrap();
        assert!(ScheduleRegistry::load(&path).await.unwrap().entries().is_empty());
    }

    #[tokio::test]
    async fn invalid_time_is_rejected_without_saving() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schedules.yaml");
        let mut registry = ScheduleRegistry::load(&path).await.unwrap();
        let err = registry.register("daily", "noon", "data").await.unwrap_err();
        assert!(matches!(err, ScheduleFailure::InvalidTime(_)));
        assert!(!path.exists());
    }
}
