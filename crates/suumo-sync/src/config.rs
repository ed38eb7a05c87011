//! Runtime configuration: environment variables plus the `categories.yaml` registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use suumo_adapters::{default_seed_url, DEFAULT_MAX_PAGES};
use suumo_core::Category;
use suumo_storage::{HttpClientConfig, DEFAULT_USER_AGENT};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::normalize::DEFAULT_AREA_FILTER;

pub const DEFAULT_OUTPUT_DIR: &str = "data/processed";
pub const DEFAULT_WEB_PORT: u16 = 8000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub output_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Age after which a leftover snapshot lock is taken over.
    pub lock_ttl_secs: u64,
    pub schedule_file: PathBuf,
    pub web_port: u16,
}

impl SyncConfig {
    /// Reads `SUUMO_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        build_sync_config(|key| std::env::var(key))
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn categories_path(&self) -> PathBuf {
        self.workspace_root.join("categories.yaml")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.output_dir.join("reports")
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

fn build_sync_config<F>(lookup: F) -> Result<SyncConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let or_default =
        |var: &str, default: &str| -> String { lookup(var).unwrap_or_else(|_| default.to_string()) };

    let parse_u64 = |var: &str, default: &str| -> Result<u64, ConfigError> {
        or_default(var, default)
            .parse::<u64>()
            .map_err(|e| ConfigError::InvalidEnvVar {
                var: var.to_string(),
                reason: e.to_string(),
            })
    };

    let parse_u16 = |var: &str, default: &str| -> Result<u16, ConfigError> {
        or_default(var, default)
            .parse::<u16>()
            .map_err(|e| ConfigError::InvalidEnvVar {
                var: var.to_string(),
                reason: e.to_string(),
            })
    };

    let workspace_root = PathBuf::from(or_default("SUUMO_WORKSPACE_ROOT", "."));
    let schedule_file = lookup("SUUMO_SCHEDULE_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| workspace_root.join("schedules.yaml"));

    Ok(SyncConfig {
        output_dir: PathBuf::from(or_default("SUUMO_OUTPUT_DIR", DEFAULT_OUTPUT_DIR)),
        artifacts_dir: lookup("SUUMO_ARTIFACTS_DIR").ok().map(PathBuf::from),
        user_agent: or_default("SUUMO_USER_AGENT", DEFAULT_USER_AGENT),
        http_timeout_secs: parse_u64("SUUMO_HTTP_TIMEOUT_SECS", "30")?,
        lock_ttl_secs: parse_u64("SUUMO_LOCK_TTL_SECS", "600")?,
        web_port: parse_u16("SUUMO_WEB_PORT", &DEFAULT_WEB_PORT.to_string())?,
        schedule_file,
        workspace_root,
    })
}

fn default_area_filter() -> Option<String> {
    Some(DEFAULT_AREA_FILTER.to_string())
}

fn default_max_pages() -> usize {
    DEFAULT_MAX_PAGES
}

fn default_enabled() -> bool {
    true
}

/// Contents of `categories.yaml`.
///
/// `area_filter: null` keeps every address; leaving the key out uses the
/// Okusawa 3-chome pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRegistry {
    #[serde(default)]
    pub station: Option<String>,
    #[serde(default = "default_area_filter")]
    pub area_filter: Option<String>,
    pub categories: Vec<CategoryConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub category: Category,
    pub seed_url: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl CategoryConfig {
    pub fn builtin(category: Category) -> Self {
        Self {
            category,
            seed_url: default_seed_url(category).to_string(),
            max_pages: DEFAULT_MAX_PAGES,
            enabled: true,
        }
    }
}

impl Default for CategoryRegistry {
    fn default() -> Self {
        Self {
            station: Some("奥沢".to_string()),
            area_filter: default_area_filter(),
            categories: Category::ALL.into_iter().map(CategoryConfig::builtin).collect(),
        }
    }
}

impl CategoryRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing category registry")
    }

    /// Loads `path`, falling back to the built-in registry when the file is absent.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            info!(path = %path.display(), "no category registry; using built-in categories");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &CategoryConfig> {
        self.categories.iter().filter(|c| c.enabled)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::env::VarError;

    use super::*;

    fn lookup_from_map<'a>(
        map: &'a HashMap<&'a str, &'a str>,
    ) -> impl Fn(&str) -> Result<String, VarError> + 'a {
        move |key| {
            map.get(key)
                .map(|v| (*v).to_string())
                .ok_or(VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_apply_without_env() {
        let map = HashMap::new();
        let config = build_sync_config(lookup_from_map(&map)).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("data/processed"));
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.lock_ttl(), Duration::from_secs(600));
        assert_eq!(config.schedule_file, PathBuf::from("./schedules.yaml"));
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert!(config.artifacts_dir.is_none());
        assert_eq!(config.reports_dir(), PathBuf::from("data/processed/reports"));
    }

    #[test]
    fn env_overrides_are_parsed() {
        let map = HashMap::from([
            ("SUUMO_OUTPUT_DIR", "/srv/suumo"),
            ("SUUMO_WORKSPACE_ROOT", "/opt/suumo"),
            ("SUUMO_HTTP_TIMEOUT_SECS", "5"),
            ("SUUMO_WEB_PORT", "9100"),
            ("SUUMO_LOCK_TTL_SECS", "45"),
        ]);
        let config = build_sync_config(lookup_from_map(&map)).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/srv/suumo"));
        assert_eq!(config.schedule_file, PathBuf::from("/opt/suumo/schedules.yaml"));
        assert_eq!(config.http_client_config().timeout, Duration::from_secs(5));
        assert_eq!(config.web_port, 9100);
        assert_eq!(config.lock_ttl(), Duration::from_secs(45));
    }

    #[test]
    fn invalid_number_is_reported() {
        let map = HashMap::from([("SUUMO_HTTP_TIMEOUT_SECS", "soon")]);
        let err = build_sync_config(lookup_from_map(&map)).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidEnvVar { ref var, .. } if var == "SUUMO_HTTP_TIMEOUT_SECS")
        );
    }

    #[test]
    fn registry_yaml_defaults_and_null_filter() {
        let registry = CategoryRegistry::parse(
            r#"
categories:
  - category: land
    seed_url: https://suumo.jp/tochi/tokyo/ek_06660/
  - category: rental
    seed_url: https://suumo.jp/chintai/tokyo/ek_06660/
    enabled: false
"#,
        )
        .unwrap();
        assert_eq!(registry.area_filter.as_deref(), Some(DEFAULT_AREA_FILTER));
        assert_eq!(registry.categories[0].max_pages, DEFAULT_MAX_PAGES);
        let enabled: Vec<_> = registry.enabled().map(|c| c.category).collect();
        assert_eq!(enabled, vec![Category::Land]);

        let unfiltered =
            CategoryRegistry::parse("area_filter: null\ncategories: []\n").unwrap();
        assert_eq!(unfiltered.area_filter, None);
    }

    #[tokio::test]
    async fn workspace_registry_matches_builtin() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../categories.yaml");
        let registry = CategoryRegistry::load_or_default(&path).await.unwrap();
        assert_eq!(registry, CategoryRegistry::default());
    }

    #[test]
    fn builtin_registry_covers_every_category() {
        let registry = CategoryRegistry::default();
        assert_eq!(registry.enabled().count(), Category::ALL.len());
        assert_eq!(
            registry.categories[0].seed_url,
            "https://suumo.jp/chintai/tokyo/ek_06660/"
        );
    }
}
