use serde::Deserialize;
use std::path::Path;

use qn_core::domain::Source;
use qn_core::{IngestError, Result};

/// Runtime configuration, read from `config.toml` with environment
/// overrides for the paths. Every tuning knob the pipeline exposes lives
/// here so concurrently running jobs never share ambient mutable state.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_assets_dir")]
    pub assets_dir: String,
    #[serde(default)]
    pub geocoder_url: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub freshness: FreshnessConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Per-source outbound cap, jobs per rolling hour.
    #[serde(default = "default_cap_per_hour")]
    pub cap_per_hour: u32,
    #[serde(default = "default_requests_per_min")]
    pub requests_per_min: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_base_secs: i64,
    /// Running jobs claimed longer ago than this are treated as abandoned
    /// and become claimable again.
    #[serde(default = "default_stale_running_secs")]
    pub stale_running_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Geo-proximity match radius in meters.
    #[serde(default = "default_radius_m")]
    pub radius_m: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_name_threshold")]
    pub name_threshold: f64,
    #[serde(default = "default_max_distance_m")]
    pub max_distance_m: f64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FreshnessConfig {
    /// Listings confirmed within this window are skipped (touch only).
    #[serde(default = "default_freshness_hours")]
    pub window_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
}

fn default_database_path() -> String {
    "data/quiznights.db".to_string()
}
fn default_assets_dir() -> String {
    "data/assets".to_string()
}
fn default_user_agent() -> String {
    "qn-scraper/0.1".to_string()
}
fn default_cap_per_hour() -> u32 {
    60
}
fn default_requests_per_min() -> u64 {
    30
}
fn default_concurrency() -> u32 {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_secs() -> i64 {
    30
}
fn default_stale_running_secs() -> i64 {
    900
}
fn default_radius_m() -> f64 {
    100.0
}
fn default_name_threshold() -> f64 {
    0.85
}
fn default_max_distance_m() -> f64 {
    150.0
}
fn default_page_size() -> usize {
    100
}
fn default_freshness_hours() -> i64 {
    24
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cap_per_hour: default_cap_per_hour(),
            requests_per_min: default_requests_per_min(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_secs(),
            stale_running_secs: default_stale_running_secs(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            radius_m: default_radius_m(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            name_threshold: default_name_threshold(),
            max_distance_m: default_max_distance_m(),
            page_size: default_page_size(),
        }
    }
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            window_hours: default_freshness_hours(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            assets_dir: default_assets_dir(),
            geocoder_url: None,
            user_agent: default_user_agent(),
            scheduler: SchedulerConfig::default(),
            resolver: ResolverConfig::default(),
            dedup: DedupConfig::default(),
            freshness: FreshnessConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load `config.toml` if present, otherwise defaults. `QN_DATABASE_PATH`
    /// and `QN_ASSETS_DIR` override the file.
    pub fn load() -> Result<Self> {
        let mut config = if Path::new("config.toml").exists() {
            let text = std::fs::read_to_string("config.toml")?;
            toml::from_str(&text).map_err(|e| IngestError::Validation {
                message: format!("invalid config.toml: {e}"),
            })?
        } else {
            AppConfig::default()
        };
        if let Ok(path) = std::env::var("QN_DATABASE_PATH") {
            config.database_path = path;
        }
        if let Ok(dir) = std::env::var("QN_ASSETS_DIR") {
            config.assets_dir = dir;
        }
        Ok(config)
    }

    pub fn source_records(&self) -> Vec<Source> {
        self.sources
            .iter()
            .map(|s| Source {
                id: s.id.clone(),
                name: s.name.clone(),
                base_url: s.base_url.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            database_path = "/tmp/test.db"

            [scheduler]
            cap_per_hour = 120

            [[sources]]
            id = "quizfeed"
            name = "QuizFeed"
            base_url = "https://quizfeed.example"
            "#,
        )
        .unwrap();
        assert_eq!(config.database_path, "/tmp/test.db");
        assert_eq!(config.scheduler.cap_per_hour, 120);
        assert_eq!(config.resolver.radius_m, 100.0);
        assert_eq!(config.sources.len(), 1);
    }
}
