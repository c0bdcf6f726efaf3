//! Application configuration for feedcast.
//!
//! User config lives at `~/.feedcast/feedcast.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedcastError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "feedcast.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".feedcast";

// ---------------------------------------------------------------------------
// Config structs (matching feedcast.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Change feed adapter settings.
    #[serde(default)]
    pub feed: FeedSettings,

    /// Broadcaster settings.
    #[serde(default)]
    pub broadcast: BroadcastSettings,

    /// Registered pipelines, one broadcaster each.
    #[serde(default = "default_pipelines")]
    pub pipelines: Vec<PipelineEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            feed: FeedSettings::default(),
            broadcast: BroadcastSettings::default(),
            pipelines: default_pipelines(),
        }
    }
}

impl AppConfig {
    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.broadcast.failure_threshold == 0 {
            return Err(FeedcastError::config(
                "broadcast.failure_threshold must be at least 1",
            ));
        }
        if self.broadcast.lane_capacity == 0 {
            return Err(FeedcastError::config(
                "broadcast.lane_capacity must be at least 1",
            ));
        }
        if self.feed.pipe_capacity == 0 {
            return Err(FeedcastError::config("feed.pipe_capacity must be at least 1"));
        }

        let mut seen = std::collections::HashSet::new();
        for pipeline in &self.pipelines {
            if !seen.insert(pipeline.name.as_str()) {
                return Err(FeedcastError::config(format!(
                    "duplicate pipeline name '{}'",
                    pipeline.name
                )));
            }
        }
        Ok(())
    }

    /// Find a registered pipeline by name.
    pub fn pipeline(&self, name: &str) -> Option<&PipelineEntry> {
        self.pipelines.iter().find(|p| p.name == name)
    }
}

/// `[feed]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    /// Seconds the adapter waits to hand one record to its consumer before dropping it.
    #[serde(default = "default_feed_delivery_timeout")]
    pub delivery_timeout_secs: u64,

    /// Upstream errors tolerated before the feed emits a terminal error and closes.
    #[serde(default = "default_error_tolerance_cap")]
    pub error_tolerance_cap: u32,

    /// Snapshot hand-off timeouts tolerated before the reader stage gives up.
    #[serde(default = "default_inner_retry_budget")]
    pub inner_retry_budget: u32,

    /// Seconds the reader stage waits per snapshot hand-off attempt.
    #[serde(default = "default_inner_retry_timeout")]
    pub inner_retry_timeout_secs: u64,

    /// Snapshots buffered between the reader and the filter stage.
    #[serde(default = "default_one")]
    pub pipe_capacity: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            delivery_timeout_secs: default_feed_delivery_timeout(),
            error_tolerance_cap: default_error_tolerance_cap(),
            inner_retry_budget: default_inner_retry_budget(),
            inner_retry_timeout_secs: default_inner_retry_timeout(),
            pipe_capacity: default_one(),
        }
    }
}

fn default_feed_delivery_timeout() -> u64 {
    60
}
fn default_error_tolerance_cap() -> u32 {
    20
}
fn default_inner_retry_budget() -> u32 {
    5
}
fn default_inner_retry_timeout() -> u64 {
    10
}
fn default_one() -> usize {
    1
}

/// `[broadcast]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastSettings {
    /// Milliseconds a single delivery to one subscriber may block.
    #[serde(default = "default_broadcast_delivery_timeout")]
    pub delivery_timeout_ms: u64,

    /// Delivery timeouts after which a subscriber is removed.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Events queued per subscriber lane before new ones are dropped.
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: default_broadcast_delivery_timeout(),
            failure_threshold: default_failure_threshold(),
            lane_capacity: default_lane_capacity(),
        }
    }
}

fn default_broadcast_delivery_timeout() -> u64 {
    1000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_lane_capacity() -> usize {
    16
}

/// `[[pipelines]]` entry: one watched query with its own broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEntry {
    /// Pipeline name, used in logs and on the command line.
    pub name: String,
    /// Collection to watch.
    pub collection: String,
    /// Change kind to forward: "added", "modified" or "removed".
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Predicates evaluated by the store.
    #[serde(default)]
    pub filters: Vec<FilterEntry>,
}

/// One `field op value` predicate inside a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterEntry {
    /// Dotted field path.
    pub path: String,
    /// Comparison operator: `==`, `!=`, `<`, `<=`, `>`, `>=`.
    pub op: String,
    /// Right-hand side value.
    pub value: serde_json::Value,
}

fn default_kind() -> String {
    "added".into()
}

fn default_pipelines() -> Vec<PipelineEntry> {
    vec![
        PipelineEntry {
            name: "review-sentiment".into(),
            collection: "products".into(),
            kind: default_kind(),
            filters: vec![FilterEntry {
                path: "sentimentAnalized".into(),
                op: "==".into(),
                value: serde_json::Value::Bool(false),
            }],
        },
        PipelineEntry {
            name: "relevant-videos".into(),
            collection: "products".into(),
            kind: default_kind(),
            filters: vec![FilterEntry {
                path: "relatedVideosAnalized".into(),
                op: "==".into(),
                value: serde_json::Value::Bool(false),
            }],
        },
    ]
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime change feed configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Max wait to hand one record to the consumer; the record is dropped after.
    pub delivery_timeout: Duration,
    /// Upstream errors tolerated before the terminal error record.
    pub error_tolerance_cap: u32,
    /// Snapshot hand-off timeouts tolerated by the reader stage.
    pub inner_retry_budget: u32,
    /// Max wait per snapshot hand-off attempt.
    pub inner_retry_timeout: Duration,
    /// Snapshots buffered between the two stages.
    pub pipe_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::from(&FeedSettings::default())
    }
}

impl From<&FeedSettings> for FeedConfig {
    fn from(settings: &FeedSettings) -> Self {
        Self {
            delivery_timeout: Duration::from_secs(settings.delivery_timeout_secs),
            error_tolerance_cap: settings.error_tolerance_cap,
            inner_retry_budget: settings.inner_retry_budget,
            inner_retry_timeout: Duration::from_secs(settings.inner_retry_timeout_secs),
            pipe_capacity: settings.pipe_capacity.max(1),
        }
    }
}

impl From<&AppConfig> for FeedConfig {
    fn from(config: &AppConfig) -> Self {
        Self::from(&config.feed)
    }
}

/// Runtime broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Max wait for a subscriber to accept one event.
    pub delivery_timeout: Duration,
    /// Delivery timeouts after which a subscriber is removed.
    pub failure_threshold: u32,
    /// Per-subscriber lane queue length.
    pub lane_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self::from(&BroadcastSettings::default())
    }
}

impl From<&BroadcastSettings> for BroadcastConfig {
    fn from(settings: &BroadcastSettings) -> Self {
        Self {
            delivery_timeout: Duration::from_millis(settings.delivery_timeout_ms),
            failure_threshold: settings.failure_threshold.max(1),
            lane_capacity: settings.lane_capacity.max(1),
        }
    }
}

impl From<&AppConfig> for BroadcastConfig {
    fn from(config: &AppConfig) -> Self {
        Self::from(&config.broadcast)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.feedcast/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| FeedcastError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.feedcast/feedcast.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| FeedcastError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        FeedcastError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| FeedcastError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| FeedcastError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| FeedcastError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("error_tolerance_cap"));
        assert!(toml_str.contains("review-sentiment"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.feed.error_tolerance_cap, 20);
        assert_eq!(parsed.broadcast.failure_threshold, 3);
        assert_eq!(parsed.pipelines.len(), 2);
        assert_eq!(parsed.pipelines[0].filters[0].value, serde_json::json!(false));
    }

    #[test]
    fn config_with_pipelines() {
        let toml_str = r#"
[broadcast]
delivery_timeout_ms = 50

[[pipelines]]
name = "fresh-orders"
collection = "orders"
kind = "modified"

[[pipelines.filters]]
path = "total"
op = ">"
value = 100
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.broadcast.delivery_timeout_ms, 50);
        assert_eq!(config.broadcast.failure_threshold, 3);
        assert_eq!(config.pipelines.len(), 1);
        let pipeline = config.pipeline("fresh-orders").expect("pipeline");
        assert_eq!(pipeline.kind, "modified");
        assert_eq!(pipeline.filters[0].value, serde_json::json!(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let app = AppConfig::default();
        let feed = FeedConfig::from(&app);
        assert_eq!(feed.delivery_timeout, Duration::from_secs(60));
        assert_eq!(feed.inner_retry_timeout, Duration::from_secs(10));
        assert_eq!(feed.inner_retry_budget, 5);

        let broadcast = BroadcastConfig::from(&app);
        assert_eq!(broadcast.delivery_timeout, Duration::from_secs(1));
        assert_eq!(broadcast.failure_threshold, 3);
    }

    #[test]
    fn validation_rejects_zero_threshold() {
        let mut config = AppConfig::default();
        config.broadcast.failure_threshold = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[test]
    fn validation_rejects_duplicate_pipelines() {
        let mut config = AppConfig::default();
        let dup = config.pipelines[0].clone();
        config.pipelines.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_config_from_file() {
        let path = std::env::temp_dir().join(format!(
            "feedcast_test_{}.toml",
            uuid::Uuid::now_v7()
        ));
        std::fs::write(&path, "[feed]\nerror_tolerance_cap = 2\n").expect("write config");
        let config = load_config_from(&path).expect("load config");
        assert_eq!(config.feed.error_tolerance_cap, 2);
        assert_eq!(config.pipelines.len(), 2);
        let _ = std::fs::remove_file(&path);
    }
}
