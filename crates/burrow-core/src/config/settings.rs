//! Engine configuration loaded from a TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::nav::sort::SortKey;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub browse: BrowseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Loads configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] if the file does not exist.
    /// - [`CoreError::PermissionDenied`] if the file is not readable.
    /// - [`CoreError::ConfigParse`] if the TOML is malformed.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| CoreError::from_io(path, e))?;
        toml::from_str(&content).map_err(|e| CoreError::ConfigParse(e.to_string()))
    }
}

/// Listing, filtering and ordering preferences.
///
/// Read once at the start of every directory scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowseConfig {
    #[serde(default)]
    pub show_hidden: bool,
    #[serde(default = "default_hidden_filter")]
    pub hidden_filter: String,
    #[serde(default)]
    pub sort: SortKey,
    #[serde(default)]
    pub sort_reverse: bool,
    #[serde(default = "default_true")]
    pub sort_case_insensitive: bool,
    #[serde(default = "default_true")]
    pub sort_directories_first: bool,
    #[serde(default)]
    pub sort_unicode: bool,
    #[serde(default)]
    pub flat_depth: usize,
}

impl BrowseConfig {
    /// Compiles the hidden-file pattern, or `None` when hidden files are shown.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidPattern`] if `hidden_filter` is not a valid regex.
    pub fn hidden_regex(&self) -> CoreResult<Option<Regex>> {
        if self.show_hidden || self.hidden_filter.is_empty() {
            return Ok(None);
        }
        Regex::new(&self.hidden_filter)
            .map(Some)
            .map_err(|e| CoreError::InvalidPattern(e.to_string()))
    }
}

impl Default for BrowseConfig {
    fn default() -> Self {
        Self {
            show_hidden: false,
            hidden_filter: default_hidden_filter(),
            sort: SortKey::default(),
            sort_reverse: false,
            sort_case_insensitive: true,
            sort_directories_first: true,
            sort_unicode: false,
            flat_depth: 0,
        }
    }
}

/// Time-slicing for the task scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_work_time_ms")]
    pub work_time_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl SchedulerConfig {
    pub fn work_time(&self) -> Duration {
        Duration::from_millis(self.work_time_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            work_time_ms: default_work_time_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Eviction policy for the directory cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_hidden_filter() -> String {
    r"^\.|\.(?:pyc|pyo|bak|swp)$|^lost\+found$|^__(py)?cache__$".to_string()
}

fn default_work_time_ms() -> u64 {
    30
}

fn default_poll_timeout_ms() -> u64 {
    10
}

fn default_max_age_secs() -> u64 {
    1200
}
