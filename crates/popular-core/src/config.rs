use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::TimeWindow;

/// Project configuration file (`popular.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PopularConfig {
    #[serde(default)]
    pub tally: TallyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// A list that may be written as a TOML array or as the comma-separated
/// string form used by the admin settings page (`"86400, 604800"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListSetting {
    Items(Vec<String>),
    Numbers(Vec<i64>),
    Csv(String),
}

impl ListSetting {
    fn entries(&self) -> Vec<String> {
        match self {
            Self::Items(items) => items.iter().map(|s| s.trim().to_string()).collect(),
            Self::Numbers(numbers) => numbers.iter().map(ToString::to_string).collect(),
            Self::Csv(raw) => raw.split(',').map(|s| s.trim().to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default = "default_windows")]
    pub windows: ListSetting,
    #[serde(default = "default_debounce_interval")]
    pub debounce_interval: i64,
    #[serde(default = "default_blacklist")]
    pub blacklist: ListSetting,
    #[serde(default)]
    pub count_anonymous: bool,
    #[serde(default = "default_site_course_id")]
    pub site_course_id: i64,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            windows: default_windows(),
            debounce_interval: default_debounce_interval(),
            blacklist: default_blacklist(),
            count_anonymous: false,
            site_course_id: default_site_course_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Rejected tally settings. A run never starts with these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("window list is empty")]
    EmptyWindows,
    #[error("invalid window '{0}': expected a non-negative number of seconds")]
    InvalidWindow(String),
    #[error("invalid blacklist entry '{0}': expected an IP address")]
    InvalidBlacklistEntry(String),
    #[error("debounce interval must be non-negative, got {0}")]
    NegativeDebounce(i64),
}

/// Validated settings consumed by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallySettings {
    /// Ascending, deduplicated.
    pub windows: Vec<TimeWindow>,
    /// Seconds; zero disables debounce.
    pub debounce_interval: i64,
    pub blacklist: BTreeSet<IpAddr>,
    pub count_anonymous: bool,
    /// Course id of the site front page, never listed in top-N results.
    pub site_course_id: i64,
}

impl Default for TallySettings {
    fn default() -> Self {
        Self {
            windows: vec![
                TimeWindow::DAY,
                TimeWindow::WEEK,
                TimeWindow::MONTH,
                TimeWindow::YEAR,
            ],
            debounce_interval: default_debounce_interval(),
            blacklist: BTreeSet::new(),
            count_anonymous: false,
            site_course_id: default_site_course_id(),
        }
    }
}

impl TallyConfig {
    /// Validate the raw settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an empty or malformed window list, a
    /// malformed blacklist entry, or a negative debounce interval.
    pub fn validate(&self) -> Result<TallySettings, ConfigError> {
        let mut windows = BTreeSet::new();
        for entry in self.windows.entries() {
            if entry.is_empty() {
                continue;
            }
            let window = entry
                .parse::<TimeWindow>()
                .map_err(|_| ConfigError::InvalidWindow(entry.clone()))?;
            windows.insert(window);
        }
        if windows.is_empty() {
            return Err(ConfigError::EmptyWindows);
        }

        let mut blacklist = BTreeSet::new();
        for entry in self.blacklist.entries() {
            if entry.is_empty() {
                continue;
            }
            let ip = entry
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidBlacklistEntry(entry.clone()))?;
            blacklist.insert(ip);
        }

        if self.debounce_interval < 0 {
            return Err(ConfigError::NegativeDebounce(self.debounce_interval));
        }

        Ok(TallySettings {
            windows: windows.into_iter().collect(),
            debounce_interval: self.debounce_interval,
            blacklist,
            count_anonymous: self.count_anonymous,
            site_course_id: self.site_course_id,
        })
    }
}

impl TallySettings {
    /// Whether `origin_ip` is on the blacklist. Unparseable origins never
    /// match.
    #[must_use]
    pub fn is_blacklisted(&self, origin_ip: &str) -> bool {
        if self.blacklist.is_empty() {
            return false;
        }
        origin_ip
            .trim()
            .parse::<IpAddr>()
            .is_ok_and(|ip| self.blacklist.contains(&ip))
    }

    /// Stable digest of every setting that changes what a tally means.
    ///
    /// Stored alongside the watermark; a mismatch forces a full rebuild.
    /// `site_course_id` only affects queries and is left out.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let windows = self
            .windows
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let blacklist = self
            .blacklist
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "v1;windows={windows};debounce={};blacklist={blacklist};anonymous={}",
            self.debounce_interval, self.count_anonymous
        )
    }
}

/// Load `popular.toml` from an explicit path.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config_file(path: &Path) -> Result<PopularConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<PopularConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Resolve configuration: explicit path, then `./popular.toml`, then the
/// user config directory, then defaults.
///
/// # Errors
///
/// Returns an error if a discovered file cannot be read or parsed.
pub fn resolve_config(explicit: Option<&Path>, working_dir: &Path) -> Result<PopularConfig> {
    if let Some(path) = explicit {
        return load_config_file(path);
    }

    let local = working_dir.join("popular.toml");
    if local.exists() {
        return load_config_file(&local);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user = config_dir.join("popular/config.toml");
        if user.exists() {
            return load_config_file(&user);
        }
    }

    Ok(PopularConfig::default())
}

fn default_windows() -> ListSetting {
    ListSetting::Csv("86400, 604800, 2592000, 31536000".to_string())
}

const fn default_debounce_interval() -> i64 {
    3600
}

const fn default_blacklist() -> ListSetting {
    ListSetting::Items(Vec::new())
}

const fn default_site_course_id() -> i64 {
    1
}

fn default_database() -> PathBuf {
    PathBuf::from("popular.sqlite3")
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}
