//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with CLI-flag overrides, the way
//! the agent this engine was transformed from loads config from TOML with
//! environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// File-type classification used by the Scanner's inclusion filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FileTypeFilter {
    Raw,
    Standard,
    Video,
    Sidecar,
    Catalog,
    All,
}

impl Default for FileTypeFilter {
    fn default() -> Self {
        FileTypeFilter::All
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scan: ScanConfig,
    pub duplicate: DuplicateConfig,
    pub destination: DestinationConfig,
    pub retry: RetryConfig,
    pub log: LogConfig,
    pub eventlog: EventLogConfig,
    pub power: PowerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Recurse into subdirectories (spec §6, default true).
    #[serde(default = "default_true")]
    pub include_subdirectories: bool,

    /// Skip photo-library cache subpaths (Cache/, Proxies/, Thumbnails/, *Previews.lrdata/).
    #[serde(default)]
    pub exclude_cache_files: bool,

    /// Inclusion set for the Scanner's file classifier.
    #[serde(default)]
    pub file_type_filter: FileTypeFilter,

    /// Hard cap on traversal depth (spec §4.3).
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include_subdirectories: true,
            exclude_cache_files: false,
            file_type_filter: FileTypeFilter::All,
            max_depth: default_max_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateConfig {
    #[serde(default)]
    pub skip_exact_duplicates: bool,
    #[serde(default)]
    pub skip_renamed_duplicates: bool,
    /// Caller-configurable bound on how deep the DuplicateDetector walks a
    /// destination when looking for renamed duplicates (spec §9 open question).
    #[serde(default = "default_duplicate_scan_depth")]
    pub scan_depth: usize,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            skip_exact_duplicates: false,
            skip_renamed_duplicates: false,
            scan_depth: default_duplicate_scan_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Per-run destination subfolder (may embed a timestamp).
    #[serde(default)]
    pub organization_name: String,

    /// Worker pool size bounds per destination class (spec §4.5).
    #[serde(default = "default_local_workers")]
    pub local_workers: usize,
    #[serde(default = "default_external_workers")]
    pub external_workers: usize,
    #[serde(default = "default_network_workers")]
    pub network_workers: usize,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            organization_name: String::new(),
            local_workers: default_local_workers(),
            external_workers: default_external_workers(),
            network_workers: default_network_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_io_timeout_seconds")]
    pub io_timeout_seconds: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            io_timeout_seconds: default_io_timeout_seconds(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Path to the durable session/event log database.
    #[serde(default = "default_eventlog_path")]
    pub db_path: PathBuf,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            db_path: default_eventlog_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    /// Request the host's `hold_awake` hook during the session (spec §6).
    #[serde(default)]
    pub prevent_sleep: bool,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            prevent_sleep: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_depth() -> usize {
    50
}
fn default_duplicate_scan_depth() -> usize {
    50
}
fn default_local_workers() -> usize {
    8
}
fn default_external_workers() -> usize {
    4
}
fn default_network_workers() -> usize {
    1
}
fn default_max_retries() -> u32 {
    3
}
fn default_io_timeout_seconds() -> u64 {
    30
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_retry_cap_ms() -> u64 {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_eventlog_path() -> PathBuf {
    PathBuf::from("imageintact-events.sqlite3")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            duplicate: DuplicateConfig::default(),
            destination: DestinationConfig::default(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
            eventlog: EventLogConfig::default(),
            power: PowerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = Config::default();
        assert!(cfg.scan.include_subdirectories);
        assert!(!cfg.scan.exclude_cache_files);
        assert_eq!(cfg.scan.max_depth, 50);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.io_timeout_seconds, 30);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
            [scan]
            exclude_cache_files = true

            [duplicate]
            skip_exact_duplicates = true

            [destination]

            [retry]

            [log]

            [eventlog]

            [power]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.scan.exclude_cache_files);
        assert!(config.scan.include_subdirectories);
        assert!(config.duplicate.skip_exact_duplicates);
        assert_eq!(config.destination.local_workers, 8);
    }
}
