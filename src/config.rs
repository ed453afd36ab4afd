//! Configuration management with YAML support

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub pacing: PacingConfig,

    #[serde(default)]
    pub collect: CollectConfig,
}

/// Data directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: String,
}

/// Chat API transport configuration. Session acquisition happens out of
/// band; only the resulting token is carried here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API root, e.g. "https://api.example.com/v2"
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub session_token: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Request pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Base randomized delay between page requests
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Minimum spacing between requests across all workers
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Chance of an extra "reading" pause on top of the base delay
    #[serde(default = "default_pause_chance")]
    pub pause_chance: f64,

    #[serde(default = "default_pause_min_ms")]
    pub pause_min_ms: u64,

    #[serde(default = "default_pause_max_ms")]
    pub pause_max_ms: u64,

    /// Chance of a much longer session break
    #[serde(default = "default_break_chance")]
    pub break_chance: f64,

    #[serde(default = "default_break_min_ms")]
    pub break_min_ms: u64,

    #[serde(default = "default_break_max_ms")]
    pub break_max_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

/// Collection run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectConfig {
    /// Concurrent per-conversation workers; the rate budget is shared, so
    /// this stays small
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consecutive pages without a new record before giving up
    #[serde(default = "default_empty_page_limit")]
    pub empty_page_limit: u32,

    /// Wall-clock budget for a single conversation's messages
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

// Default value functions
fn default_data_dir() -> String {
    "data".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_min_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_min_interval_ms() -> u64 {
    1_000
}

fn default_pause_chance() -> f64 {
    0.2
}

fn default_pause_min_ms() -> u64 {
    2_000
}

fn default_pause_max_ms() -> u64 {
    4_000
}

fn default_break_chance() -> f64 {
    0.05
}

fn default_break_min_ms() -> u64 {
    10_000
}

fn default_break_max_ms() -> u64 {
    30_000
}

fn default_backoff_base_ms() -> u64 {
    5_000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_workers() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_empty_page_limit() -> u32 {
    3
}

fn default_task_timeout_secs() -> u64 {
    600
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            session_token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            min_interval_ms: default_min_interval_ms(),
            pause_chance: default_pause_chance(),
            pause_min_ms: default_pause_min_ms(),
            pause_max_ms: default_pause_max_ms(),
            break_chance: default_break_chance(),
            break_min_ms: default_break_min_ms(),
            break_max_ms: default_break_max_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            empty_page_limit: default_empty_page_limit(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./corral.yaml (current directory)
    /// 3. ~/.config/corral/corral.yaml
    pub fn load(path: &str) -> Result<Self> {
        let search_paths = vec![
            shellexpand::tilde(path).to_string(),
            "corral.yaml".to_string(),
            shellexpand::tilde("~/.config/corral/corral.yaml").to_string(),
        ];

        for search_path in &search_paths {
            if std::path::Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path)?;
                let config: Config = serde_yaml::from_str(&content)?;
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Get the data directory, expanding ~ to home directory
    pub fn data_dir(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.data.dir).to_string();
        PathBuf::from(expanded)
    }
}

#[cfg(test)]
impl PacingConfig {
    /// Zero-delay pacing so tests never sleep.
    pub fn immediate() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
            min_interval_ms: 0,
            pause_chance: 0.0,
            pause_min_ms: 0,
            pause_max_ms: 0,
            break_chance: 0.0,
            break_min_ms: 0,
            break_max_ms: 0,
            backoff_base_ms: 0,
            backoff_cap_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data.dir, "data");
        assert_eq!(config.collect.workers, 1);
        assert_eq!(config.pacing.min_delay_ms, 2_000);
        assert_eq!(config.pacing.backoff_cap_ms, 60_000);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
data:
  dir: ~/corral-data

api:
  base_url: https://api.example.com/v2
  session_token: s3cret

pacing:
  min_delay_ms: 100
  max_delay_ms: 200

collect:
  workers: 3
  empty_page_limit: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.api.base_url, "https://api.example.com/v2");
        assert_eq!(config.api.session_token.as_deref(), Some("s3cret"));
        assert_eq!(config.pacing.min_delay_ms, 100);
        // Unset fields keep their defaults
        assert_eq!(config.pacing.break_chance, 0.05);
        assert_eq!(config.collect.workers, 3);
        assert_eq!(config.collect.max_retries, 3);
    }
}
