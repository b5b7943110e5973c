use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheConfig, CacheStrategy, EvictionPolicy};
use crate::executor::{ExecutorConfig, RetryPolicy};
use crate::offline::OfflineConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheSection,
  #[serde(default)]
  pub executor: ExecutorSection,
  #[serde(default)]
  pub offline: OfflineSection,
  /// Optional log file; logs go to stderr only when unset
  pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
  pub strategy: CacheStrategy,
  pub eviction_policy: EvictionPolicy,
  pub max_size: usize,
  pub max_memory_size: u64,
  pub max_disk_size: u64,
  /// Seconds; 0 disables expiry
  pub default_ttl_secs: u64,
  /// Seconds; 0 disables the periodic sweep
  pub cleanup_interval_secs: u64,
  pub compression: bool,
  pub encryption: bool,
  pub key_prefix: String,
  /// Disk tier location (default: $XDG_CACHE_HOME/offline-store)
  pub directory: Option<PathBuf>,
}

impl Default for CacheSection {
  fn default() -> Self {
    let defaults = CacheConfig::default();
    Self {
      strategy: defaults.strategy,
      eviction_policy: defaults.eviction_policy,
      max_size: defaults.max_size,
      max_memory_size: defaults.max_memory_size,
      max_disk_size: defaults.max_disk_size,
      default_ttl_secs: defaults.default_ttl.as_secs(),
      cleanup_interval_secs: defaults.cleanup_interval.as_secs(),
      compression: defaults.enable_compression,
      encryption: defaults.enable_encryption,
      key_prefix: defaults.key_prefix,
      directory: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
  pub max_concurrent_tasks: usize,
  pub base_backoff_ms: u64,
  pub max_backoff_ms: u64,
  pub default_max_retries: u32,
  pub max_finished_tasks: usize,
}

impl Default for ExecutorSection {
  fn default() -> Self {
    let defaults = ExecutorConfig::default();
    Self {
      max_concurrent_tasks: defaults.max_concurrent_tasks,
      base_backoff_ms: defaults.retry.base.as_millis() as u64,
      max_backoff_ms: defaults.retry.max.as_millis() as u64,
      default_max_retries: defaults.default_max_retries,
      max_finished_tasks: defaults.max_finished_tasks,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineSection {
  pub max_retry_count: u32,
  pub retry_base_secs: u64,
  pub retry_max_secs: u64,
}

impl Default for OfflineSection {
  fn default() -> Self {
    let defaults = OfflineConfig::default();
    Self {
      max_retry_count: defaults.max_retry_count,
      retry_base_secs: defaults.retry.base.as_secs(),
      retry_max_secs: defaults.retry.max.as_secs(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-store.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-store/config.yaml
  ///
  /// Falls back to defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-store.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-store").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes to unit, not to an empty mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Validated cache configuration.
  pub fn cache_config(&self) -> Result<CacheConfig> {
    let section = &self.cache;
    let config = CacheConfig {
      strategy: section.strategy,
      eviction_policy: section.eviction_policy,
      max_size: section.max_size,
      max_memory_size: section.max_memory_size,
      max_disk_size: section.max_disk_size,
      default_ttl: Duration::from_secs(section.default_ttl_secs),
      cleanup_interval: Duration::from_secs(section.cleanup_interval_secs),
      enable_compression: section.compression,
      enable_encryption: section.encryption,
      key_prefix: section.key_prefix.clone(),
    };
    config.validate()?;
    Ok(config)
  }

  /// Directory for the disk tier.
  pub fn cache_dir(&self) -> PathBuf {
    if let Some(dir) = &self.cache.directory {
      return dir.clone();
    }
    dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|home| home.join(".cache")))
      .unwrap_or_else(|| PathBuf::from(".cache"))
      .join("offline-store")
  }

  pub fn executor_config(&self) -> ExecutorConfig {
    ExecutorConfig {
      max_concurrent_tasks: self.executor.max_concurrent_tasks.max(1),
      retry: RetryPolicy::new(
        Duration::from_millis(self.executor.base_backoff_ms),
        Duration::from_millis(self.executor.max_backoff_ms),
      ),
      default_max_retries: self.executor.default_max_retries,
      max_finished_tasks: self.executor.max_finished_tasks,
    }
  }

  pub fn offline_config(&self) -> OfflineConfig {
    OfflineConfig {
      max_retry_count: self.offline.max_retry_count,
      retry: RetryPolicy::new(
        Duration::from_secs(self.offline.retry_base_secs),
        Duration::from_secs(self.offline.retry_max_secs),
      ),
    }
  }
}
