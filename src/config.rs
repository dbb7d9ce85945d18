use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::LabelMapping;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL every request path is joined onto
  pub base_url: String,
  /// User-Agent header (some APIs reject requests without one)
  #[serde(default = "default_user_agent")]
  pub user_agent: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "https://api.github.com".to_string(),
      user_agent: default_user_agent(),
    }
  }
}

fn default_user_agent() -> String {
  "hubcache".to_string()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
  Memory,
  File,
  Sqlite,
  /// In-memory layer in front of SQLite
  #[default]
  Tiered,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
  #[serde(default)]
  pub backend: BackendKind,
  /// Backing file for file/sqlite/tiered backends (defaults under the data dir)
  pub path: Option<PathBuf>,
  /// Seconds before a cached value expires; 0 disables expiry
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      backend: BackendKind::default(),
      path: None,
      ttl_secs: default_ttl_secs(),
    }
  }
}

fn default_ttl_secs() -> u64 {
  3600
}

impl CacheConfig {
  pub fn ttl(&self) -> Option<Duration> {
    (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_page_size")]
  pub page_size: usize,
  /// Labels the sync is allowed to add or remove
  #[serde(default)]
  pub managed_labels: BTreeSet<String>,
  /// Source signal (e.g. a priority name) to the labels it should produce
  #[serde(default)]
  pub mapping: BTreeMap<String, BTreeSet<String>>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      page_size: default_page_size(),
      managed_labels: BTreeSet::new(),
      mapping: BTreeMap::new(),
    }
  }
}

fn default_page_size() -> usize {
  50
}

impl SyncConfig {
  pub fn label_mapping(&self) -> Result<LabelMapping> {
    LabelMapping::new(self.managed_labels.clone(), self.mapping.clone())
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hubcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hubcache/config.yaml
  ///
  /// With no file found, defaults are used.
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
    let local = PathBuf::from("hubcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hubcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.sync.page_size == 0 {
      return Err(eyre!("sync.page_size must be at least 1"));
    }
    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks HUBCACHE_TOKEN first, then GITHUB_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("HUBCACHE_TOKEN")
      .or_else(|_| std::env::var("GITHUB_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set HUBCACHE_TOKEN or GITHUB_TOKEN environment variable.")
      })
  }
}

/// Per-user data directory for cache files, checkpoints and logs.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("hubcache"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_when_sections_missing() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.cache.backend, BackendKind::Tiered);
    assert_eq!(config.cache.ttl(), Some(Duration::from_secs(3600)));
    assert_eq!(config.sync.page_size, 50);
    assert_eq!(config.api.base_url, "https://api.github.com");
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  base_url: https://api.example.test
cache:
  backend: sqlite
  path: /tmp/hubcache-test/cache.db
  ttl_secs: 0
sync:
  page_size: 10
  managed_labels: [High-Priority, Medium-Priority, Low-Priority]
  mapping:
    High: [High-Priority]
    Medium: [Medium-Priority]
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.cache.backend, BackendKind::Sqlite);
    assert_eq!(config.cache.ttl(), None);
    assert_eq!(config.api.user_agent, "hubcache");
    assert_eq!(config.sync.page_size, 10);

    let mapping = config.sync.label_mapping().unwrap();
    assert!(mapping.is_managed("Low-Priority"));
    assert_eq!(
      mapping.desired_for("High").cloned(),
      Some(BTreeSet::from(["High-Priority".to_string()]))
    );
  }

  #[test]
  fn test_rejects_zero_page_size() {
    assert!(Config::parse("sync:\n  page_size: 0\n").is_err());
  }

  #[test]
  fn test_rejects_unknown_backend() {
    assert!(Config::parse("cache:\n  backend: redis\n").is_err());
  }
}
