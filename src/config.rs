use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub query: QueryConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  /// Override for the data directory (defaults to $XDG_DATA_HOME/strainsync)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the catalog API, e.g. https://catalog.example.com/api/
  pub url: Url,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  10
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Version tag for persisted query results; defaults to the crate version
  pub buster: Option<String>,
  /// Persisted results older than this are discarded on restore
  #[serde(default = "default_max_age_hours")]
  pub max_age_hours: u64,
  /// Cached pages younger than this are served without a fetch
  #[serde(default = "default_stale_minutes")]
  pub stale_minutes: u64,
}

/// Upper bound keeping chrono durations in range (a century)
const MAX_HOURS: u64 = 24 * 365 * 100;

fn default_max_age_hours() -> u64 {
  24
}

fn default_stale_minutes() -> u64 {
  5
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      buster: None,
      max_age_hours: default_max_age_hours(),
      stale_minutes: default_stale_minutes(),
    }
  }
}

impl CacheConfig {
  pub fn buster(&self) -> String {
    self
      .buster
      .clone()
      .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
  }

  pub fn max_age(&self) -> chrono::Duration {
    chrono::Duration::hours(self.max_age_hours.min(MAX_HOURS) as i64)
  }

  pub fn stale_time(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.stale_minutes.min(MAX_HOURS * 60) as i64)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  #[serde(default = "default_debounce_ms")]
  pub debounce_ms: u64,
  /// Retries after the first failed remote attempt
  #[serde(default = "default_retry")]
  pub retry: u32,
  #[serde(default = "default_retry_base_ms")]
  pub retry_base_ms: u64,
}

fn default_page_size() -> u32 {
  crate::catalog::DEFAULT_PAGE_SIZE
}

fn default_debounce_ms() -> u64 {
  300
}

fn default_retry() -> u32 {
  2
}

fn default_retry_base_ms() -> u64 {
  1000
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      page_size: default_page_size(),
      debounce_ms: default_debounce_ms(),
      retry: default_retry(),
      retry_base_ms: default_retry_base_ms(),
    }
  }
}

impl QueryConfig {
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }

  pub fn retry_base(&self) -> Duration {
    Duration::from_millis(self.retry_base_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
}

fn default_probe_interval_secs() -> u64 {
  5
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: default_probe_interval_secs(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./strainsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/strainsync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/strainsync/config.yaml\n\
                 with at least `remote: {{ url: https://... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("strainsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("strainsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Directory holding the cache database, catalog database and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("strainsync"))
  }
}
