use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::transport::{Backoff, RetryPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  /// Override for the state database location (default:
  /// $XDG_DATA_HOME/donepin/state.db)
  pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  /// Attempts per request, including the first
  pub retry_count: u32,
  pub retry_delay_ms: u64,
  pub timeout_ms: u64,
  pub backoff: BackoffKind,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
  #[default]
  Fixed,
  Exponential,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000/api".to_string(),
      retry_count: 3,
      retry_delay_ms: 1000,
      timeout_ms: 30_000,
      backoff: BackoffKind::Fixed,
    }
  }
}

impl ApiConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.retry_count,
      delay: Duration::from_millis(self.retry_delay_ms),
      backoff: match self.backoff {
        BackoffKind::Fixed => Backoff::Fixed,
        BackoffKind::Exponential => Backoff::Exponential,
      },
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./donepin.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/donepin/config.yaml
  ///
  /// Every setting has a sensible default, so a missing config file just
  /// means defaults.
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
      None => Ok(Config::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("donepin.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("donepin").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.api.base_url, "http://localhost:3000/api");
    let policy = config.api.retry_policy();
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.delay, Duration::from_millis(1000));
    assert_eq!(policy.backoff, Backoff::Fixed);
  }

  #[test]
  fn test_parse_yaml_with_overrides() {
    let yaml = r#"
api:
  base_url: https://api.example.com/v1
  retry_count: 5
  backoff: exponential
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.api.base_url, "https://api.example.com/v1");
    assert_eq!(config.api.retry_count, 5);
    assert_eq!(config.api.backoff, BackoffKind::Exponential);
    // Unset fields keep their defaults
    assert_eq!(config.api.retry_delay_ms, 1000);
  }
}
