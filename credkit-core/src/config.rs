//! # Configuration Management
//!
//! Loads the helper's TOML configuration and resolves the per-user
//! directories it uses, with XDG base directory support.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{BackendKind, KdfParams, TimedCacheBackend};
use crate::error::{HelperError, Result};

/// Default bound on a single backend call
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 5;

/// Directories the helper reads and writes
#[derive(Debug, Clone)]
pub struct ConfigDirs {
  pub config_dir: PathBuf,
  pub data_dir: PathBuf,
  pub cache_dir: PathBuf,
  /// `$XDG_RUNTIME_DIR/credkit` where the platform has one
  pub runtime_dir: Option<PathBuf>,
}

impl ConfigDirs {
  pub fn new() -> Result<Self> {
    let proj_dirs = ProjectDirs::from("dev", "credkit", "credkit")
      .ok_or_else(|| HelperError::Config("failed to determine project directories".to_string()))?;

    Ok(Self {
      config_dir: proj_dirs.config_dir().to_path_buf(),
      data_dir: proj_dirs.data_dir().to_path_buf(),
      cache_dir: proj_dirs.cache_dir().to_path_buf(),
      runtime_dir: proj_dirs.runtime_dir().map(Path::to_path_buf),
    })
  }

  /// Get the path to the configuration file
  pub fn config_path(&self) -> PathBuf {
    self.config_dir.join("config.toml")
  }

  /// Get the default path of the encrypted credential file
  pub fn store_path(&self) -> PathBuf {
    self.data_dir.join("credentials.enc")
  }

  /// Get the default path of the cache daemon socket
  pub fn socket_path(&self) -> PathBuf {
    self.runtime_dir.as_ref().unwrap_or(&self.cache_dir).join("daemon.sock")
  }
}

/// Top-level helper configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HelperConfig {
  pub backend: BackendKind,
  /// Bound on each backend call, in seconds
  pub timeout_secs: u64,
  pub cache: CacheConfig,
  pub file: FileConfig,
  pub fallback: FallbackConfig,
}

impl Default for HelperConfig {
  fn default() -> Self {
    Self {
      backend: BackendKind::default(),
      timeout_secs: DEFAULT_BACKEND_TIMEOUT_SECS,
      cache: CacheConfig::default(),
      file: FileConfig::default(),
      fallback: FallbackConfig::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
  /// Lifetime of cached entries, in seconds
  pub timeout_secs: u64,
  /// Daemon socket, defaulting to the runtime directory
  pub socket: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      timeout_secs: TimedCacheBackend::DEFAULT_TIMEOUT.as_secs(),
      socket: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
  /// Location of the encrypted store, defaulting to the data directory
  pub path: Option<PathBuf>,
  /// Environment variable holding the store passphrase
  pub passphrase_env: String,
  pub kdf: KdfParams,
}

impl FileConfig {
  pub fn kdf_params(&self) -> KdfParams {
    self.kdf
  }
}

impl Default for FileConfig {
  fn default() -> Self {
    Self {
      path: None,
      passphrase_env: "CREDKIT_PASSPHRASE".to_string(),
      kdf: KdfParams::default(),
    }
  }
}

/// Where `get` looks when the backend has nothing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackConfig {
  pub enabled: bool,
  /// Variables consulted, in order, for the hosts below
  pub vars: Vec<String>,
  pub hosts: Vec<String>,
  /// Username reported alongside a fallback token
  pub username: String,
}

impl Default for FallbackConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      vars: vec!["GITHUB_PAT".to_string(), "GITHUB_TOKEN".to_string()],
      hosts: vec!["github.com".to_string()],
      username: "PersonalAccessToken".to_string(),
    }
  }
}

impl HelperConfig {
  /// Load configuration from `path`, or defaults when the file does not exist
  pub fn load(path: &Path) -> Result<Self> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == ErrorKind::NotFound => {
        debug!(path = %path.display(), "No configuration file, using defaults");
        return Ok(Self::default());
      }
      Err(e) => return Err(HelperError::Config(format!("failed to read {}: {e}", path.display()))),
    };

    toml::from_str(&content).map_err(|e| HelperError::Config(format!("failed to parse {}: {e}", path.display())))
  }

  pub fn backend_timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }

  pub fn cache_timeout(&self) -> Duration {
    Duration::from_secs(self.cache.timeout_secs)
  }

  /// Encrypted store location, with `~/` expanded
  pub fn file_path(&self, dirs: &ConfigDirs) -> PathBuf {
    self.file.path.as_deref().map(expand_home).unwrap_or_else(|| dirs.store_path())
  }

  /// Cache daemon socket location, with `~/` expanded
  pub fn socket_path(&self, dirs: &ConfigDirs) -> PathBuf {
    self.cache.socket.as_deref().map(expand_home).unwrap_or_else(|| dirs.socket_path())
  }
}

fn expand_home(path: &Path) -> PathBuf {
  match (path.strip_prefix("~"), BaseDirs::new()) {
    (Ok(rest), Some(base)) => base.home_dir().join(rest),
    _ => path.to_path_buf(),
  }
}
