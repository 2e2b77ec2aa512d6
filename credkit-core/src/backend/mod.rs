//! # Credential Backends
//!
//! Persistence behind the helper, keyed by `(protocol, host, path?)`. One
//! backend is selected per process from configuration.

pub mod cache;
pub mod daemon;
pub mod file;
pub mod keychain;

use std::sync::Arc;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigDirs, HelperConfig};
use crate::error::Result;
use crate::record::{CredentialKey, CredentialRecord, Secret};

pub use cache::TimedCacheBackend;
#[cfg(unix)]
pub use daemon::CacheClientBackend;
pub use daemon::DaemonLauncher;
pub use file::{EncryptedFileBackend, KdfParams, KeySource};
pub use keychain::KeychainBackend;

/// Storage capability shared by every backend
pub trait Backend: Send + Sync {
  /// Short name used in logs and error messages
  fn name(&self) -> &'static str;

  /// Look up the record stored under `key`
  fn get(&self, key: &CredentialKey) -> Result<Option<CredentialRecord>>;

  /// Persist `record`, replacing anything stored under the same key
  fn store(&self, record: &CredentialRecord) -> Result<()>;

  /// Remove whatever is stored under `key`. Absent keys are not an error.
  fn erase(&self, key: &CredentialKey) -> Result<()>;
}

/// Which backend the helper should use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
  /// Keychain on macOS and Windows, encrypted file elsewhere
  #[default]
  Auto,
  /// Platform keychain (macOS Keychain, Windows Credential Manager, Linux
  /// kernel keyring)
  Keychain,
  /// AES-256-GCM encrypted file
  File,
  /// In-memory cache held by a background daemon
  Cache,
}

impl BackendKind {
  /// Replace `Auto` with the concrete backend for this platform
  pub fn resolve(self) -> Self {
    match self {
      Self::Auto if cfg!(any(target_os = "macos", target_os = "windows")) => Self::Keychain,
      Self::Auto => Self::File,
      other => other,
    }
  }
}

/// Construct the configured backend.
///
/// `launcher` is used by the cache backend to start its daemon on the first
/// `store`.
pub fn open_backend(
  config: &HelperConfig,
  dirs: &ConfigDirs,
  launcher: Option<DaemonLauncher>,
) -> Result<Arc<dyn Backend>> {
  match config.backend.resolve() {
    BackendKind::Keychain => Ok(Arc::new(KeychainBackend::new(KeychainBackend::DEFAULT_SERVICE))),
    BackendKind::File | BackendKind::Auto => {
      let path = config.file_path(dirs);
      let key_source = match std::env::var(&config.file.passphrase_env) {
        Ok(passphrase) if !passphrase.is_empty() => KeySource::Passphrase(Secret::new(passphrase)),
        _ => KeySource::KeyFile(path.with_extension("key")),
      };
      let backend = EncryptedFileBackend::new(path, key_source).with_kdf_params(config.file.kdf_params());
      Ok(Arc::new(backend))
    }
    BackendKind::Cache => open_cache_backend(config, dirs, launcher),
  }
}

#[cfg(unix)]
fn open_cache_backend(
  config: &HelperConfig,
  dirs: &ConfigDirs,
  launcher: Option<DaemonLauncher>,
) -> Result<Arc<dyn Backend>> {
  let mut backend = CacheClientBackend::new(config.socket_path(dirs), config.cache_timeout(), config.backend_timeout());
  if let Some(launcher) = launcher {
    backend = backend.with_launcher(launcher);
  }
  Ok(Arc::new(backend))
}

#[cfg(not(unix))]
fn open_cache_backend(
  _config: &HelperConfig,
  _dirs: &ConfigDirs,
  _launcher: Option<DaemonLauncher>,
) -> Result<Arc<dyn Backend>> {
  Err(crate::error::HelperError::unavailable(
    "cache",
    "the cache daemon requires unix domain sockets",
  ))
}

/// Serialized form of a record in persistent backends. The secret is required.
/// Fields keep the caller's spelling; only the lookup key is normalized.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredCredential {
  protocol: String,
  host: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  username: Option<String>,
  password: Secret,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  password_expiry_utc: Option<i64>,
}

impl StoredCredential {
  pub(crate) fn from_record(record: &CredentialRecord) -> Result<Self> {
    Ok(Self {
      protocol: record.protocol.clone(),
      host: record.host.clone(),
      path: record.path.clone().filter(|p| !p.is_empty()),
      username: record.username.clone(),
      password: record.require_secret()?.clone(),
      password_expiry_utc: record.password_expiry_utc,
    })
  }

  pub(crate) fn into_record(self) -> CredentialRecord {
    CredentialRecord {
      protocol: self.protocol,
      host: self.host,
      path: self.path,
      username: self.username,
      secret: Some(self.password),
      password_expiry_utc: self.password_expiry_utc,
    }
  }
}

/// Describe a JSON decoding failure without echoing any of the input, which
/// may contain a token.
pub(crate) fn describe_json_error(error: &serde_json::Error) -> String {
  format!(
    "{:?} error at line {} column {}",
    error.classify(),
    error.line(),
    error.column()
  )
}
