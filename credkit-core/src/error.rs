//! # Helper Errors
//!
//! Error taxonomy shared by the record codec, the protocol handler and every
//! storage backend. Messages never carry secret values.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by credential helper operations
#[derive(Debug, Error)]
pub enum HelperError {
  /// The input stream violates the `key=value` format or omits required keys
  #[error("malformed credential input: {0}")]
  MalformedInput(String),

  /// The underlying store could not be reached (locked keychain, permission
  /// denied, daemon not running)
  #[error("credential backend '{backend}' unavailable: {reason}")]
  BackendUnavailable { backend: &'static str, reason: String },

  /// Persisted data could not be decoded. Backends recover from this locally.
  #[error("credential store is corrupt: {0}")]
  CorruptStore(String),

  /// A backend call did not finish within the configured bound
  #[error("credential backend '{backend}' did not respond within {limit:?}")]
  BackendTimeout { backend: &'static str, limit: Duration },

  /// The configuration file could not be read or parsed
  #[error("invalid configuration: {0}")]
  Config(String),

  /// The response could not be written back to the caller
  #[error("failed to write helper response: {0}")]
  Output(#[source] std::io::Error),
}

impl HelperError {
  pub(crate) fn malformed(reason: impl Into<String>) -> Self {
    Self::MalformedInput(reason.into())
  }

  pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
    Self::CorruptStore(reason.into())
  }

  pub(crate) fn unavailable(backend: &'static str, reason: impl ToString) -> Self {
    Self::BackendUnavailable {
      backend,
      reason: reason.to_string(),
    }
  }
}

/// Result alias used throughout credkit-core
pub type Result<T> = std::result::Result<T, HelperError>;
