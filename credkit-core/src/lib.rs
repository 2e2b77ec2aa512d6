//! # credkit Core Library
//!
//! Core library for the credkit Git credential helper: the `key=value`
//! record codec, the `get`/`store`/`erase` protocol service, the storage
//! backends (platform keychain, encrypted file, timed cache with its daemon),
//! the environment fallback and configuration loading.

pub mod backend;
pub mod config;
pub mod error;
pub mod fallback;
pub mod protocol;
pub mod record;

// Re-export main types for the CLI
pub use backend::{Backend, BackendKind, open_backend};
pub use config::{ConfigDirs, HelperConfig};
pub use error::{HelperError, Result};
pub use fallback::EnvFallback;
pub use protocol::{Action, HelperService};
pub use record::{Attributes, CredentialKey, CredentialRecord, Secret};
