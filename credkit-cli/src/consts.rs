//! Constants for the credkit CLI
//!
//! Environment variable names and static strings used by the helper binary.

/// Environment variable holding `tracing` filter directives
pub const ENV_LOG: &str = "CREDKIT_LOG";

/// Environment variable naming the configuration file
pub const ENV_CONFIG: &str = "CREDKIT_CONFIG";

/// Name Git finds the helper under (`git credential-credkit`)
pub const BINARY_NAME: &str = "git-credential-credkit";

/// Version string with commit and target, for `--version`
pub const LONG_VERSION: &str = concat!(
  env!("CARGO_PKG_VERSION"),
  " (",
  env!("GIT_HASH"),
  " ",
  env!("TARGET"),
  ")"
);
