//! Isolated environments for running the helper binary in tests
//!
//! Each [`HelperTestEnv`] owns a temporary directory holding the XDG
//! directories, a configuration file, the encrypted store and the daemon
//! socket. Environment is applied per command rather than to the test
//! process, so tests can run in parallel.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A per-test helper environment
pub struct HelperTestEnv {
  /// The temporary directory everything lives under
  pub temp_dir: TempDir,
}

impl Default for HelperTestEnv {
  fn default() -> Self {
    Self::new()
  }
}

impl HelperTestEnv {
  /// Variable the test configuration reads the store passphrase from
  pub const PASSPHRASE_ENV: &'static str = "CREDKIT_TEST_PASSPHRASE";
  pub const PASSPHRASE: &'static str = "correct horse battery staple";

  /// Variables that must not leak in from the developer's shell
  pub const CLEARED_VARS: &'static [&'static str] = &[
    "CREDKIT_LOG",
    "CREDKIT_PASSPHRASE",
    "CREDKIT_TOKEN_GITHUB_COM",
    "CREDKIT_TOKEN_GITLAB_COM",
    "GITHUB_PAT",
    "GITHUB_TOKEN",
  ];

  /// Create an environment configured for the encrypted file backend
  pub fn new() -> Self {
    Self::with_backend("file")
  }

  /// Create an environment whose configuration selects `backend`
  pub fn with_backend(backend: &str) -> Self {
    let temp_dir = TempDir::new().expect("Failed to create temporary directory");
    let env = Self { temp_dir };

    for dir in ["config", "data", "cache", "run", "home"] {
      fs::create_dir_all(env.temp_dir.path().join(dir)).expect("Failed to create test directory");
    }
    env.write_config(&env.default_config(backend));
    env
  }

  /// Configuration pointing every path into the temporary directory, with
  /// cheap key derivation so debug builds stay fast
  pub fn default_config(&self, backend: &str) -> String {
    format!(
      r#"backend = "{backend}"
timeout_secs = 60

[cache]
socket = {socket}

[file]
path = {store}
passphrase_env = "{passphrase_env}"

[file.kdf]
memory_kib = 64
iterations = 1
parallelism = 1
"#,
      socket = toml_path(&self.socket_path()),
      store = toml_path(&self.store_path()),
      passphrase_env = Self::PASSPHRASE_ENV,
    )
  }

  /// Replace the configuration file contents
  pub fn write_config(&self, contents: &str) {
    fs::write(self.config_path(), contents).expect("Failed to write test configuration");
  }

  pub fn config_path(&self) -> PathBuf {
    self.temp_dir.path().join("config").join("config.toml")
  }

  pub fn store_path(&self) -> PathBuf {
    self.temp_dir.path().join("data").join("credentials.enc")
  }

  pub fn socket_path(&self) -> PathBuf {
    self.temp_dir.path().join("run").join("daemon.sock")
  }

  /// Variables to set on a helper command
  pub fn envs(&self) -> Vec<(&'static str, OsString)> {
    let root = self.temp_dir.path();
    vec![
      ("HOME", root.join("home").into_os_string()),
      ("XDG_CONFIG_HOME", root.join("config").into_os_string()),
      ("XDG_DATA_HOME", root.join("data").into_os_string()),
      ("XDG_CACHE_HOME", root.join("cache").into_os_string()),
      ("XDG_RUNTIME_DIR", root.join("run").into_os_string()),
      ("CREDKIT_CONFIG", self.config_path().into_os_string()),
      (Self::PASSPHRASE_ENV, OsString::from(Self::PASSPHRASE)),
    ]
  }
}

/// Quote a path as a TOML basic string
fn toml_path(path: &Path) -> String {
  let escaped = path.display().to_string().replace('\\', "\\\\").replace('"', "\\\"");
  format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn paths_live_under_the_temp_dir() {
    let env = HelperTestEnv::new();
    let root = env.temp_dir.path();

    assert!(env.config_path().starts_with(root));
    assert!(env.store_path().starts_with(root));
    assert!(env.socket_path().starts_with(root));
    assert!(env.config_path().exists());
  }

  #[test]
  fn config_selects_requested_backend() {
    let env = HelperTestEnv::with_backend("cache");
    let config = fs::read_to_string(env.config_path()).unwrap();

    assert!(config.starts_with("backend = \"cache\""));
    assert!(config.contains(HelperTestEnv::PASSPHRASE_ENV));
  }

  #[test]
  fn toml_paths_escape_backslashes() {
    assert_eq!(toml_path(Path::new(r"C:\tmp\store")), r#""C:\\tmp\\store""#);
  }
}
