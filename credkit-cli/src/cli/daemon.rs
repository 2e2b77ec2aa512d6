//! Cache daemon entry point and the launcher the cache backend uses to start it

use std::env;
use std::ffi::OsString;

use anyhow::{Context, Result};
use credkit_core::backend::DaemonLauncher;
use credkit_core::{ConfigDirs, HelperConfig};

/// Re-executes this binary as `cache-daemon` with the resolved socket and
/// timeout
pub(super) fn launcher(config: &HelperConfig, dirs: &ConfigDirs) -> Result<DaemonLauncher> {
  let program = env::current_exe().context("Failed to locate the helper executable")?;
  let args: Vec<OsString> = vec![
    "--socket".into(),
    config.socket_path(dirs).into_os_string(),
    "--cache-timeout".into(),
    config.cache.timeout_secs.to_string().into(),
    "cache-daemon".into(),
  ];
  Ok(DaemonLauncher::new(program, args))
}

#[cfg(unix)]
pub(super) fn run(config: &HelperConfig, dirs: &ConfigDirs) -> Result<()> {
  let socket = config.socket_path(dirs);
  credkit_core::backend::daemon::run_daemon(&socket, config.cache_timeout())
    .with_context(|| format!("Cache daemon on {} failed", socket.display()))
}

#[cfg(not(unix))]
pub(super) fn run(_config: &HelperConfig, _dirs: &ConfigDirs) -> Result<()> {
  anyhow::bail!("The cache daemon requires unix domain sockets")
}
