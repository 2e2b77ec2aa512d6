//! Protocol actions over stdin and stdout

use std::io;

use anyhow::{Context, Result};
use credkit_core::backend::BackendKind;
use credkit_core::{Action, ConfigDirs, EnvFallback, HelperConfig, HelperService, open_backend};
use tracing::debug;

use super::daemon;

/// Run one helper action against the configured backend
pub(super) fn run(action: Action, config: &HelperConfig, dirs: &ConfigDirs) -> Result<()> {
  let launcher = match config.backend.resolve() {
    BackendKind::Cache => Some(daemon::launcher(config, dirs)?),
    _ => None,
  };
  let backend = open_backend(config, dirs, launcher).context("Failed to open credential backend")?;
  debug!(action = %action, backend = backend.name(), "Handling credential request");

  let service =
    HelperService::new(backend, config.backend_timeout()).with_fallback(EnvFallback::new(config.fallback.clone()));

  service
    .handle(action, io::stdin().lock(), io::stdout().lock())
    .with_context(|| format!("Credential {action} failed"))
}
