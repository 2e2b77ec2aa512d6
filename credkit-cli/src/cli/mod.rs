//! # Command Line Interface
//!
//! Defines the CLI structure of the credential helper: the protocol actions
//! Git sends, the hidden cache daemon entry point, and the flags that
//! override configuration file values.

mod daemon;
mod helper;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use credkit_core::{Action, BackendKind, ConfigDirs, HelperConfig};
use tracing::debug;

use crate::consts::{BINARY_NAME, ENV_CONFIG, LONG_VERSION};

/// Top-level CLI command for the credential helper
#[derive(Parser)]
#[command(name = BINARY_NAME)]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
#[command(about = "Git credential helper for personal access tokens")]
#[command(
  long_about = "Stores personal access tokens for HTTPS remotes and hands them back to Git.\n\n\
        Git runs this helper as `git credential-credkit <get|store|erase>` and exchanges\n\
        key=value lines over stdin and stdout. Tokens are kept in the platform keychain,\n\
        an encrypted file, or an in-memory cache with expiry."
)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_version = LONG_VERSION)]
#[command(subcommand_required(true))]
#[command(disable_help_subcommand = true)]
#[command(max_term_width = 120)]
pub struct Cli {
  /// Sets the level of verbosity (can be used multiple times)
  #[arg(
    short = 'v',
    long = "verbose",
    action = ArgAction::Count,
    global = true,
    long_help = "Sets the level of verbosity for tracing and logging output.\n\n\
             -v: Show info level messages\n\
             -vv: Show debug level messages\n\
             -vvv: Show trace level messages"
  )]
  pub verbose: u8,

  /// Configuration file to read instead of the default location
  #[arg(long, value_name = "FILE", env = ENV_CONFIG, global = true)]
  pub config: Option<PathBuf>,

  /// Where credentials are kept
  #[arg(long, value_enum, ignore_case = true, global = true)]
  pub backend: Option<BackendKind>,

  /// Give up on a backend call after this many seconds
  #[arg(long, value_name = "SECS", global = true)]
  pub timeout: Option<u64>,

  /// How long the cache backend keeps a credential, in seconds
  #[arg(long, value_name = "SECS", global = true)]
  pub cache_timeout: Option<u64>,

  /// Socket of the cache daemon
  #[arg(long, value_name = "PATH", global = true)]
  pub socket: Option<PathBuf>,

  /// Subcommands
  #[command(subcommand)]
  pub command: Commands,
}

/// Actions understood by the helper
#[derive(Subcommand)]
pub enum Commands {
  /// Print the stored credential matching the request on stdin
  Get,

  /// Save the credential on stdin
  Store,

  /// Remove the credential matching the request on stdin
  Erase,

  /// Hold cached credentials in memory for cache mode
  #[command(hide = true)]
  CacheDaemon,

  /// Actions added by newer Git versions, ignored
  #[command(external_subcommand)]
  Other(Vec<String>),
}

impl Cli {
  /// Load the configuration file and apply flag overrides
  fn resolve_config(&self, dirs: &ConfigDirs) -> Result<HelperConfig> {
    let path = self.config.clone().unwrap_or_else(|| dirs.config_path());
    let mut config =
      HelperConfig::load(&path).with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    if let Some(backend) = self.backend {
      config.backend = backend;
    }
    if let Some(timeout) = self.timeout {
      config.timeout_secs = timeout;
    }
    if let Some(cache_timeout) = self.cache_timeout {
      config.cache.timeout_secs = cache_timeout;
    }
    if let Some(socket) = &self.socket {
      config.cache.socket = Some(socket.clone());
    }
    Ok(config)
  }
}

pub fn handle_cli(cli: Cli) -> Result<()> {
  let action = match &cli.command {
    Commands::Get => Action::Get,
    Commands::Store => Action::Store,
    Commands::Erase => Action::Erase,
    Commands::CacheDaemon => {
      let dirs = ConfigDirs::new()?;
      let config = cli.resolve_config(&dirs)?;
      return daemon::run(&config, &dirs);
    }
    Commands::Other(args) => {
      debug!(action = args.first().map(String::as_str).unwrap_or_default(), "Ignoring unsupported action");
      return Ok(());
    }
  };

  let dirs = ConfigDirs::new()?;
  let config = cli.resolve_config(&dirs)?;
  helper::run(action, &config, &dirs)
}
