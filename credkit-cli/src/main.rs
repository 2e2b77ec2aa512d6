//! # credkit Entry Point
//!
//! The `git-credential-credkit` binary. Git runs it as
//! `git credential-credkit <action>` and talks to it over stdin/stdout, so
//! every diagnostic goes to stderr.

use std::io;

use anyhow::Result;
use clap::Parser;
use credkit_cli::cli::{self, handle_cli};
use credkit_cli::consts::ENV_LOG;
use tracing::debug;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

fn main() -> Result<()> {
  let cmd = cli::Cli::parse();

  // Set up tracing based on verbosity level
  let level = match cmd.verbose {
    0 => tracing::Level::WARN,  // Default: warnings and errors
    1 => tracing::Level::INFO,  // -v: info, warnings, and errors
    2 => tracing::Level::DEBUG, // -vv: debug, info, warnings, and errors
    _ => tracing::Level::TRACE, // -vvv or more: trace and everything else
  };

  // stdout carries the protocol response
  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(
      EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var(ENV_LOG)
        .from_env_lossy(),
    )
    .init();

  debug!("Tracing initialized with level: {}", level);

  handle_cli(cmd)
}
