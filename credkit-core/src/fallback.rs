//! Environment-variable fallback for `get`.
//!
//! Consulted only when the backend has nothing for the requested key. Values
//! come from `CREDKIT_TOKEN_<HOST>` first, then from the configured variables
//! for the configured hosts over HTTPS. Nothing here is ever written by
//! `store`.

use std::env;
use std::sync::Arc;

use tracing::debug;

use crate::config::FallbackConfig;
use crate::record::{CredentialRecord, Secret};

/// Prefix of the per-host token variable
pub const HOST_VARIABLE_PREFIX: &str = "CREDKIT_TOKEN_";

type VarSource = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves fallback tokens from the process environment
#[derive(Clone)]
pub struct EnvFallback {
  config: FallbackConfig,
  source: VarSource,
}

impl EnvFallback {
  pub fn new(config: FallbackConfig) -> Self {
    Self {
      config,
      source: Arc::new(|name| env::var(name).ok()),
    }
  }

  /// Read variables through `source` instead of the process environment
  pub fn with_source(mut self, source: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
    self.source = Arc::new(source);
    self
  }

  /// Per-host variable name: `github.com:8443` becomes
  /// `CREDKIT_TOKEN_GITHUB_COM_8443`
  pub fn host_variable(host: &str) -> String {
    let suffix: String = host
      .chars()
      .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
      .collect();
    format!("{HOST_VARIABLE_PREFIX}{suffix}")
  }

  /// Build a record for `query` from the environment, if a token is set
  pub fn resolve(&self, query: &CredentialRecord) -> Option<CredentialRecord> {
    if !self.config.enabled {
      return None;
    }

    let host = query.host.to_ascii_lowercase();
    let mut candidates = vec![Self::host_variable(&host)];
    let listed = self.config.hosts.iter().any(|h| h.eq_ignore_ascii_case(&host));
    if listed && query.protocol.eq_ignore_ascii_case("https") {
      candidates.extend(self.config.vars.iter().cloned());
    }

    let (variable, token) = candidates
      .into_iter()
      .find_map(|name| (self.source)(&name).filter(|v| !v.is_empty()).map(|v| (name, v)))?;
    debug!(variable = %variable, host = %host, "Using fallback token from environment");

    let username = query.username.clone().unwrap_or_else(|| self.config.username.clone());
    Some(CredentialRecord {
      protocol: query.protocol.clone(),
      host: query.host.clone(),
      path: query.path.clone(),
      username: Some(username),
      secret: Some(Secret::new(token)),
      password_expiry_utc: None,
    })
  }
}
