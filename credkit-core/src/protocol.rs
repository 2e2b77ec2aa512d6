//! # Helper Protocol
//!
//! Executes `get`, `store` and `erase` against the selected backend. Input is
//! parsed and validated in full before any backend call, so malformed input
//! never touches stored state. Every backend call is bounded by a timeout.

use std::fmt;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::{HelperError, Result};
use crate::fallback::EnvFallback;
use crate::record::CredentialRecord;

/// Actions Git sends to a credential helper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  Get,
  Store,
  Erase,
}

impl Action {
  /// Parse an action name. Unknown names yield `None`, since Git may add
  /// actions a helper is expected to ignore.
  pub fn from_name(name: &str) -> Option<Self> {
    match name {
      "get" => Some(Self::Get),
      "store" => Some(Self::Store),
      "erase" => Some(Self::Erase),
      _ => None,
    }
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Get => "get",
      Self::Store => "store",
      Self::Erase => "erase",
    })
  }
}

/// Runs helper actions against one backend
pub struct HelperService {
  backend: Arc<dyn Backend>,
  timeout: Duration,
  fallback: Option<EnvFallback>,
}

impl HelperService {
  pub fn new(backend: Arc<dyn Backend>, timeout: Duration) -> Self {
    Self {
      backend,
      timeout,
      fallback: None,
    }
  }

  /// Consult `fallback` when the backend has nothing for a `get`
  pub fn with_fallback(mut self, fallback: EnvFallback) -> Self {
    self.fallback = Some(fallback);
    self
  }

  pub fn backend_name(&self) -> &'static str {
    self.backend.name()
  }

  /// Parse a request from `input`, run `action`, and write any response to
  /// `output`
  pub fn handle<R: BufRead, W: Write>(&self, action: Action, input: R, mut output: W) -> Result<()> {
    let request = CredentialRecord::parse(input)?;

    match action {
      Action::Get => {
        if let Some(found) = self.get(&request)? {
          found.write_to(&mut output).map_err(HelperError::Output)?;
        }
        Ok(())
      }
      Action::Store => self.store(&request),
      Action::Erase => self.erase(&request),
    }
  }

  /// Stored record for `query`, or the environment fallback when the backend
  /// has nothing usable
  pub fn get(&self, query: &CredentialRecord) -> Result<Option<CredentialRecord>> {
    let key = query.key();
    let lookup = key.clone();
    let stored = self.bounded(move |backend| backend.get(&lookup))?;

    let usable = stored.filter(|found| {
      if found.is_expired() {
        debug!(key = %key, "Stored credential has expired");
        return false;
      }
      found.matches_username(query)
    });

    match usable {
      Some(found) => {
        debug!(key = %key, backend = self.backend_name(), "Found stored credential");
        Ok(Some(found))
      }
      None => Ok(self.fallback.as_ref().and_then(|fallback| fallback.resolve(query))),
    }
  }

  /// Persist `record`, replacing any record under the same key
  pub fn store(&self, record: &CredentialRecord) -> Result<()> {
    record.require_secret()?;
    if record.is_expired() {
      debug!(key = %record.key(), "Not storing an already expired credential");
      return Ok(());
    }

    let to_store = record.clone();
    self.bounded(move |backend| backend.store(&to_store))?;
    info!(key = %record.key(), backend = self.backend_name(), "Stored credential");
    Ok(())
  }

  /// Remove the record matching `query`. A username or password in the query
  /// must match the stored record.
  pub fn erase(&self, query: &CredentialRecord) -> Result<()> {
    let key = query.key();
    let constrained = query.username.is_some() || query.secret.is_some();
    let criteria = query.clone();

    let erased = self.bounded(move |backend| {
      if constrained {
        let matches = backend
          .get(&key)?
          .is_some_and(|found| found.matches_username(&criteria) && secret_matches(&found, &criteria));
        if !matches {
          return Ok(false);
        }
      }
      backend.erase(&key).map(|()| true)
    })?;

    if erased {
      info!(key = %query.key(), backend = self.backend_name(), "Erased credential");
    } else {
      debug!(key = %query.key(), "No matching credential to erase");
    }
    Ok(())
  }

  /// Run `op` on a blocking thread, giving up after the configured timeout.
  /// A task that overruns is left to finish in the background.
  fn bounded<T, F>(&self, op: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&dyn Backend) -> Result<T> + Send + 'static,
  {
    let backend = Arc::clone(&self.backend);
    let name = backend.name();
    let limit = self.timeout;

    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_time()
      .build()
      .map_err(|e| HelperError::unavailable(name, format!("failed to start runtime: {e}")))?;
    let outcome = runtime.block_on(async move {
      let task = tokio::task::spawn_blocking(move || op(backend.as_ref()));
      tokio::time::timeout(limit, task).await
    });
    runtime.shutdown_background();

    match outcome {
      Ok(Ok(result)) => result,
      Ok(Err(join_error)) => Err(HelperError::unavailable(name, format!("backend task failed: {join_error}"))),
      Err(_) => Err(HelperError::BackendTimeout { backend: name, limit }),
    }
  }
}

impl fmt::Debug for HelperService {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HelperService")
      .field("backend", &self.backend_name())
      .field("timeout", &self.timeout)
      .field("fallback", &self.fallback.is_some())
      .finish()
  }
}

fn secret_matches(found: &CredentialRecord, query: &CredentialRecord) -> bool {
  match (&query.secret, &found.secret) {
    (None, _) => true,
    (Some(wanted), Some(stored)) => wanted == stored,
    (Some(_), None) => false,
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;
  use std::thread;

  use test_case::test_case;

  use super::*;
  use crate::backend::TimedCacheBackend;
  use crate::config::{DEFAULT_BACKEND_TIMEOUT_SECS, FallbackConfig};
  use crate::record::CredentialKey;

  const STORE_REQUEST: &str = "protocol=https\nhost=github.com\nusername=PersonalAccessToken\npassword=ghp_abc123\n\n";
  const GET_REQUEST: &str = "protocol=https\nhost=github.com\n\n";
  const GET_RESPONSE: &str = "protocol=https\nhost=github.com\nusername=PersonalAccessToken\npassword=ghp_abc123\n\n";

  struct SlowBackend(Duration);

  impl Backend for SlowBackend {
    fn name(&self) -> &'static str {
      "slow"
    }

    fn get(&self, _key: &CredentialKey) -> Result<Option<CredentialRecord>> {
      thread::sleep(self.0);
      Ok(None)
    }

    fn store(&self, _record: &CredentialRecord) -> Result<()> {
      thread::sleep(self.0);
      Ok(())
    }

    fn erase(&self, _key: &CredentialKey) -> Result<()> {
      thread::sleep(self.0);
      Ok(())
    }
  }

  fn cache_service() -> (Arc<TimedCacheBackend>, HelperService) {
    let cache = Arc::new(TimedCacheBackend::default());
    let service = HelperService::new(cache.clone(), Duration::from_secs(DEFAULT_BACKEND_TIMEOUT_SECS));
    (cache, service)
  }

  fn run(service: &HelperService, action: Action, input: &str) -> Result<String> {
    let mut output = Vec::new();
    service.handle(action, input.as_bytes(), &mut output)?;
    Ok(String::from_utf8(output).unwrap())
  }

  fn github_pat_fallback(token: &str) -> EnvFallback {
    let vars = HashMap::from([("GITHUB_PAT".to_string(), token.to_string())]);
    EnvFallback::new(FallbackConfig::default()).with_source(move |name| vars.get(name).cloned())
  }

  #[test]
  fn store_then_get_returns_the_token() {
    let (_, service) = cache_service();

    assert_eq!(run(&service, Action::Store, STORE_REQUEST).unwrap(), "");
    assert_eq!(run(&service, Action::Get, GET_REQUEST).unwrap(), GET_RESPONSE);
  }

  #[test]
  fn get_for_unknown_host_emits_nothing() {
    let (_, service) = cache_service();
    run(&service, Action::Store, STORE_REQUEST).unwrap();

    assert_eq!(
      run(&service, Action::Get, "protocol=https\nhost=gitlab.com\n\n").unwrap(),
      ""
    );
  }

  #[test]
  fn store_is_idempotent() {
    let (cache, service) = cache_service();
    run(&service, Action::Store, STORE_REQUEST).unwrap();
    run(&service, Action::Store, STORE_REQUEST).unwrap();

    assert_eq!(cache.len().unwrap(), 1);
    assert_eq!(run(&service, Action::Get, GET_REQUEST).unwrap(), GET_RESPONSE);
  }

  #[test]
  fn erase_removes_and_is_a_no_op_when_absent() {
    let (_, service) = cache_service();
    run(&service, Action::Store, STORE_REQUEST).unwrap();

    run(&service, Action::Erase, GET_REQUEST).unwrap();
    assert_eq!(run(&service, Action::Get, GET_REQUEST).unwrap(), "");
    run(&service, Action::Erase, GET_REQUEST).unwrap();
  }

  #[test]
  fn erase_with_other_username_keeps_the_record() {
    let (cache, service) = cache_service();
    run(&service, Action::Store, STORE_REQUEST).unwrap();

    run(&service, Action::Erase, "protocol=https\nhost=github.com\nusername=hubot\n\n").unwrap();
    assert_eq!(cache.len().unwrap(), 1);

    run(&service, Action::Erase, "protocol=https\nhost=github.com\npassword=ghp_other\n\n").unwrap();
    assert_eq!(cache.len().unwrap(), 1);

    run(&service, Action::Erase, STORE_REQUEST).unwrap();
    assert!(cache.is_empty().unwrap());
  }

  #[test]
  fn get_with_other_username_finds_nothing() {
    let (_, service) = cache_service();
    run(&service, Action::Store, STORE_REQUEST).unwrap();

    let output = run(&service, Action::Get, "protocol=https\nhost=github.com\nusername=hubot\n\n").unwrap();
    assert_eq!(output, "");
  }

  #[test_case(Action::Store, "protocol=https\nhost=github.com\nusername=PersonalAccessToken\n\n" ; "store without password")]
  #[test_case(Action::Store, "protocol=https\nhost=github.com\npassword=ghp_abc123\n" ; "store without blank line")]
  #[test_case(Action::Erase, "host=github.com\n\n" ; "erase without protocol")]
  #[test_case(Action::Get, "protocol=https\nnot a pair\n\n" ; "get with bad line")]
  fn malformed_input_never_mutates_state(action: Action, input: &str) {
    let (cache, service) = cache_service();
    run(&service, Action::Store, STORE_REQUEST).unwrap();

    let err = run(&service, action, input).unwrap_err();
    assert!(matches!(err, HelperError::MalformedInput(_)));
    assert_eq!(cache.len().unwrap(), 1);
    assert_eq!(run(&service, Action::Get, GET_REQUEST).unwrap(), GET_RESPONSE);
  }

  #[test]
  fn expired_records_are_not_returned_or_stored() {
    let (cache, service) = cache_service();
    let stale = CredentialRecord::new("https", "github.com")
      .with_username("PersonalAccessToken")
      .with_secret("ghp_abc123")
      .with_expiry(1);

    cache.store(&stale).unwrap();
    assert_eq!(run(&service, Action::Get, GET_REQUEST).unwrap(), "");

    cache.erase(&stale.key()).unwrap();
    service.store(&stale).unwrap();
    assert!(cache.is_empty().unwrap());
  }

  #[test]
  fn fallback_applies_only_when_backend_is_empty() {
    let (_, service) = cache_service();
    let service = service.with_fallback(github_pat_fallback("ghp_fromenv"));

    let output = run(&service, Action::Get, GET_REQUEST).unwrap();
    assert_eq!(
      output,
      "protocol=https\nhost=github.com\nusername=PersonalAccessToken\npassword=ghp_fromenv\n\n"
    );

    run(&service, Action::Store, STORE_REQUEST).unwrap();
    assert_eq!(run(&service, Action::Get, GET_REQUEST).unwrap(), GET_RESPONSE);
  }

  #[test]
  fn slow_backend_times_out() {
    let service = HelperService::new(Arc::new(SlowBackend(Duration::from_millis(500))), Duration::from_millis(20));

    let err = run(&service, Action::Get, GET_REQUEST).unwrap_err();
    assert!(matches!(err, HelperError::BackendTimeout { backend: "slow", .. }));

    let err = run(&service, Action::Store, STORE_REQUEST).unwrap_err();
    assert!(matches!(err, HelperError::BackendTimeout { .. }));
  }

  #[test]
  fn action_names() {
    assert_eq!(Action::from_name("get"), Some(Action::Get));
    assert_eq!(Action::from_name("erase").map(|a| a.to_string()).as_deref(), Some("erase"));
    assert_eq!(Action::from_name("capability"), None);
  }
}
