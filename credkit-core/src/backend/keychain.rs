//! Platform keychain backend.
//!
//! Each record is one keyring entry whose account name is the key's canonical
//! URL and whose secret is the JSON-encoded record.

use keyring::{CredentialBuilder, Entry};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{Backend, StoredCredential, describe_json_error};
use crate::error::{HelperError, Result};
use crate::record::{CredentialKey, CredentialRecord};

const NAME: &str = "keychain";

/// Credentials kept in macOS Keychain, Windows Credential Manager or the
/// Linux kernel keyring
pub struct KeychainBackend {
  service: String,
  builder: Option<Box<CredentialBuilder>>,
}

impl KeychainBackend {
  /// Service name entries are filed under
  pub const DEFAULT_SERVICE: &'static str = "credkit";

  pub fn new(service: impl Into<String>) -> Self {
    Self {
      service: service.into(),
      builder: None,
    }
  }

  /// Create entries through `builder` instead of the platform default store
  pub fn with_credential_builder(mut self, builder: Box<CredentialBuilder>) -> Self {
    self.builder = Some(builder);
    self
  }

  fn entry(&self, key: &CredentialKey) -> Result<Entry> {
    let account = key.to_string();
    let entry = match &self.builder {
      Some(builder) => builder
        .build(None, &self.service, &account)
        .map(Entry::new_with_credential),
      None => Entry::new(&self.service, &account),
    };
    entry.map_err(|e| HelperError::unavailable(NAME, e))
  }
}

impl Backend for KeychainBackend {
  fn name(&self) -> &'static str {
    NAME
  }

  fn get(&self, key: &CredentialKey) -> Result<Option<CredentialRecord>> {
    let encoded = match self.entry(key)?.get_password() {
      Ok(encoded) => Zeroizing::new(encoded),
      Err(keyring::Error::NoEntry) => return Ok(None),
      Err(e) => return Err(HelperError::unavailable(NAME, e)),
    };

    match serde_json::from_str::<StoredCredential>(&encoded) {
      Ok(stored) => Ok(Some(stored.into_record())),
      Err(e) => {
        warn!(key = %key, reason = %describe_json_error(&e), "Ignoring undecodable keychain entry");
        Ok(None)
      }
    }
  }

  fn store(&self, record: &CredentialRecord) -> Result<()> {
    let stored = StoredCredential::from_record(record)?;
    let encoded = Zeroizing::new(
      serde_json::to_string(&stored).map_err(|e| HelperError::unavailable(NAME, describe_json_error(&e)))?,
    );

    self
      .entry(&record.key())?
      .set_password(&encoded)
      .map_err(|e| HelperError::unavailable(NAME, e))?;
    debug!(key = %record.key(), service = %self.service, "Stored credential in keychain");
    Ok(())
  }

  fn erase(&self, key: &CredentialKey) -> Result<()> {
    match self.entry(key)?.delete_credential() {
      Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
      Err(e) => Err(HelperError::unavailable(NAME, e)),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::any::Any;
  use std::collections::HashMap;
  use std::sync::{Arc, Mutex};

  use keyring::Credential;
  use keyring::credential::{CredentialApi, CredentialBuilderApi};

  use super::*;

  const SERVICE: &str = "credkit-test";

  type Secrets = Arc<Mutex<HashMap<String, Vec<u8>>>>;

  /// In-memory keychain whose entries outlive the `Entry` handles
  #[derive(Debug, Default, Clone)]
  struct MemoryKeychain(Secrets);

  #[derive(Debug)]
  struct MemoryCredential {
    secrets: Secrets,
    account: String,
  }

  impl CredentialApi for MemoryCredential {
    fn set_secret(&self, secret: &[u8]) -> keyring::Result<()> {
      self.secrets.lock().unwrap().insert(self.account.clone(), secret.to_vec());
      Ok(())
    }

    fn get_secret(&self) -> keyring::Result<Vec<u8>> {
      self.secrets.lock().unwrap().get(&self.account).cloned().ok_or(keyring::Error::NoEntry)
    }

    fn delete_credential(&self) -> keyring::Result<()> {
      self.secrets.lock().unwrap().remove(&self.account).map(drop).ok_or(keyring::Error::NoEntry)
    }

    fn as_any(&self) -> &dyn Any {
      self
    }
  }

  impl CredentialBuilderApi for MemoryKeychain {
    fn build(&self, _target: Option<&str>, service: &str, user: &str) -> keyring::Result<Box<Credential>> {
      Ok(Box::new(MemoryCredential {
        secrets: Arc::clone(&self.0),
        account: format!("{service}/{user}"),
      }))
    }

    fn as_any(&self) -> &dyn Any {
      self
    }
  }

  fn backend(keychain: &MemoryKeychain) -> KeychainBackend {
    KeychainBackend::new(SERVICE).with_credential_builder(Box::new(keychain.clone()))
  }

  fn token(host: &str, secret: &str) -> CredentialRecord {
    CredentialRecord::new("https", host)
      .with_username("PersonalAccessToken")
      .with_secret(secret)
  }

  #[test]
  fn missing_entry_is_not_found() {
    let backend = backend(&MemoryKeychain::default());
    let key = CredentialKey::new("https", "github.com", None);

    assert_eq!(backend.get(&key).unwrap(), None);
  }

  #[test]
  fn erasing_missing_entry_succeeds() {
    let backend = backend(&MemoryKeychain::default());

    backend
      .erase(&CredentialKey::new("https", "github.com", Some("owner/repo.git")))
      .unwrap();
  }

  #[test]
  fn store_requires_a_secret() {
    let keychain = MemoryKeychain::default();
    let err = backend(&keychain)
      .store(&CredentialRecord::new("https", "github.com"))
      .unwrap_err();

    assert!(matches!(err, HelperError::MalformedInput(_)));
    assert!(keychain.0.lock().unwrap().is_empty());
  }

  #[test]
  fn stored_entry_reads_back() {
    let keychain = MemoryKeychain::default();
    let record = token("GitHub.com", "ghp_abc123").with_path("owner/repo.git");

    backend(&keychain).store(&record).unwrap();

    let found = backend(&keychain).get(&record.key()).unwrap();
    assert_eq!(found, Some(record));
    assert!(keychain.0.lock().unwrap().contains_key("credkit-test/https://github.com/owner/repo.git"));
  }

  #[test]
  fn store_overwrites_the_entry_for_the_same_key() {
    let keychain = MemoryKeychain::default();
    let backend = backend(&keychain);
    backend.store(&token("github.com", "old")).unwrap();
    backend.store(&token("github.com", "ghp_new")).unwrap();
    backend.store(&token("gitlab.com", "glpat_other")).unwrap();

    let found = backend.get(&token("github.com", "x").key()).unwrap().unwrap();
    assert_eq!(found.secret.unwrap().expose(), "ghp_new");
    assert_eq!(keychain.0.lock().unwrap().len(), 2);
  }

  #[test]
  fn erase_forgets_only_that_entry() {
    let keychain = MemoryKeychain::default();
    let backend = backend(&keychain);
    backend.store(&token("github.com", "ghp_abc123")).unwrap();
    backend.store(&token("gitlab.com", "glpat_other")).unwrap();

    backend.erase(&token("github.com", "x").key()).unwrap();
    backend.erase(&token("github.com", "x").key()).unwrap();

    assert_eq!(backend.get(&token("github.com", "x").key()).unwrap(), None);
    assert!(backend.get(&token("gitlab.com", "x").key()).unwrap().is_some());
  }

  #[test]
  fn undecodable_entry_reads_as_not_found() {
    let keychain = MemoryKeychain::default();
    keychain
      .0
      .lock()
      .unwrap()
      .insert("credkit-test/https://github.com".to_string(), b"not json".to_vec());

    let key = CredentialKey::new("https", "github.com", None);
    assert_eq!(backend(&keychain).get(&key).unwrap(), None);
  }

  #[test]
  fn entries_are_scoped_to_their_service() {
    let keychain = MemoryKeychain::default();
    let record = token("github.com", "ghp_abc123");
    backend(&keychain).store(&record).unwrap();

    let other = KeychainBackend::new("another-service").with_credential_builder(Box::new(keychain.clone()));
    assert_eq!(other.get(&record.key()).unwrap(), None);
  }
}
