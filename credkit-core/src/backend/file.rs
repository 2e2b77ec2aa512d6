//! Encrypted credential file.
//!
//! All records live in one JSON envelope whose payload is AES-256-GCM
//! encrypted under a key derived with Argon2id. The key material comes from a
//! passphrase or from a random key file created next to the store.
//!
//! Writers hold an exclusive lock on a sidecar `.lock` file and replace the
//! store by atomic rename; readers take a shared lock.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{Backend, StoredCredential, describe_json_error};
use crate::error::{HelperError, Result};
use crate::record::{CredentialKey, CredentialRecord, Secret};

const NAME: &str = "file";

/// Envelope format version
const FILE_VERSION: u32 = 1;
const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
/// AES-GCM nonce size (96 bits)
const NONCE_LEN: usize = 12;

/// Upper bounds on Argon2 costs accepted from a store or configuration
const MAX_KDF_MEMORY_KIB: u32 = 1024 * 1024;
const MAX_KDF_ITERATIONS: u32 = 64;
const MAX_KDF_PARALLELISM: u32 = 16;

/// Where the encryption key material comes from
pub enum KeySource {
  /// User-supplied passphrase
  Passphrase(Secret),
  /// Random key stored in a file, generated on first write
  KeyFile(PathBuf),
}

/// Argon2id cost parameters. Recorded in each envelope so a store stays
/// readable after the configured costs change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
  pub memory_kib: u32,
  pub iterations: u32,
  pub parallelism: u32,
}

impl Default for KdfParams {
  fn default() -> Self {
    Self {
      memory_kib: Params::DEFAULT_M_COST,
      iterations: Params::DEFAULT_T_COST,
      parallelism: Params::DEFAULT_P_COST,
    }
  }
}

impl KdfParams {
  /// Reject costs large enough to exhaust memory or stall the helper
  pub fn check_limits(&self) -> std::result::Result<(), String> {
    if self.memory_kib > MAX_KDF_MEMORY_KIB {
      return Err(format!("kdf memory_kib {} exceeds {MAX_KDF_MEMORY_KIB}", self.memory_kib));
    }
    if self.iterations > MAX_KDF_ITERATIONS {
      return Err(format!("kdf iterations {} exceeds {MAX_KDF_ITERATIONS}", self.iterations));
    }
    if self.parallelism > MAX_KDF_PARALLELISM {
      return Err(format!("kdf parallelism {} exceeds {MAX_KDF_PARALLELISM}", self.parallelism));
    }
    Ok(())
  }

  fn derive_key(&self, material: &[u8], salt: &[u8]) -> std::result::Result<Zeroizing<[u8; KEY_LEN]>, argon2::Error> {
    let params = Params::new(self.memory_kib, self.iterations, self.parallelism, Some(KEY_LEN))?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params).hash_password_into(material, salt, key.as_mut_slice())?;
    Ok(key)
  }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
  version: u32,
  kdf: KdfParams,
  salt: String,
  nonce: String,
  ciphertext: String,
}

#[derive(Default, Serialize, Deserialize)]
struct Payload {
  credentials: BTreeMap<String, StoredCredential>,
}

/// Why the store on disk could not be opened
enum LoadError {
  /// The envelope is damaged; nothing in it can be recovered
  Corrupt(String),
  /// The envelope is intact but our key material does not open it
  KeyMismatch(String),
  Backend(HelperError),
}

impl From<HelperError> for LoadError {
  fn from(error: HelperError) -> Self {
    match error {
      HelperError::CorruptStore(reason) => Self::Corrupt(reason),
      other => Self::Backend(other),
    }
  }
}

enum LockMode {
  Shared,
  Exclusive,
}

/// File-backed store for platforms without a usable keychain
pub struct EncryptedFileBackend {
  path: PathBuf,
  lock_path: PathBuf,
  key_source: KeySource,
  kdf: KdfParams,
}

impl EncryptedFileBackend {
  pub fn new(path: impl Into<PathBuf>, key_source: KeySource) -> Self {
    let path = path.into();
    let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    lock_name.push(".lock");
    Self {
      lock_path: path.with_file_name(lock_name),
      path,
      key_source,
      kdf: KdfParams::default(),
    }
  }

  /// Argon2id costs used for subsequent writes
  pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
    self.kdf = kdf;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn lock(&self, mode: LockMode) -> Result<File> {
    if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
      fs::create_dir_all(parent)
        .map_err(|e| HelperError::unavailable(NAME, format!("cannot create {}: {e}", parent.display())))?;
    }

    let file = OpenOptions::new()
      .create(true)
      .truncate(false)
      .write(true)
      .open(&self.lock_path)
      .map_err(|e| HelperError::unavailable(NAME, format!("cannot open {}: {e}", self.lock_path.display())))?;

    let locked = match mode {
      LockMode::Shared => file.lock_shared(),
      LockMode::Exclusive => file.lock(),
    };
    locked.map_err(|e| HelperError::unavailable(NAME, format!("cannot lock {}: {e}", self.lock_path.display())))?;

    Ok(file)
  }

  fn key_material(&self, create: bool) -> Result<Zeroizing<Vec<u8>>> {
    let path = match &self.key_source {
      KeySource::Passphrase(secret) => return Ok(Zeroizing::new(secret.expose().as_bytes().to_vec())),
      KeySource::KeyFile(path) => path,
    };

    match fs::read_to_string(path) {
      Ok(encoded) => {
        let encoded = Zeroizing::new(encoded);
        STANDARD
          .decode(encoded.trim())
          .map(Zeroizing::new)
          .map_err(|e| HelperError::corrupt(format!("key file {} is not valid base64: {e}", path.display())))
      }
      Err(e) if e.kind() == ErrorKind::NotFound && create => create_key_file(path),
      Err(e) if e.kind() == ErrorKind::NotFound => {
        Err(HelperError::corrupt(format!("key file {} is missing", path.display())))
      }
      Err(e) => Err(HelperError::unavailable(
        NAME,
        format!("cannot read key file {}: {e}", path.display()),
      )),
    }
  }

  fn load(&self) -> std::result::Result<Payload, LoadError> {
    let bytes = match fs::read(&self.path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Payload::default()),
      Err(e) => {
        return Err(LoadError::Backend(HelperError::unavailable(
          NAME,
          format!("cannot read {}: {e}", self.path.display()),
        )));
      }
    };
    self.open_envelope(&bytes)
  }

  fn open_envelope(&self, bytes: &[u8]) -> std::result::Result<Payload, LoadError> {
    let envelope: Envelope = serde_json::from_slice(bytes)
      .map_err(|e| HelperError::corrupt(format!("not a credential store: {}", describe_json_error(&e))))?;
    if envelope.version != FILE_VERSION {
      return Err(LoadError::Corrupt(format!(
        "unsupported store version {}",
        envelope.version
      )));
    }
    envelope.kdf.check_limits().map_err(LoadError::Corrupt)?;

    let salt = decode_field("salt", &envelope.salt)?;
    let nonce = decode_field("nonce", &envelope.nonce)?;
    let ciphertext = decode_field("ciphertext", &envelope.ciphertext)?;
    if nonce.len() != NONCE_LEN {
      return Err(LoadError::Corrupt("nonce has the wrong length".to_string()));
    }

    let material = self.key_material(false).map_err(|e| match e {
      HelperError::CorruptStore(reason) => LoadError::KeyMismatch(reason),
      other => LoadError::Backend(other),
    })?;
    let key = envelope
      .kdf
      .derive_key(&material, &salt)
      .map_err(|e| HelperError::corrupt(format!("cannot derive key: {e}")))?;
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
      .map_err(|e| HelperError::corrupt(format!("invalid key length: {e}")))?;
    let plaintext = Zeroizing::new(
      cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|e| LoadError::KeyMismatch(format!("decryption failed ({e}); wrong passphrase or tampered file")))?,
    );

    serde_json::from_slice(&plaintext)
      .map_err(|e| LoadError::Corrupt(format!("undecodable payload: {}", describe_json_error(&e))))
  }

  fn seal(&self, payload: &Payload) -> Result<Envelope> {
    self.kdf.check_limits().map_err(|reason| HelperError::unavailable(NAME, reason))?;
    let material = self.key_material(true)?;
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let key = self
      .kdf
      .derive_key(&material, &salt)
      .map_err(|e| HelperError::unavailable(NAME, format!("cannot derive key: {e}")))?;
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
      .map_err(|e| HelperError::unavailable(NAME, format!("invalid key length: {e}")))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let plaintext = Zeroizing::new(
      serde_json::to_vec(payload).map_err(|e| HelperError::unavailable(NAME, describe_json_error(&e)))?,
    );
    let ciphertext = cipher
      .encrypt(&nonce, plaintext.as_slice())
      .map_err(|e| HelperError::unavailable(NAME, format!("encryption failed: {e}")))?;

    Ok(Envelope {
      version: FILE_VERSION,
      kdf: self.kdf,
      salt: STANDARD.encode(salt),
      nonce: STANDARD.encode(nonce),
      ciphertext: STANDARD.encode(ciphertext),
    })
  }

  fn save(&self, payload: &Payload) -> Result<()> {
    let envelope = self.seal(payload)?;
    let json = serde_json::to_vec_pretty(&envelope).map_err(|e| HelperError::unavailable(NAME, describe_json_error(&e)))?;

    let dir = self
      .path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .unwrap_or_else(|| Path::new("."));
    let io_error = |e: std::io::Error| HelperError::unavailable(NAME, format!("cannot write {}: {e}", self.path.display()));

    let mut staged = NamedTempFile::new_in(dir).map_err(io_error)?;
    staged.write_all(&json).map_err(io_error)?;
    staged.as_file().sync_all().map_err(io_error)?;
    staged.persist(&self.path).map_err(|e| io_error(e.error))?;
    Ok(())
  }

  /// Load for a read-modify-write cycle. A damaged store is moved aside so
  /// the write can start from scratch; a store sealed under other key
  /// material is left untouched and the write is refused.
  fn load_for_update(&self) -> Result<Payload> {
    match self.load() {
      Ok(payload) => Ok(payload),
      Err(LoadError::Corrupt(reason)) => {
        let aside = self.aside_path();
        warn!(
          path = %self.path.display(),
          moved_to = %aside.display(),
          %reason,
          "Credential store is unreadable, starting a new one"
        );
        fs::rename(&self.path, &aside)
          .map_err(|e| HelperError::unavailable(NAME, format!("cannot move corrupt store aside: {e}")))?;
        Ok(Payload::default())
      }
      Err(LoadError::KeyMismatch(reason)) => Err(HelperError::unavailable(
        NAME,
        format!(
          "{} is encrypted under a different key ({reason}); refusing to overwrite it",
          self.path.display()
        ),
      )),
      Err(LoadError::Backend(e)) => Err(e),
    }
  }

  /// A fresh name next to the store for a damaged copy, never reusing one
  fn aside_path(&self) -> PathBuf {
    let mut base = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    base.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));

    let mut candidate = self.path.with_file_name(&base);
    let mut attempt = 1;
    while candidate.exists() {
      let mut name = base.clone();
      name.push(format!("-{attempt}"));
      candidate = self.path.with_file_name(name);
      attempt += 1;
    }
    candidate
  }
}

impl Backend for EncryptedFileBackend {
  fn name(&self) -> &'static str {
    NAME
  }

  fn get(&self, key: &CredentialKey) -> Result<Option<CredentialRecord>> {
    if !self.path.exists() {
      return Ok(None);
    }

    let _lock = self.lock(LockMode::Shared)?;
    match self.load() {
      Ok(mut payload) => Ok(payload.credentials.remove(&key.to_string()).map(StoredCredential::into_record)),
      Err(LoadError::Corrupt(reason) | LoadError::KeyMismatch(reason)) => {
        warn!(path = %self.path.display(), %reason, "Credential store is unreadable, treating it as empty");
        Ok(None)
      }
      Err(LoadError::Backend(e)) => Err(e),
    }
  }

  fn store(&self, record: &CredentialRecord) -> Result<()> {
    let stored = StoredCredential::from_record(record)?;
    let _lock = self.lock(LockMode::Exclusive)?;

    let mut payload = self.load_for_update()?;
    payload.credentials.insert(record.key().to_string(), stored);
    self.save(&payload)?;
    debug!(key = %record.key(), path = %self.path.display(), "Stored credential");
    Ok(())
  }

  fn erase(&self, key: &CredentialKey) -> Result<()> {
    if !self.path.exists() {
      return Ok(());
    }

    let _lock = self.lock(LockMode::Exclusive)?;
    let mut payload = match self.load() {
      Ok(payload) => payload,
      Err(LoadError::Corrupt(reason) | LoadError::KeyMismatch(reason)) => {
        warn!(path = %self.path.display(), %reason, "Credential store is unreadable, nothing to erase");
        return Ok(());
      }
      Err(LoadError::Backend(e)) => return Err(e),
    };

    if payload.credentials.remove(&key.to_string()).is_some() {
      self.save(&payload)?;
      debug!(key = %key, "Erased credential");
    }
    Ok(())
  }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
  STANDARD
    .decode(value)
    .map_err(|e| HelperError::corrupt(format!("{name} is not valid base64: {e}")))
}

fn create_key_file(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
  let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
  OsRng.fill_bytes(key.as_mut_slice());
  let encoded = Zeroizing::new(STANDARD.encode(key.as_slice()));

  let mut options = OpenOptions::new();
  options.write(true).create_new(true);
  #[cfg(unix)]
  {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600); // Owner read/write only
  }

  let mut file = options
    .open(path)
    .map_err(|e| HelperError::unavailable(NAME, format!("cannot create key file {}: {e}", path.display())))?;
  file
    .write_all(encoded.as_bytes())
    .map_err(|e| HelperError::unavailable(NAME, format!("cannot write key file {}: {e}", path.display())))?;

  info!(path = %path.display(), "Generated a new key file for the credential store");
  Ok(key)
}
