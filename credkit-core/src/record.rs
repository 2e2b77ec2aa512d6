//! # Credential Records
//!
//! The unit exchanged with Git: parsing and serialization of the line-based
//! `key=value` format, the lookup key derived from a record, and the redacted
//! [`Secret`] wrapper for tokens.

use std::fmt;
use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use tracing::trace;
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{HelperError, Result};

/// An opaque token. `Debug` never shows the value and memory is wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
  pub fn new(value: impl Into<String>) -> Self {
    Self(value.into())
  }

  /// Borrow the raw token. Callers must not log the result.
  pub fn expose(&self) -> &str {
    &self.0
  }
}

impl fmt::Debug for Secret {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("Secret(<redacted>)")
  }
}

/// Lookup key for stored credentials: `(protocol, host, path?)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialKey {
  pub protocol: String,
  pub host: String,
  pub path: Option<String>,
}

impl CredentialKey {
  pub fn new(protocol: &str, host: &str, path: Option<&str>) -> Self {
    Self {
      protocol: protocol.to_ascii_lowercase(),
      host: host.to_ascii_lowercase(),
      path: path.filter(|p| !p.is_empty()).map(str::to_string),
    }
  }
}

impl fmt::Display for CredentialKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}://{}", self.protocol, self.host)?;
    if let Some(path) = &self.path {
      write!(f, "/{path}")?;
    }
    Ok(())
  }
}

/// Ordered `key=value` pairs as read from or written to the wire.
///
/// Values are wiped on drop because a `password` line may be among them.
#[derive(Default, Clone)]
pub struct Attributes {
  entries: Vec<(String, String)>,
}

impl fmt::Debug for Attributes {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.entries.iter().map(|(k, _)| k)).finish()
  }
}

impl Attributes {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.entries.push((key.into(), value.into()));
  }

  /// Builder-style variant of [`Attributes::push`]
  pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.push(key, value);
    self
  }

  /// Last value recorded for `key`
  pub fn get(&self, key: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .rev()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Append every pair of `other` after the existing ones
  pub fn extend(&mut self, other: &Attributes) {
    self.entries.extend(other.entries.iter().cloned());
  }

  /// Read pairs up to and including the terminating blank line.
  ///
  /// Fails when a line has no `=`, a key is empty, or the stream ends before
  /// the blank line.
  pub fn read_from<R: BufRead>(mut reader: R) -> Result<Self> {
    let mut attrs = Self::new();
    let mut line = Zeroizing::new(String::new());
    let mut line_no = 0usize;

    loop {
      line.clear();
      line_no += 1;
      let read = reader
        .read_line(&mut line)
        .map_err(|e| HelperError::malformed(format!("failed to read line {line_no}: {e}")))?;
      if read == 0 {
        return Err(HelperError::malformed("input ended before the terminating blank line"));
      }

      let content = line.strip_suffix('\n').unwrap_or(&line);
      let content = content.strip_suffix('\r').unwrap_or(content);
      if content.is_empty() {
        return Ok(attrs);
      }

      let Some((key, value)) = content.split_once('=') else {
        return Err(HelperError::malformed(format!("line {line_no} is missing '='")));
      };
      if key.is_empty() {
        return Err(HelperError::malformed(format!("line {line_no} has an empty key")));
      }
      attrs.push(key, value);
    }
  }

  /// Write every pair followed by the terminating blank line
  pub fn write_to<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
    for (key, value) in &self.entries {
      writeln!(writer, "{key}={value}")?;
    }
    writeln!(writer)?;
    writer.flush()
  }
}

impl Drop for Attributes {
  fn drop(&mut self) {
    for (_, value) in &mut self.entries {
      value.zeroize();
    }
  }
}

/// A credential as exchanged with Git
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
  pub protocol: String,
  pub host: String,
  pub path: Option<String>,
  pub username: Option<String>,
  pub secret: Option<Secret>,
  /// Unix timestamp after which the token is no longer valid
  pub password_expiry_utc: Option<i64>,
}

impl CredentialRecord {
  pub fn new(protocol: impl Into<String>, host: impl Into<String>) -> Self {
    Self {
      protocol: protocol.into(),
      host: host.into(),
      path: None,
      username: None,
      secret: None,
      password_expiry_utc: None,
    }
  }

  pub fn with_path(mut self, path: impl Into<String>) -> Self {
    self.path = Some(path.into());
    self
  }

  pub fn with_username(mut self, username: impl Into<String>) -> Self {
    self.username = Some(username.into());
    self
  }

  pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
    self.secret = Some(Secret::new(secret));
    self
  }

  pub fn with_expiry(mut self, password_expiry_utc: i64) -> Self {
    self.password_expiry_utc = Some(password_expiry_utc);
    self
  }

  /// Parse a record from a `key=value` stream
  pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
    Self::from_attributes(&Attributes::read_from(reader)?)
  }

  /// Build a record from already-read pairs.
  ///
  /// `url=` resets protocol, host, path and username; later keys override
  /// individual fields. Unknown keys are ignored.
  pub fn from_attributes(attrs: &Attributes) -> Result<Self> {
    let mut protocol = None;
    let mut host = None;
    let mut path = None;
    let mut username = None;
    let mut secret = None;
    let mut password_expiry_utc = None;

    for (key, value) in attrs.iter() {
      match key {
        "protocol" => protocol = non_empty(value),
        "host" => host = non_empty(value),
        "path" => path = non_empty(value),
        "username" => username = non_empty(value),
        "password" => secret = non_empty(value).map(Secret::new),
        "password_expiry_utc" => {
          let timestamp = value
            .parse::<i64>()
            .map_err(|e| HelperError::malformed(format!("password_expiry_utc must be a Unix timestamp: {e}")))?;
          password_expiry_utc = Some(timestamp);
        }
        "url" => {
          let parsed = Url::parse(value).map_err(|e| HelperError::malformed(format!("invalid url: {e}")))?;
          let url_host = parsed
            .host_str()
            .ok_or_else(|| HelperError::malformed("url has no host"))?;
          protocol = Some(parsed.scheme().to_string());
          host = Some(match parsed.port() {
            Some(port) => format!("{url_host}:{port}"),
            None => url_host.to_string(),
          });
          path = non_empty(parsed.path().trim_start_matches('/'));
          username = non_empty(parsed.username());
        }
        other => trace!(attribute = other, "Ignoring unrecognised attribute"),
      }
    }

    let protocol = protocol.ok_or_else(|| HelperError::malformed("missing required key 'protocol'"))?;
    let host = host.ok_or_else(|| HelperError::malformed("missing required key 'host'"))?;

    Ok(Self {
      protocol,
      host,
      path,
      username,
      secret,
      password_expiry_utc,
    })
  }

  /// Pairs in the stable wire order, omitting absent optional fields
  pub fn to_attributes(&self) -> Attributes {
    let mut attrs = Attributes::new()
      .with("protocol", self.protocol.as_str())
      .with("host", self.host.as_str());
    if let Some(path) = &self.path {
      attrs.push("path", path.as_str());
    }
    if let Some(username) = &self.username {
      attrs.push("username", username.as_str());
    }
    if let Some(secret) = &self.secret {
      attrs.push("password", secret.expose());
    }
    if let Some(expiry) = self.password_expiry_utc {
      attrs.push("password_expiry_utc", expiry.to_string());
    }
    attrs
  }

  pub fn write_to<W: Write>(&self, writer: W) -> std::io::Result<()> {
    self.to_attributes().write_to(writer)
  }

  /// Serialized wire form, including the terminating blank line
  pub fn to_wire(&self) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail
    let _ = self.write_to(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
  }

  pub fn key(&self) -> CredentialKey {
    CredentialKey::new(&self.protocol, &self.host, self.path.as_deref())
  }

  /// Composite URL of protocol, username, host and path
  pub fn url(&self) -> String {
    let mut url = format!("{}://", self.protocol);
    if let Some(username) = &self.username {
      url.push_str(username);
      url.push('@');
    }
    url.push_str(&self.host);
    if let Some(path) = &self.path {
      url.push('/');
      url.push_str(path);
    }
    url
  }

  /// The secret, or `MalformedInput` when the record carries none
  pub fn require_secret(&self) -> Result<&Secret> {
    self
      .secret
      .as_ref()
      .ok_or_else(|| HelperError::malformed("missing required key 'password'"))
  }

  pub fn is_expired_at(&self, now_unix: i64) -> bool {
    self.password_expiry_utc.is_some_and(|expiry| expiry <= now_unix)
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(chrono::Utc::now().timestamp())
  }

  /// Whether this stored record satisfies `query`'s username constraint
  pub fn matches_username(&self, query: &CredentialRecord) -> bool {
    query
      .username
      .as_deref()
      .is_none_or(|wanted| self.username.as_deref() == Some(wanted))
  }
}

fn non_empty(value: &str) -> Option<String> {
  (!value.is_empty()).then(|| value.to_string())
}
