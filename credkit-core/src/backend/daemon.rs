//! # Cache Daemon
//!
//! Keeps a [`TimedCacheBackend`] alive across helper invocations. Each helper
//! process is short-lived, so cache mode talks to a background daemon over a
//! unix socket.
//!
//! Wire format: the usual `key=value` lines plus an `action=` line (`get`,
//! `store`, `erase` or `exit`) and, for `store`, an optional `timeout=`
//! line in seconds. The daemon replies with a record, or with a lone blank
//! line when it has nothing to say.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{HelperError, Result};

/// Starts the daemon process when a `store` finds no daemon listening
#[derive(Debug, Clone)]
pub struct DaemonLauncher {
  program: PathBuf,
  args: Vec<OsString>,
}

impl DaemonLauncher {
  pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
    Self {
      program: program.into(),
      args: args.into_iter().map(Into::into).collect(),
    }
  }

  /// Spawn the daemon detached from the helper's stdio
  pub fn launch(&self) -> Result<()> {
    debug!(program = %self.program.display(), "Launching cache daemon");
    Command::new(&self.program)
      .args(&self.args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn()
      .map(|_| ())
      .map_err(|e| HelperError::unavailable("cache", format!("cannot start cache daemon: {e}")))
  }
}

#[cfg(unix)]
pub use self::unix::*;

#[cfg(unix)]
mod unix {
  use std::fs;
  use std::io::{self, BufRead, BufReader, ErrorKind};
  use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
  use std::os::unix::net::UnixStream as StdUnixStream;
  use std::path::{Path, PathBuf};
  use std::sync::Arc;
  use std::thread;
  use std::time::{Duration, Instant};

  use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as AsyncBufReader};
  use tokio::net::{UnixListener, UnixStream};
  use tokio::sync::mpsc;
  use tracing::{debug, info, warn};
  use zeroize::Zeroizing;

  use super::DaemonLauncher;
  use crate::backend::{Backend, TimedCacheBackend};
  use crate::error::{HelperError, Result};
  use crate::record::{Attributes, CredentialKey, CredentialRecord};

  const NAME: &str = "cache";

  /// How long a daemon with nothing cached waits before exiting
  pub const IDLE_GRACE: Duration = Duration::from_secs(30);

  /// How long a client may take to send its request and read the reply
  pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

  /// How often a freshly launched daemon's socket is polled
  const CONNECT_RETRY: Duration = Duration::from_millis(25);

  /// Outcome of one served request
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  enum Control {
    Continue,
    Stored,
    Exit,
  }

  /// Bind the daemon socket, clearing a stale socket file left by a dead
  /// daemon. The socket directory is made private to the owner.
  pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      fs::DirBuilder::new().recursive(true).mode(0o700).create(parent)?;
      fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
    }

    if path.exists() {
      if StdUnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
          ErrorKind::AddrInUse,
          format!("a cache daemon is already listening on {}", path.display()),
        ));
      }
      debug!(socket = %path.display(), "Removing stale daemon socket");
      fs::remove_file(path)?;
    }

    UnixListener::bind(path)
  }

  /// Serve cache requests until the cache empties after holding something,
  /// an `exit` request arrives, or nothing is cached for [`IDLE_GRACE`].
  ///
  /// Each connection runs on its own task bounded by [`CONNECTION_TIMEOUT`],
  /// so a stalled client cannot hold up others.
  pub async fn serve(listener: UnixListener, cache: Arc<TimedCacheBackend>) -> Result<()> {
    let (outcome_tx, mut outcomes) = mpsc::unbounded_channel();
    let mut stored_once = false;

    loop {
      let wake = cache
        .next_expiry()?
        .map(tokio::time::Instant::from_std)
        .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_GRACE);

      tokio::select! {
        accepted = listener.accept() => {
          let (stream, _) = accepted.map_err(|e| HelperError::unavailable(NAME, e))?;
          let cache = Arc::clone(&cache);
          let outcome_tx = outcome_tx.clone();
          tokio::spawn(async move {
            match tokio::time::timeout(CONNECTION_TIMEOUT, handle_connection(stream, &cache)).await {
              Ok(Ok(control)) => {
                // The receiver only goes away once the daemon is exiting
                let _ = outcome_tx.send(control);
              }
              Ok(Err(e)) => warn!(error = %e, "Failed to serve cache request"),
              Err(_) => debug!(limit = ?CONNECTION_TIMEOUT, "Dropped a cache client that stalled"),
            }
          });
        }
        Some(control) = outcomes.recv() => {
          match control {
            Control::Exit => {
              info!("Cache daemon asked to exit");
              return Ok(());
            }
            Control::Stored => stored_once = true,
            Control::Continue => {}
          }
          if stored_once && cache.is_empty()? {
            info!("Cache is empty, daemon exiting");
            return Ok(());
          }
        }
        _ = tokio::time::sleep_until(wake) => {
          let evicted = cache.sweep_at(Instant::now())?;
          debug!(evicted, "Swept expired cache entries");
          if cache.is_empty()? {
            info!("Cache is empty, daemon exiting");
            return Ok(());
          }
        }
      }
    }
  }

  /// Run a daemon on `socket` until it decides to exit, then remove the
  /// socket file.
  pub fn run_daemon(socket: &Path, timeout: Duration) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .map_err(|e| HelperError::unavailable(NAME, format!("failed to start runtime: {e}")))?;

    let outcome = runtime.block_on(async {
      let listener = bind_socket(socket)
        .map_err(|e| HelperError::unavailable(NAME, format!("cannot bind {}: {e}", socket.display())))?;
      info!(socket = %socket.display(), timeout_secs = timeout.as_secs(), "Cache daemon listening");
      serve(listener, Arc::new(TimedCacheBackend::new(timeout))).await
    });

    if let Err(e) = fs::remove_file(socket)
      && e.kind() != ErrorKind::NotFound
    {
      warn!(socket = %socket.display(), error = %e, "Failed to remove daemon socket");
    }
    outcome
  }

  async fn handle_connection(stream: UnixStream, cache: &TimedCacheBackend) -> Result<Control> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = AsyncBufReader::new(read_half);
    let mut request = Zeroizing::new(String::new());

    loop {
      let start = request.len();
      let read = reader
        .read_line(&mut request)
        .await
        .map_err(|e| HelperError::unavailable(NAME, e))?;
      if read == 0 || request[start..].trim_end_matches(['\r', '\n']).is_empty() {
        break;
      }
    }

    let attrs = Attributes::read_from(request.as_bytes())?;
    let (control, response) = respond(&attrs, cache)?;

    write_half
      .write_all(response.as_bytes())
      .await
      .map_err(|e| HelperError::unavailable(NAME, e))?;
    write_half.shutdown().await.map_err(|e| HelperError::unavailable(NAME, e))?;
    Ok(control)
  }

  fn respond(attrs: &Attributes, cache: &TimedCacheBackend) -> Result<(Control, Zeroizing<String>)> {
    let empty = || Zeroizing::new(String::from("\n"));

    match attrs.get("action").unwrap_or_default() {
      "exit" => Ok((Control::Exit, empty())),
      "get" => {
        let query = CredentialRecord::from_attributes(attrs)?;
        let response = match cache.get(&query.key())? {
          Some(found) => Zeroizing::new(found.to_wire()),
          None => empty(),
        };
        Ok((Control::Continue, response))
      }
      "store" => {
        let record = CredentialRecord::from_attributes(attrs)?;
        let timeout = match attrs.get("timeout") {
          Some(secs) => Duration::from_secs(
            secs
              .parse()
              .map_err(|e| HelperError::malformed(format!("invalid timeout: {e}")))?,
          ),
          None => cache.timeout(),
        };
        cache.store_for(&record, timeout, Instant::now())?;
        debug!(key = %record.key(), timeout_secs = timeout.as_secs(), "Cached credential");
        Ok((Control::Stored, empty()))
      }
      "erase" => {
        let query = CredentialRecord::from_attributes(attrs)?;
        cache.erase(&query.key())?;
        Ok((Control::Continue, empty()))
      }
      other => Err(HelperError::malformed(format!("unknown cache action '{other}'"))),
    }
  }

  /// Client side of the cache daemon, used by helper processes
  pub struct CacheClientBackend {
    socket: PathBuf,
    timeout: Duration,
    io_timeout: Duration,
    launcher: Option<DaemonLauncher>,
  }

  impl CacheClientBackend {
    /// `timeout` is how long stored entries live; `io_timeout` bounds each
    /// socket read and write.
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration, io_timeout: Duration) -> Self {
      Self {
        socket: socket.into(),
        timeout,
        io_timeout,
        launcher: None,
      }
    }

    pub fn with_launcher(mut self, launcher: DaemonLauncher) -> Self {
      self.launcher = Some(launcher);
      self
    }

    /// Connect to a running daemon. `Ok(None)` means nobody is listening.
    fn connect(&self) -> Result<Option<StdUnixStream>> {
      match StdUnixStream::connect(&self.socket) {
        Ok(stream) => Ok(Some(stream)),
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => Ok(None),
        Err(e) => Err(HelperError::unavailable(
          NAME,
          format!("cannot connect to {}: {e}", self.socket.display()),
        )),
      }
    }

    /// Connect, launching the daemon first if none is running
    fn connect_or_launch(&self) -> Result<StdUnixStream> {
      if let Some(stream) = self.connect()? {
        return Ok(stream);
      }

      let launcher = self
        .launcher
        .as_ref()
        .ok_or_else(|| HelperError::unavailable(NAME, "cache daemon is not running"))?;
      launcher.launch()?;

      let deadline = Instant::now() + self.io_timeout;
      loop {
        if let Some(stream) = self.connect()? {
          return Ok(stream);
        }
        if Instant::now() >= deadline {
          return Err(HelperError::unavailable(NAME, "cache daemon did not start in time"));
        }
        thread::sleep(CONNECT_RETRY);
      }
    }

    fn exchange(&self, stream: StdUnixStream, request: &Attributes) -> Result<Attributes> {
      let io_error = |e: io::Error| self.exchange_error(e);
      stream.set_read_timeout(Some(self.io_timeout)).map_err(io_error)?;
      stream.set_write_timeout(Some(self.io_timeout)).map_err(io_error)?;
      request.write_to(&stream).map_err(io_error)?;

      // Collect the whole reply first so socket failures are reported as
      // backend failures rather than as bad input
      let mut reader = BufReader::new(&stream);
      let mut response = Zeroizing::new(String::new());
      loop {
        let start = response.len();
        if reader.read_line(&mut response).map_err(io_error)? == 0 {
          return Err(HelperError::unavailable(NAME, "cache daemon closed the connection without replying"));
        }
        if response[start..].trim_end_matches(['\r', '\n']).is_empty() {
          break;
        }
      }

      Attributes::read_from(response.as_bytes())
        .map_err(|e| HelperError::unavailable(NAME, format!("unexpected daemon response: {e}")))
    }

    fn exchange_error(&self, error: io::Error) -> HelperError {
      match error.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => HelperError::BackendTimeout {
          backend: NAME,
          limit: self.io_timeout,
        },
        _ => HelperError::unavailable(NAME, format!("cache daemon exchange failed: {error}")),
      }
    }

    fn request(action: &str, record: &CredentialRecord) -> Attributes {
      let mut request = Attributes::new().with("action", action);
      request.extend(&record.to_attributes());
      request
    }

    fn query_for(key: &CredentialKey) -> CredentialRecord {
      let mut query = CredentialRecord::new(key.protocol.as_str(), key.host.as_str());
      query.path = key.path.clone();
      query
    }
  }

  impl Backend for CacheClientBackend {
    fn name(&self) -> &'static str {
      NAME
    }

    fn get(&self, key: &CredentialKey) -> Result<Option<CredentialRecord>> {
      let Some(stream) = self.connect()? else {
        debug!(socket = %self.socket.display(), "No cache daemon running");
        return Ok(None);
      };

      let response = self.exchange(stream, &Self::request("get", &Self::query_for(key)))?;
      if response.is_empty() {
        return Ok(None);
      }
      CredentialRecord::from_attributes(&response)
        .map(Some)
        .map_err(|e| HelperError::unavailable(NAME, format!("unexpected daemon response: {e}")))
    }

    fn store(&self, record: &CredentialRecord) -> Result<()> {
      record.require_secret()?;
      let stream = self.connect_or_launch()?;
      let mut request = Self::request("store", record);
      request.push("timeout", self.timeout.as_secs().to_string());
      self.exchange(stream, &request).map(|_| ())
    }

    fn erase(&self, key: &CredentialKey) -> Result<()> {
      match self.connect()? {
        Some(stream) => self
          .exchange(stream, &Self::request("erase", &Self::query_for(key)))
          .map(|_| ()),
        None => Ok(()),
      }
    }
  }

}
