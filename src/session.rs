//! Capture session control: the proxy run loop and the start/stop/save operations
//!
//! The proxy and the archiver are separate processes that meet only in the filesystem. The
//! PID file doubles as the session lock: while it exists the proxy may rewrite the working
//! store at any moment, so archiving is refused.
use crate::accumulator::{CaptureAccumulator, WorkingStore};
use crate::archive::{ArchiveOutcome, Archiver};
use crate::capture::QuestionCapture;
use crate::config::Config;
use crate::errors::{new_io_error, Error, Result};
use crate::render::Renderer;
use quiz_intercept_mitm::{LoggingInterceptor, MitmConfig, MitmProxy};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use time::UtcOffset;
use tokio::net::TcpListener;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// PID file held by the running proxy; removed when dropped
#[derive(Debug)]
pub struct SessionLock {
  path: PathBuf,
}

impl SessionLock {
  /// Take the lock for this process. A lock left behind by a dead process is replaced.
  pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
    let path = path.into();
    if Self::active(&path)?.is_some() {
      return Err(Error::SessionActive(path));
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
      Ok(file) => file,
      Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(Error::SessionActive(path)),
      Err(e) => return Err(new_io_error(&path, e)),
    };
    let lock = Self { path };
    file
      .write_all(std::process::id().to_string().as_bytes())
      .map_err(|e| new_io_error(&lock.path, e))?;
    Ok(lock)
  }

  /// PID of the live session holding `path`, if any. Stale lock files are cleared.
  pub fn active(path: &Path) -> Result<Option<u32>> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(new_io_error(path, e)),
    };
    match content.trim().parse::<u32>() {
      Ok(pid) if process_alive(pid) => Ok(Some(pid)),
      _ => {
        tracing::warn!("removing stale session lock {}", path.display());
        match fs::remove_file(path) {
          Err(e) if e.kind() != ErrorKind::NotFound => Err(new_io_error(path, e)),
          _ => Ok(None),
        }
      }
    }
  }

  /// Location of the PID file
  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for SessionLock {
  fn drop(&mut self) {
    if let Err(e) = fs::remove_file(&self.path) {
      tracing::warn!("failed to remove session lock {}: {}", self.path.display(), e);
    }
  }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
  let pid = pid.to_string();
  Command::new("kill")
    .args(["-0", pid.as_str()])
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .status()
    .map(|s| s.success())
    .unwrap_or(true)
}

#[cfg(windows)]
fn process_alive(pid: u32) -> bool {
  let filter = format!("PID eq {}", pid);
  match Command::new("tasklist")
    .args(["/FI", filter.as_str(), "/NH", "/FO", "CSV"])
    .stderr(Stdio::null())
    .output()
  {
    Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&format!("\"{}\"", pid)),
    Err(_) => true,
  }
}

/// Ask `pid` to shut down the way Ctrl-C would
#[cfg(unix)]
fn send_interrupt(pid: u32, _lock: &Path) -> Result<()> {
  let pid_arg = pid.to_string();
  let status = Command::new("kill")
    .args(["-INT", pid_arg.as_str()])
    .status()?;
  if !status.success() {
    return Err(Error::Other(format!("kill -INT {} failed: {}", pid, status)));
  }
  Ok(())
}

#[cfg(windows)]
fn send_interrupt(pid: u32, lock: &Path) -> Result<()> {
  let pid_arg = pid.to_string();
  let status = Command::new("taskkill")
    .args(["/PID", pid_arg.as_str()])
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .status()?;
  if status.success() {
    return Ok(());
  }
  // A console process without a window ignores the close request.
  tracing::warn!("proxy (pid {}) refused to close, terminating it", pid);
  let status = Command::new("taskkill")
    .args(["/PID", pid_arg.as_str(), "/F"])
    .status()?;
  if !status.success() {
    return Err(Error::Other(format!("taskkill {} failed: {}", pid, status)));
  }
  // Termination skips the lock's drop.
  let _ = fs::remove_file(lock);
  Ok(())
}

/// Proxy engine settings for a capture session: only the target host is decrypted
pub fn mitm_config(config: &Config) -> Result<MitmConfig> {
  Ok(MitmConfig {
    ca_storage_path: config.ca_storage_path.clone(),
    enable_https_interception: true,
    intercept_hosts: Some(vec![config.target_host()?]),
    connection_timeout: config.connection_timeout_secs,
  })
}

/// Make sure the CA exists and return its certificate path
pub async fn ca_certificate(config: &Config) -> Result<PathBuf> {
  let proxy = MitmProxy::new(mitm_config(config)?).await?;
  Ok(proxy.ca_cert_path())
}

/// Resolves on Ctrl-C / SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
      Ok(mut term) => {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => {}
          _ = term.recv() => {}
        }
        return;
      }
      Err(e) => tracing::warn!("cannot listen for SIGTERM: {}", e),
    }
  }
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!("cannot listen for Ctrl-C: {}", e);
    std::future::pending::<()>().await;
  }
}

/// Run a capture session in the foreground until interrupted
///
/// The session lock is taken only once `listen_addr` is bound, so a visible lock means the
/// proxy is accepting connections.
pub async fn run_proxy(config: &Config) -> Result<()> {
  if SessionLock::active(&config.pid_file)?.is_some() {
    return Err(Error::SessionActive(config.pid_file.clone()));
  }
  let accumulator = Arc::new(Mutex::new(CaptureAccumulator::open(WorkingStore::new(
    &config.store_path,
  ))?));
  let capture = Arc::new(QuestionCapture::new(config, accumulator.clone()));

  let proxy = MitmProxy::new(mitm_config(config)?).await?;
  let listener = TcpListener::bind(&config.listen_addr)
    .await
    .map_err(|e| Error::Other(format!("failed to bind {}: {}", config.listen_addr, e)))?;
  let lock = SessionLock::acquire(&config.pid_file)?;
  {
    let handler = proxy.interceptor_handler();
    let mut handler = handler.write().await;
    handler.add_request_interceptor(Arc::new(LoggingInterceptor));
    handler.add_request_interceptor(capture.clone());
    handler.add_response_interceptor(Arc::new(LoggingInterceptor));
    handler.add_response_interceptor(capture);
  }

  tracing::info!(
    "capturing {} on {} (lock {}, CA {})",
    config.target_url,
    config.listen_addr,
    lock.path().display(),
    proxy.ca_cert_path().display()
  );
  proxy.serve(listener, shutdown_signal()).await?;

  let stored = accumulator.lock().map(|acc| acc.len()).unwrap_or_default();
  tracing::info!(
    "capture session ended, {} question(s) waiting in {}",
    stored,
    config.store_path.display()
  );
  Ok(())
}

/// Launch `run` as a detached child process and wait until it holds the session lock
pub async fn start(config: &Config, config_path: Option<&Path>, quiet: bool) -> Result<()> {
  if SessionLock::active(&config.pid_file)?.is_some() {
    println!("Proxy is already running.");
    return Ok(());
  }

  println!("Starting proxy...");
  let mut command = Command::new(std::env::current_exe()?);
  command.arg("run").stdin(Stdio::null());
  if let Some(path) = config_path {
    command.arg("--config").arg(path);
  }
  if quiet {
    command.arg("--quiet").stdout(Stdio::null()).stderr(Stdio::null());
  }
  let mut child = command.spawn()?;

  let deadline = Instant::now() + Duration::from_secs(config.stop_timeout_secs);
  while !config.pid_file.exists() {
    if let Some(status) = child.try_wait()? {
      return Err(Error::Other(format!("proxy exited during startup: {}", status)));
    }
    if Instant::now() >= deadline {
      return Err(Error::Other(format!(
        "proxy (pid {}) did not start within {}s",
        child.id(),
        config.stop_timeout_secs
      )));
    }
    tokio::time::sleep(POLL_INTERVAL).await;
  }

  println!("Proxy started. Listening for browser requests...");
  Ok(())
}

/// Interrupt the running proxy and wait for it to release the session lock
pub async fn stop(config: &Config) -> Result<()> {
  let pid = match SessionLock::active(&config.pid_file)? {
    Some(pid) => pid,
    None => {
      println!("Proxy is not running.");
      return Ok(());
    }
  };

  println!("Stopping proxy...");
  send_interrupt(pid, &config.pid_file)?;
  let deadline = Instant::now() + Duration::from_secs(config.stop_timeout_secs);
  while config.pid_file.exists() {
    if Instant::now() >= deadline {
      return Err(Error::Other(format!(
        "proxy (pid {}) did not exit within {}s",
        pid, config.stop_timeout_secs
      )));
    }
    tokio::time::sleep(POLL_INTERVAL).await;
  }
  println!("Proxy stopped.");
  Ok(())
}

/// Dedup, render and archive the working store. Refused while a session is active.
pub fn save(config: &Config, offset: UtcOffset) -> Result<ArchiveOutcome> {
  if SessionLock::active(&config.pid_file)?.is_some() {
    return Err(Error::SessionActive(config.pid_file.clone()));
  }
  Archiver::new(
    WorkingStore::new(&config.store_path),
    &config.output_dir,
    Renderer::new(config.render.clone()),
  )
  .with_offset(offset)
  .archive()
}
