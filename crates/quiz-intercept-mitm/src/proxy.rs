//! MITM proxy configuration and entry point

use crate::ca::CertificateManager;
use crate::error::Result;
use crate::interceptor::InterceptorHandler;
use crate::server::ProxyServer;
use std::future::{self, Future};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Configuration for the MITM proxy
#[derive(Clone, Debug)]
pub struct MitmConfig {
  /// Directory holding `ca_cert.pem` / `ca_key.pem`
  pub ca_storage_path: PathBuf,
  /// Decrypt CONNECT tunnels; when off every tunnel is relayed as raw bytes
  pub enable_https_interception: bool,
  /// Only decrypt tunnels to these hosts. `None` decrypts everything.
  pub intercept_hosts: Option<Vec<String>>,
  /// Upstream request timeout in seconds
  pub connection_timeout: u64,
}

impl Default for MitmConfig {
  fn default() -> Self {
    Self {
      ca_storage_path: PathBuf::from(".quiz-intercept"),
      enable_https_interception: true,
      intercept_hosts: None,
      connection_timeout: 60,
    }
  }
}

/// MITM proxy: a CA, an interceptor chain and a server to run them
pub struct MitmProxy {
  config: MitmConfig,
  cert_manager: Arc<CertificateManager>,
  interceptor_handler: Arc<RwLock<InterceptorHandler>>,
}

impl MitmProxy {
  pub async fn new(config: MitmConfig) -> Result<Self> {
    let cert_manager = Arc::new(CertificateManager::new(&config.ca_storage_path).await?);
    Ok(Self {
      config,
      cert_manager,
      interceptor_handler: Arc::new(RwLock::new(InterceptorHandler::new())),
    })
  }

  /// CA certificate in PEM format. The browser must trust it for decrypted hosts.
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.cert_manager.ca_cert_pem()
  }

  pub fn ca_cert_path(&self) -> PathBuf {
    self.cert_manager.ca_cert_path()
  }

  pub fn interceptor_handler(&self) -> Arc<RwLock<InterceptorHandler>> {
    self.interceptor_handler.clone()
  }

  fn server(&self) -> Result<ProxyServer> {
    ProxyServer::new(
      self.config.clone(),
      self.cert_manager.clone(),
      self.interceptor_handler.clone(),
    )
  }

  /// Serve on `addr` forever
  pub async fn start(&self, addr: &str) -> Result<()> {
    self.start_with_shutdown(addr, future::pending()).await
  }

  /// Serve on `addr` until `shutdown` resolves
  pub async fn start_with_shutdown<F>(&self, addr: &str, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    self.server()?.run(addr, shutdown).await
  }

  /// Serve on an already bound listener until `shutdown` resolves
  pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    self.server()?.serve(listener, shutdown).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn creates_ca_on_first_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = MitmConfig {
      ca_storage_path: dir.path().join("ca"),
      ..Default::default()
    };
    let proxy = MitmProxy::new(config).await.unwrap();
    assert!(proxy.ca_cert_path().exists());
    assert!(proxy.ca_cert_pem().unwrap().contains("BEGIN CERTIFICATE"));
  }
}
