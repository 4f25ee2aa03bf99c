//! Integration tests for quiz-intercept-mitm

use async_trait::async_trait;
use quiz_intercept_mitm::{
  CertificateManager, MitmConfig, MitmProxy, MitmRequest, MitmResponse, RequestInterceptor,
  ResponseInterceptor, Result,
};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::rustls::ServerConfig;

#[tokio::test]
async fn test_ca_generation() {
  let temp_dir = tempfile::tempdir().unwrap();

  let manager = CertificateManager::new(temp_dir.path()).await;
  assert!(manager.is_ok(), "Failed to create certificate manager");
  let manager = manager.unwrap();

  let pem_content = manager.ca_cert_pem().unwrap();
  assert!(pem_content.contains("BEGIN CERTIFICATE"), "Invalid PEM format");
  assert!(pem_content.contains("END CERTIFICATE"), "Invalid PEM format");
  assert!(manager.ca_cert_path().exists(), "CA certificate file not created");
}

#[tokio::test]
async fn test_cached_server_cert_builds_tls_config() {
  let temp_dir = tempfile::tempdir().unwrap();
  let manager = CertificateManager::new(temp_dir.path()).await.unwrap();

  let (chain1, key1) = manager.get_server_cert("ks2.rsmu.ru").await.unwrap();
  assert_eq!(chain1.len(), 2, "Expected leaf + CA in chain");
  assert!(ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(chain1.clone(), key1)
    .is_ok());

  // Second lookup comes from the cache and must still pair the right key with the leaf.
  let (chain2, key2) = manager.get_server_cert("ks2.rsmu.ru").await.unwrap();
  assert_eq!(chain1[0].as_ref(), chain2[0].as_ref());
  assert!(ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(chain2, key2)
    .is_ok());
}

/// Upstream that answers every request on a connection with a fixed body
async fn spawn_upstream(body: &'static str) -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    loop {
      let (stream, _) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(_) => return,
      };
      tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        loop {
          let mut line = String::new();
          loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
              return;
            }
            if line == "\r\n" {
              break;
            }
          }
          let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
          );
          if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
            return;
          }
        }
      });
    }
  });
  port
}

struct RecordUrls(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl ResponseInterceptor for RecordUrls {
  async fn intercept_response(&self, response: MitmResponse) -> Result<Option<MitmResponse>> {
    self.0.lock().unwrap().push(response.url());
    Ok(Some(response))
  }
}

struct BlockPath(&'static str);

#[async_trait]
impl RequestInterceptor for BlockPath {
  async fn intercept_request(&self, request: MitmRequest) -> Result<Option<MitmRequest>> {
    if request.request().uri().path() == self.0 {
      return Ok(None);
    }
    Ok(Some(request))
  }
}

async fn proxied_get(proxy_port: u16, url: &str, host: &str) -> String {
  let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
  let request = format!(
    "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    url, host
  );
  stream.write_all(request.as_bytes()).await.unwrap();
  let mut raw = Vec::new();
  stream.read_to_end(&mut raw).await.unwrap();
  String::from_utf8_lossy(&raw).into_owned()
}

#[tokio::test]
async fn test_plain_http_runs_interceptor_chains() {
  let upstream_port = spawn_upstream("hello").await;
  let temp_dir = tempfile::tempdir().unwrap();
  let proxy = MitmProxy::new(MitmConfig {
    ca_storage_path: temp_dir.path().to_path_buf(),
    ..Default::default()
  })
  .await
  .unwrap();

  let seen = Arc::new(Mutex::new(Vec::new()));
  {
    let handler = proxy.interceptor_handler();
    let mut handler = handler.write().await;
    handler.add_request_interceptor(Arc::new(BlockPath("/blocked")));
    handler.add_response_interceptor(Arc::new(RecordUrls(seen.clone())));
  }

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let proxy_port = listener.local_addr().unwrap().port();
  let (stop_tx, stop_rx) = oneshot::channel::<()>();
  let server = tokio::spawn(async move {
    proxy
      .serve(listener, async {
        stop_rx.await.ok();
      })
      .await
  });

  let host = format!("127.0.0.1:{}", upstream_port);
  let url = format!("http://{}/tests2/questions", host);
  let response = proxied_get(proxy_port, &url, &host).await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
  assert!(response.contains("content-length: 5\r\n"));
  assert!(response.ends_with("hello"));
  assert_eq!(seen.lock().unwrap().as_slice(), [url.clone()]);

  let blocked = proxied_get(proxy_port, &format!("http://{}/blocked", host), &host).await;
  assert!(blocked.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", blocked);
  assert_eq!(seen.lock().unwrap().len(), 1);

  stop_tx.send(()).unwrap();
  assert!(server.await.unwrap().is_ok());
}
