//! MITM proxy server implementation

use crate::ca::CertificateManager;
use crate::error::{Error, Result};
use crate::interceptor::{InterceptorHandler, MitmRequest, MitmResponse};
use crate::proxy::MitmConfig;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
  AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Request line plus headers
const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
  "connection",
  "proxy-connection",
  "keep-alive",
  "transfer-encoding",
  "te",
  "trailer",
  "upgrade",
  "proxy-authorization",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
  HOP_BY_HOP.contains(&name.as_str())
}

/// Request line and header block as read off the wire
#[derive(Debug)]
struct RequestHead {
  method: String,
  target: String,
  version: String,
  headers: Vec<(String, String)>,
}

impl RequestHead {
  fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  fn keep_alive(&self) -> bool {
    let connection = self
      .header("connection")
      .or_else(|| self.header("proxy-connection"))
      .map(|v| v.to_ascii_lowercase());
    match connection.as_deref() {
      Some(v) if v.contains("close") => false,
      Some(v) if v.contains("keep-alive") => true,
      _ => self.version != "HTTP/1.0",
    }
  }
}

/// State shared by every connection task
#[derive(Clone)]
struct Context {
  config: MitmConfig,
  cert_manager: Arc<CertificateManager>,
  interceptor: Arc<RwLock<InterceptorHandler>>,
  client: reqwest::Client,
}

impl Context {
  fn should_intercept(&self, host: &str) -> bool {
    if !self.config.enable_https_interception {
      return false;
    }
    match &self.config.intercept_hosts {
      Some(hosts) => hosts.iter().any(|h| h.eq_ignore_ascii_case(host)),
      None => true,
    }
  }
}

/// Proxy server: accepts browser connections and runs the interceptor chains
pub struct ProxyServer {
  ctx: Context,
}

impl ProxyServer {
  pub fn new(
    config: MitmConfig,
    cert_manager: Arc<CertificateManager>,
    interceptor: Arc<RwLock<InterceptorHandler>>,
  ) -> Result<Self> {
    // Redirects and cookies belong to the browser, the proxy only relays them.
    let client = reqwest::Client::builder()
      .no_proxy()
      .redirect(reqwest::redirect::Policy::none())
      .timeout(Duration::from_secs(config.connection_timeout))
      .build()
      .map_err(|e| Error::proxy_error(format!("Failed to build upstream client: {}", e)))?;
    Ok(Self {
      ctx: Context {
        config,
        cert_manager,
        interceptor,
        client,
      },
    })
  }

  /// Bind `addr` and serve until `shutdown` resolves
  pub async fn run<F>(&self, addr: &str, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::proxy_error(format!("Failed to bind to {}: {}", addr, e)))?;
    self.serve(listener, shutdown).await
  }

  /// Serve connections from an already bound listener until `shutdown` resolves
  pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    if let Ok(local) = listener.local_addr() {
      tracing::info!("[MITM] listening on {}", local);
    }
    tokio::pin!(shutdown);
    loop {
      tokio::select! {
        _ = &mut shutdown => {
          tracing::info!("[MITM] shutdown requested, no longer accepting connections");
          return Ok(());
        }
        accepted = listener.accept() => match accepted {
          Ok((stream, peer_addr)) => {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
              if let Err(e) = Self::handle_connection(stream, peer_addr, ctx).await {
                tracing::debug!("[MITM] connection from {} ended with error: {}", peer_addr, e);
              }
            });
          }
          Err(e) => tracing::error!("[MITM] Failed to accept connection: {}", e),
        }
      }
    }
  }

  async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, ctx: Context) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let head = match read_head(&mut reader).await? {
      Some(head) => head,
      None => return Ok(()),
    };
    tracing::trace!("[MITM] {} {} from {}", head.method, head.target, peer_addr);

    if head.method.eq_ignore_ascii_case("CONNECT") {
      let (host, port) = parse_host_port(&head.target)?;
      // The browser waits for our 200 before its ClientHello, so nothing is buffered yet.
      let stream = reader.into_inner();
      if ctx.should_intercept(&host) {
        Self::accept_tls_and_handle(stream, &host, port, ctx).await
      } else {
        Self::tcp_tunnel(stream, &host, port).await
      }
    } else {
      Self::serve_http(reader, Some(head), "http", None, &ctx).await
    }
  }

  /// Answer a CONNECT, terminate TLS with a minted leaf and serve the decrypted requests
  async fn accept_tls_and_handle(
    mut client_stream: TcpStream,
    domain: &str,
    port: u16,
    ctx: Context,
  ) -> Result<()> {
    client_stream
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    client_stream.flush().await?;

    let (cert_chain, key) = ctx.cert_manager.get_server_cert(domain).await?;
    let acceptor = TlsAcceptor::from(Arc::new(create_tls_server_config(cert_chain, key)?));
    let tls_stream = acceptor
      .accept(client_stream)
      .await
      .map_err(|e| Error::tls_error(format!("TLS handshake with browser for {} failed: {}", domain, e)))?;

    let authority = format!("{}:{}", domain, port);
    Self::serve_http(BufReader::new(tls_stream), None, "https", Some(authority), &ctx).await
  }

  /// Relay bytes between the browser and `host:port` without looking at them
  async fn tcp_tunnel(mut client_stream: TcpStream, host: &str, port: u16) -> Result<()> {
    let mut target_stream = TcpStream::connect((host, port))
      .await
      .map_err(|e| Error::connection_error(format!("Failed to connect to {}:{}: {}", host, port, e)))?;
    client_stream
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    tokio::io::copy_bidirectional(&mut client_stream, &mut target_stream).await?;
    Ok(())
  }

  /// Serve HTTP/1.1 requests off one client connection until it closes.
  ///
  /// `authority` is the CONNECT target for decrypted tunnels; plain proxy requests carry an
  /// absolute URI instead.
  async fn serve_http<S>(
    mut reader: BufReader<S>,
    mut pending: Option<RequestHead>,
    scheme: &str,
    authority: Option<String>,
    ctx: &Context,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    loop {
      let head = match pending.take() {
        Some(head) => head,
        None => match read_head(&mut reader).await? {
          Some(head) => head,
          None => return Ok(()),
        },
      };
      let keep_alive = head.keep_alive();
      let request = read_request(&mut reader, head, scheme, authority.as_deref()).await?;
      let is_head = request.method() == Method::HEAD;
      let destination = request
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();

      let response = Self::forward(ctx, request, &destination).await?;
      let bytes = serialize_http_response(&response, keep_alive, is_head);
      let stream = reader.get_mut();
      stream.write_all(&bytes).await?;
      stream.flush().await?;

      if !keep_alive {
        return Ok(());
      }
    }
  }

  /// Run the request chain, send upstream, run the response chain
  async fn forward(ctx: &Context, request: Request<Bytes>, destination: &str) -> Result<Response<Bytes>> {
    let handler = ctx.interceptor.read().await;
    let request = match handler
      .process_request(MitmRequest::new(destination, request))
      .await?
    {
      Some(request) => request.into_inner(),
      None => return Ok(status_response(StatusCode::FORBIDDEN)),
    };

    let request_uri = request.uri().clone();
    let response = match send_upstream(&ctx.client, request).await {
      Ok(response) => response,
      Err(e) => {
        tracing::warn!("[MITM] upstream request to {} failed: {}", request_uri, e);
        return Ok(status_response(StatusCode::BAD_GATEWAY));
      }
    };

    match handler
      .process_response(MitmResponse::new(destination, request_uri, response))
      .await?
    {
      Some(response) => Ok(response.into_inner()),
      None => Ok(status_response(StatusCode::FORBIDDEN)),
    }
  }
}

async fn send_upstream(client: &reqwest::Client, request: Request<Bytes>) -> Result<Response<Bytes>> {
  let (parts, body) = request.into_parts();
  let mut headers = HeaderMap::new();
  for (name, value) in parts.headers.iter() {
    if is_hop_by_hop(name) || name == header::HOST {
      continue;
    }
    headers.append(name.clone(), value.clone());
  }

  let upstream = client
    .request(parts.method, parts.uri.to_string())
    .headers(headers)
    .body(body)
    .send()
    .await?;

  let status = upstream.status();
  let headers = upstream.headers().clone();
  let body = upstream.bytes().await?;

  let mut response = Response::builder().status(status).body(body)?;
  *response.headers_mut() = headers;
  Ok(response)
}

fn status_response(status: StatusCode) -> Response<Bytes> {
  let mut response = Response::new(Bytes::new());
  *response.status_mut() = status;
  response
}

/// Read the request line and headers. `None` means the peer closed between requests.
async fn read_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
  R: AsyncBufRead + Unpin,
{
  let mut total = 0usize;
  let mut request_line = String::new();
  // Tolerate stray CRLFs left between pipelined requests.
  loop {
    request_line.clear();
    let n = reader.read_line(&mut request_line).await?;
    if n == 0 {
      return Ok(None);
    }
    total += n;
    if !request_line.trim().is_empty() {
      break;
    }
    if total > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("Request head too large"));
    }
  }

  let mut parts = request_line.split_whitespace();
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
    _ => {
      return Err(Error::invalid_request(format!(
        "Invalid request line: {}",
        request_line.trim_end()
      )))
    }
  };

  let mut headers = Vec::new();
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
      return Err(Error::invalid_request("Connection closed inside request head"));
    }
    total += n;
    if total > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("Request head too large"));
    }
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
      break;
    }
    if let Some((name, value)) = line.split_once(':') {
      headers.push((name.trim().to_string(), value.trim().to_string()));
    }
  }

  Ok(Some(RequestHead {
    method,
    target,
    version,
    headers,
  }))
}

/// Turn a head into a full `http::Request`, reading its body off the connection
async fn read_request<R>(
  reader: &mut R,
  head: RequestHead,
  scheme: &str,
  authority: Option<&str>,
) -> Result<Request<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  let uri = if head.target.starts_with("http://") || head.target.starts_with("https://") {
    head.target.clone()
  } else {
    let authority = authority
      .or_else(|| head.header("host"))
      .ok_or_else(|| Error::invalid_request("Origin-form request without Host"))?;
    format!("{}://{}{}", scheme, authority, head.target)
  };

  let chunked = head
    .header("transfer-encoding")
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false);
  let body = if chunked {
    read_chunked_body(reader).await?
  } else {
    match head.header("content-length") {
      Some(len) => {
        let len: usize = len
          .parse()
          .map_err(|_| Error::invalid_request(format!("Invalid Content-Length: {}", len)))?;
        if len > MAX_BODY_SIZE {
          return Err(Error::invalid_request("Request body too large"));
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        body
      }
      None => Vec::new(),
    }
  };

  let mut builder = Request::builder().method(head.method.as_str()).uri(uri);
  for (name, value) in &head.headers {
    builder = builder.header(name.as_str(), value.as_str());
  }
  Ok(builder.body(Bytes::from(body))?)
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let mut size_line = String::new();
    if reader.read_line(&mut size_line).await? == 0 {
      return Err(Error::invalid_request("Connection closed inside chunked body"));
    }
    let size_str = size_line.trim().split(';').next().unwrap_or_default();
    let size = usize::from_str_radix(size_str, 16)
      .map_err(|_| Error::invalid_request(format!("Invalid chunk size: {}", size_str)))?;
    if size == 0 {
      // Trailer section ends with an empty line.
      loop {
        let mut trailer = String::new();
        let n = reader.read_line(&mut trailer).await?;
        if n == 0 || trailer.trim().is_empty() {
          return Ok(body);
        }
      }
    }
    if body.len() + size > MAX_BODY_SIZE {
      return Err(Error::invalid_request("Request body too large"));
    }
    let start = body.len();
    body.resize(start + size, 0);
    reader.read_exact(&mut body[start..]).await?;
    let mut crlf = String::new();
    reader.read_line(&mut crlf).await?;
  }
}

fn create_tls_server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
  ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))
}

/// Split `host:port`, accepting bracketed IPv6 literals
fn parse_host_port(target: &str) -> Result<(String, u16)> {
  let (host, port) = target
    .rsplit_once(':')
    .ok_or_else(|| Error::invalid_request(format!("Invalid CONNECT target: {}", target)))?;
  let port = port
    .parse::<u16>()
    .map_err(|_| Error::invalid_request(format!("Invalid port: {}", port)))?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() {
    return Err(Error::invalid_request(format!("Invalid CONNECT target: {}", target)));
  }
  Ok((host.to_string(), port))
}

/// Serialize a response for the browser; the body is always sent with a fresh Content-Length
fn serialize_http_response(response: &Response<Bytes>, keep_alive: bool, is_head: bool) -> Vec<u8> {
  let mut buf = Vec::with_capacity(response.body().len() + 512);
  let status = response.status();
  buf.extend_from_slice(
    format!(
      "HTTP/1.1 {} {}\r\n",
      status.as_u16(),
      status.canonical_reason().unwrap_or("Unknown")
    )
    .as_bytes(),
  );

  for (name, value) in response.headers() {
    if is_hop_by_hop(name) || (name == header::CONTENT_LENGTH && !is_head) {
      continue;
    }
    write_header(&mut buf, name, value);
  }
  if !is_head {
    buf.extend_from_slice(format!("content-length: {}\r\n", response.body().len()).as_bytes());
  }
  if !keep_alive {
    buf.extend_from_slice(b"connection: close\r\n");
  }
  buf.extend_from_slice(b"\r\n");
  if !is_head {
    buf.extend_from_slice(response.body());
  }
  buf
}

fn write_header(buf: &mut Vec<u8>, name: &HeaderName, value: &HeaderValue) {
  buf.extend_from_slice(name.as_str().as_bytes());
  buf.extend_from_slice(b": ");
  buf.extend_from_slice(value.as_bytes());
  buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_host_and_port() {
    assert_eq!(
      parse_host_port("ks2.rsmu.ru:443").unwrap(),
      ("ks2.rsmu.ru".to_string(), 443)
    );
    assert_eq!(parse_host_port("[::1]:8443").unwrap(), ("::1".to_string(), 8443));
    assert!(parse_host_port("no-port").is_err());
    assert!(parse_host_port("host:http").is_err());
  }

  #[tokio::test]
  async fn reads_content_length_body() {
    let raw = b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhelloGET";
    let mut reader = BufReader::new(&raw[..]);
    let head = read_head(&mut reader).await.unwrap().unwrap();
    assert!(head.keep_alive());
    let request = read_request(&mut reader, head, "https", Some("example.com:443"))
      .await
      .unwrap();
    assert_eq!(request.method(), Method::POST);
    assert_eq!(request.uri(), "https://example.com:443/submit");
    assert_eq!(request.body().as_ref(), b"hello");
  }

  #[tokio::test]
  async fn reads_chunked_body() {
    let raw = b"POST http://example.com/x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let head = read_head(&mut reader).await.unwrap().unwrap();
    let request = read_request(&mut reader, head, "http", None).await.unwrap();
    assert_eq!(request.uri(), "http://example.com/x");
    assert_eq!(request.body().as_ref(), b"Wikipedia");
  }

  #[tokio::test]
  async fn empty_stream_has_no_head() {
    let mut reader = BufReader::new(&b""[..]);
    assert!(read_head(&mut reader).await.unwrap().is_none());
  }

  #[test]
  fn http10_closes_by_default() {
    let head = RequestHead {
      method: "GET".into(),
      target: "/".into(),
      version: "HTTP/1.0".into(),
      headers: vec![],
    };
    assert!(!head.keep_alive());
  }

  #[test]
  fn serialized_response_recomputes_length_and_drops_chunking() {
    let response = Response::builder()
      .status(200)
      .header("transfer-encoding", "chunked")
      .header("content-length", "999")
      .header("content-type", "text/html")
      .body(Bytes::from_static(b"abc"))
      .unwrap();
    let text = String::from_utf8(serialize_http_response(&response, false, false)).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("content-type: text/html\r\n"));
    assert!(text.contains("content-length: 3\r\n"));
    assert!(text.contains("connection: close\r\n"));
    assert!(!text.contains("999"));
    assert!(!text.contains("chunked"));
    assert!(text.ends_with("\r\n\r\nabc"));
  }
}
