//! Traffic interception interfaces

use crate::error::Result;
use bytes::Bytes;
use http::{Request, Response, Uri};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// Render the URL the way a browser address bar shows it: default ports are dropped.
///
/// `https://example.com:443/a?b` becomes `https://example.com/a?b`.
pub fn pretty_url(uri: &Uri) -> String {
  let scheme = uri.scheme_str().unwrap_or("http");
  let host = uri.host().unwrap_or_default();
  let default_port = match scheme {
    "https" => Some(443),
    "http" => Some(80),
    _ => None,
  };
  let mut url = format!("{}://{}", scheme, host);
  if let Some(port) = uri.port_u16() {
    if Some(port) != default_port {
      url.push(':');
      url.push_str(&port.to_string());
    }
  }
  match uri.path_and_query() {
    Some(pq) => url.push_str(pq.as_str()),
    None => url.push('/'),
  }
  url
}

/// An intercepted HTTP request and where it is headed
#[derive(Clone)]
pub struct MitmRequest {
  /// Destination authority (host:port)
  pub destination: String,
  /// Interception time in milliseconds since the epoch
  pub timestamp: u64,
  pub request: Request<Bytes>,
}

impl MitmRequest {
  pub fn new(destination: impl Into<String>, request: Request<Bytes>) -> Self {
    Self {
      destination: destination.into(),
      timestamp: now_millis(),
      request,
    }
  }

  pub fn destination(&self) -> &str {
    &self.destination
  }

  pub fn timestamp(&self) -> u64 {
    self.timestamp
  }

  pub fn request(&self) -> &Request<Bytes> {
    &self.request
  }

  pub fn request_mut(&mut self) -> &mut Request<Bytes> {
    &mut self.request
  }

  /// Normalized URL of the request
  pub fn url(&self) -> String {
    pretty_url(self.request.uri())
  }

  pub fn into_inner(self) -> Request<Bytes> {
    self.request
  }
}

impl fmt::Debug for MitmRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MitmRequest")
      .field("destination", &self.destination)
      .field("timestamp", &self.timestamp)
      .field("method", self.request.method())
      .field("uri", self.request.uri())
      .field("body_len", &self.request.body().len())
      .finish()
  }
}

/// An upstream response together with the request URI that produced it
#[derive(Clone)]
pub struct MitmResponse {
  /// Authority the response came from (host:port)
  pub source: String,
  /// URI of the originating request
  pub request_uri: Uri,
  /// Interception time in milliseconds since the epoch
  pub timestamp: u64,
  pub response: Response<Bytes>,
}

impl MitmResponse {
  pub fn new(source: impl Into<String>, request_uri: Uri, response: Response<Bytes>) -> Self {
    Self {
      source: source.into(),
      request_uri,
      timestamp: now_millis(),
      response,
    }
  }

  pub fn source(&self) -> &str {
    &self.source
  }

  pub fn request_uri(&self) -> &Uri {
    &self.request_uri
  }

  /// Normalized URL of the originating request
  pub fn url(&self) -> String {
    pretty_url(&self.request_uri)
  }

  pub fn timestamp(&self) -> u64 {
    self.timestamp
  }

  pub fn response(&self) -> &Response<Bytes> {
    &self.response
  }

  pub fn response_mut(&mut self) -> &mut Response<Bytes> {
    &mut self.response
  }

  pub fn body(&self) -> &Bytes {
    self.response.body()
  }

  pub fn into_inner(self) -> Response<Bytes> {
    self.response
  }
}

impl fmt::Debug for MitmResponse {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MitmResponse")
      .field("source", &self.source)
      .field("request_uri", &self.request_uri)
      .field("timestamp", &self.timestamp)
      .field("status", &self.response.status())
      .field("body_len", &self.response.body().len())
      .finish()
  }
}

/// Trait for intercepting and modifying requests
#[async_trait::async_trait]
pub trait RequestInterceptor: Send + Sync {
  /// Return `None` to block the request, or the (possibly modified) request
  async fn intercept_request(&self, request: MitmRequest) -> Result<Option<MitmRequest>>;
}

/// Trait for intercepting and modifying responses
#[async_trait::async_trait]
pub trait ResponseInterceptor: Send + Sync {
  /// Return `None` to block the response, or the (possibly modified) response
  async fn intercept_response(&self, response: MitmResponse) -> Result<Option<MitmResponse>>;
}

/// Ordered chains of request and response interceptors
#[derive(Default)]
pub struct InterceptorHandler {
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
}

impl InterceptorHandler {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_request_interceptor(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
    self.request_interceptors.push(interceptor);
  }

  pub fn add_response_interceptor(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
    self.response_interceptors.push(interceptor);
  }

  /// Run a request through every request interceptor in registration order
  pub async fn process_request(&self, mut request: MitmRequest) -> Result<Option<MitmRequest>> {
    for interceptor in &self.request_interceptors {
      match interceptor.intercept_request(request).await? {
        Some(modified) => request = modified,
        None => return Ok(None),
      }
    }
    Ok(Some(request))
  }

  /// Run a response through every response interceptor in registration order
  pub async fn process_response(&self, mut response: MitmResponse) -> Result<Option<MitmResponse>> {
    for interceptor in &self.response_interceptors {
      match interceptor.intercept_response(response).await? {
        Some(modified) => response = modified,
        None => return Ok(None),
      }
    }
    Ok(Some(response))
  }

  pub fn has_interceptors(&self) -> bool {
    !self.request_interceptors.is_empty() || !self.response_interceptors.is_empty()
  }
}

/// Logs every request and response at debug level
pub struct LoggingInterceptor;

#[async_trait::async_trait]
impl RequestInterceptor for LoggingInterceptor {
  async fn intercept_request(&self, request: MitmRequest) -> Result<Option<MitmRequest>> {
    tracing::debug!(
      "[MITM] {} {} ({} bytes)",
      request.request().method(),
      request.url(),
      request.request().body().len()
    );
    Ok(Some(request))
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for LoggingInterceptor {
  async fn intercept_response(&self, response: MitmResponse) -> Result<Option<MitmResponse>> {
    tracing::debug!(
      "[MITM] {} <- {} ({} bytes)",
      response.response().status(),
      response.url(),
      response.body().len()
    );
    Ok(Some(response))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pretty_url_drops_default_port() {
    let uri: Uri = "https://ks2.rsmu.ru:443/tests2/questions".parse().unwrap();
    assert_eq!(pretty_url(&uri), "https://ks2.rsmu.ru/tests2/questions");
  }

  #[test]
  fn pretty_url_keeps_other_ports_and_query() {
    let uri: Uri = "http://127.0.0.1:8080/a?b=1".parse().unwrap();
    assert_eq!(pretty_url(&uri), "http://127.0.0.1:8080/a?b=1");
  }

  struct Blocker;

  #[async_trait::async_trait]
  impl RequestInterceptor for Blocker {
    async fn intercept_request(&self, _request: MitmRequest) -> Result<Option<MitmRequest>> {
      Ok(None)
    }
  }

  #[tokio::test]
  async fn chain_stops_at_blocking_interceptor() {
    let mut handler = InterceptorHandler::new();
    handler.add_request_interceptor(Arc::new(LoggingInterceptor));
    handler.add_request_interceptor(Arc::new(Blocker));
    assert!(handler.has_interceptors());

    let request = Request::builder()
      .uri("http://example.com/")
      .body(Bytes::new())
      .unwrap();
    let result = handler
      .process_request(MitmRequest::new("example.com:80", request))
      .await
      .unwrap();
    assert!(result.is_none());
  }
}
