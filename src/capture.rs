//! Interception filter: runs the capture pipeline on responses from the target URL
//!
//! Every other response passes through untouched, and a capture that fails never blocks the
//! response from reaching the browser.
use crate::accumulator::CaptureAccumulator;
use crate::config::{Config, MarkupConfig};
use crate::errors::{Error, Result};
use crate::extract::extract;
use crate::normalize::normalize;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(feature = "charset")]
use encoding_rs::{Encoding, UTF_8};
#[cfg(feature = "gzip")]
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use http::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING};
use http::Response;
#[cfg(feature = "charset")]
use mime::Mime;
use quiz_intercept_mitm::{MitmRequest, MitmResponse, RequestInterceptor, ResponseInterceptor};
use std::borrow::Cow;
#[cfg(feature = "gzip")]
use std::io::Read;
use std::sync::{Arc, Mutex};

/// Codings `decode_content` understands
#[cfg(feature = "gzip")]
const SUPPORTED_ENCODINGS: &str = "gzip, deflate, identity";
#[cfg(not(feature = "gzip"))]
const SUPPORTED_ENCODINGS: &str = "identity";

/// Result of one successful capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureReport {
  /// Questions appended by this capture
  pub accepted: usize,
  /// Questions dropped by type normalization
  pub rejected: usize,
  /// Questions in the accumulator afterwards
  pub total: usize,
}

/// Undo `Content-Encoding` so the markup can be parsed
fn decode_content(response: &Response<Bytes>) -> Result<Cow<'_, [u8]>> {
  let body = response.body();
  let coding = response
    .headers()
    .get(CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().to_ascii_lowercase());
  match coding.as_deref() {
    None | Some("") | Some("identity") => Ok(Cow::Borrowed(body.as_ref())),
    #[cfg(feature = "gzip")]
    Some("gzip") | Some("x-gzip") => {
      let mut decoded = Vec::new();
      MultiGzDecoder::new(body.as_ref()).read_to_end(&mut decoded)?;
      Ok(Cow::Owned(decoded))
    }
    #[cfg(feature = "gzip")]
    Some("deflate") => {
      let mut decoded = Vec::new();
      ZlibDecoder::new(body.as_ref()).read_to_end(&mut decoded)?;
      Ok(Cow::Owned(decoded))
    }
    Some(other) => Err(Error::Body(format!("unsupported content-encoding `{}`", other))),
  }
}

/// Decode text using the `Content-Type` charset, falling back to UTF-8
#[cfg(feature = "charset")]
fn decode_text(response: &Response<Bytes>, bytes: &[u8]) -> String {
  let default_encoding = "utf-8";
  let header_encoding = response
    .headers()
    .get(http::header::CONTENT_TYPE)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.parse::<Mime>().ok())
    .and_then(|mime| mime.get_param("charset").map(|charset| charset.as_str().to_string()))
    .unwrap_or_else(|| default_encoding.to_string());
  let mut decoded = String::new();
  for encoding_name in [header_encoding.as_str(), default_encoding] {
    let encoding = Encoding::for_label(encoding_name.as_bytes()).unwrap_or(UTF_8);
    let (text, _, had_errors) = encoding.decode(bytes);
    decoded = text.into_owned();
    if !had_errors {
      break;
    }
  }
  decoded
}

#[cfg(not(feature = "charset"))]
fn decode_text(_response: &Response<Bytes>, bytes: &[u8]) -> String {
  String::from_utf8_lossy(bytes).into_owned()
}

/// Body of `response` as text
pub fn response_text(response: &Response<Bytes>) -> Result<String> {
  let content = decode_content(response)?;
  Ok(decode_text(response, &content))
}

/// Captures questions from responses to the target URL into the accumulator
pub struct QuestionCapture {
  target_url: String,
  markup: MarkupConfig,
  prefix_len: usize,
  accumulator: Arc<Mutex<CaptureAccumulator>>,
}

impl QuestionCapture {
  /// Capture into `accumulator` using the target and markup settings of `config`
  pub fn new(config: &Config, accumulator: Arc<Mutex<CaptureAccumulator>>) -> Self {
    Self {
      target_url: config.target_url.clone(),
      markup: config.markup.clone(),
      prefix_len: config.type_prefix_len,
      accumulator,
    }
  }

  /// Exact match against the normalized request URL
  pub fn matches(&self, url: &str) -> bool {
    url == self.target_url
  }

  /// Extract, normalize and record the questions carried by `response`.
  pub fn capture(&self, response: &Response<Bytes>) -> Result<CaptureReport> {
    let html = response_text(response)?;
    let raw = extract(&html, &self.markup)?;
    let normalized = normalize(raw.questions, &raw.types, self.prefix_len);
    let accepted = normalized.accepted.len();
    let mut accumulator = self
      .accumulator
      .lock()
      .map_err(|_| Error::Other("capture accumulator lock poisoned".to_string()))?;
    let total = accumulator.record(normalized.accepted)?;
    Ok(CaptureReport {
      accepted,
      rejected: normalized.rejected.len(),
      total,
    })
  }
}

#[async_trait]
impl RequestInterceptor for QuestionCapture {
  async fn intercept_request(
    &self,
    mut request: MitmRequest,
  ) -> quiz_intercept_mitm::Result<Option<MitmRequest>> {
    if self.matches(&request.url()) {
      // Keep the answer in a coding we can read; brotli and zstd are not decoded.
      request
        .request_mut()
        .headers_mut()
        .insert(ACCEPT_ENCODING, HeaderValue::from_static(SUPPORTED_ENCODINGS));
    }
    Ok(Some(request))
  }
}

#[async_trait]
impl ResponseInterceptor for QuestionCapture {
  async fn intercept_response(
    &self,
    response: MitmResponse,
  ) -> quiz_intercept_mitm::Result<Option<MitmResponse>> {
    let url = response.url();
    if !self.matches(&url) {
      return Ok(Some(response));
    }
    match self.capture(response.response()) {
      Ok(report) => tracing::info!(
        "Received request and processed data: {} new question(s), {} rejected, {} total",
        report.accepted,
        report.rejected,
        report.total
      ),
      Err(e) => tracing::warn!("capture from {} failed: {}", url, e),
    }
    Ok(Some(response))
  }
}
