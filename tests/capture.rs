//! Interception filter tests: responses are fed straight to the interceptor chains

use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use http::{Request, Response, Uri};
use quiz_intercept::quiz_intercept_mitm::{
  MitmRequest, MitmResponse, RequestInterceptor, ResponseInterceptor,
};
use quiz_intercept::{CaptureAccumulator, Config, QuestionCapture, WorkingStore};
use std::sync::{Arc, Mutex};

const TARGET: &str = "https://ks2.rsmu.ru/tests2/questions";

const PAGE: &str = r#"<!DOCTYPE html><html><body><div id="app"><questions
  v-bind:questions='[{"text":"Q1","type":3,"images":[],"answers":[{"uid":1,"answer":"A","images":[]}]},
                     {"text":"Q2","type":8,"images":[],"answers":[{"uid":2,"answer":"B","images":[]}]}]'
  v-bind:question-types='{"QUESTION_TYPE_SINGLE":3}'></questions></div></body></html>"#;

struct Fixture {
  _dir: tempfile::TempDir,
  store: WorkingStore,
  accumulator: Arc<Mutex<CaptureAccumulator>>,
  capture: QuestionCapture,
}

fn fixture() -> Fixture {
  let dir = tempfile::tempdir().unwrap();
  let store = WorkingStore::new(dir.path().join("intercepted_data.json"));
  let accumulator = Arc::new(Mutex::new(CaptureAccumulator::open(store.clone()).unwrap()));
  let capture = QuestionCapture::new(&Config::default(), accumulator.clone());
  Fixture {
    _dir: dir,
    store,
    accumulator,
    capture,
  }
}

fn html_response(uri: &str, body: impl Into<Bytes>) -> MitmResponse {
  let response = Response::builder()
    .status(200)
    .header(CONTENT_TYPE, "text/html; charset=utf-8")
    .body(body.into())
    .unwrap();
  MitmResponse::new("ks2.rsmu.ru:443", uri.parse::<Uri>().unwrap(), response)
}

#[tokio::test]
async fn target_response_is_captured_and_passed_through() {
  let f = fixture();
  let response = html_response("https://ks2.rsmu.ru:443/tests2/questions", PAGE);

  let passed = f.capture.intercept_response(response).await.unwrap().unwrap();
  assert_eq!(passed.body().as_ref(), PAGE.as_bytes());

  // Q2 has a type code missing from the map and is left out.
  let accumulator = f.accumulator.lock().unwrap();
  assert_eq!(accumulator.len(), 1);
  assert_eq!(accumulator.questions()[0].text, "Q1");
  assert_eq!(accumulator.questions()[0].kind, "SINGLE");
  assert_eq!(f.store.load().unwrap(), accumulator.questions());
}

#[tokio::test]
async fn other_urls_are_ignored() {
  let f = fixture();
  for uri in [
    "https://ks2.rsmu.ru/tests2/questions?page=2",
    "https://ks2.rsmu.ru/tests2/",
    "https://example.com/tests2/questions",
  ] {
    let passed = f
      .capture
      .intercept_response(html_response(uri, PAGE))
      .await
      .unwrap();
    assert!(passed.is_some());
  }
  assert!(f.accumulator.lock().unwrap().is_empty());
  assert!(!f.store.path().exists());
}

#[tokio::test]
async fn malformed_page_changes_nothing() {
  let f = fixture();
  for body in [
    "<html><body>no questions here</body></html>",
    "<questions v-bind:questions='[{' v-bind:question-types='{}'></questions>",
    "<questions v-bind:questions='[]'></questions>",
  ] {
    let passed = f
      .capture
      .intercept_response(html_response(TARGET, body))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(passed.body().as_ref(), body.as_bytes());
  }
  assert!(f.accumulator.lock().unwrap().is_empty());
  assert!(!f.store.path().exists());
}

#[test]
fn each_capture_appends_to_the_store() {
  let f = fixture();
  let response = html_response(TARGET, PAGE);
  let first = f.capture.capture(response.response()).unwrap();
  assert_eq!((first.accepted, first.rejected, first.total), (1, 1, 1));
  let second = f.capture.capture(response.response()).unwrap();
  assert_eq!(second.total, 2);
  assert_eq!(f.store.load().unwrap().len(), 2);
}

#[cfg(feature = "gzip")]
#[test]
fn gzip_page_is_decoded() {
  use flate2::write::GzEncoder;
  use flate2::Compression;
  use std::io::Write;

  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(PAGE.as_bytes()).unwrap();
  let compressed = encoder.finish().unwrap();

  let f = fixture();
  let response = Response::builder()
    .header(CONTENT_ENCODING, "gzip")
    .body(Bytes::from(compressed))
    .unwrap();
  let report = f.capture.capture(&response).unwrap();
  assert_eq!(report.accepted, 1);
}

#[test]
fn unknown_content_encoding_is_an_error() {
  let f = fixture();
  let response = Response::builder()
    .header(CONTENT_ENCODING, "br")
    .body(Bytes::from_static(b"\x0b\x02\x80"))
    .unwrap();
  assert!(f.capture.capture(&response).is_err());
  assert!(f.accumulator.lock().unwrap().is_empty());
}

#[tokio::test]
async fn accept_encoding_is_narrowed_for_target_only() {
  let f = fixture();
  let request = |uri: &str| {
    let request = Request::builder()
      .uri(uri)
      .header(ACCEPT_ENCODING, "gzip, deflate, br, zstd")
      .body(Bytes::new())
      .unwrap();
    MitmRequest::new("ks2.rsmu.ru:443", request)
  };

  let target = f.capture.intercept_request(request(TARGET)).await.unwrap().unwrap();
  let narrowed = target.request().headers()[ACCEPT_ENCODING].to_str().unwrap();
  assert!(!narrowed.contains("br"));
  assert!(!narrowed.contains("zstd"));

  let other = f
    .capture
    .intercept_request(request("https://ks2.rsmu.ru/static/app.js"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(
    other.request().headers()[ACCEPT_ENCODING],
    "gzip, deflate, br, zstd"
  );
}
