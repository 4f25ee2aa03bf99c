#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # quiz-intercept
//!
//! Capture quiz questions from a web page while you browse it, then turn them into a
//! study report.
//!
//! A local HTTPS proxy (built on [`quiz_intercept_mitm`]) decrypts traffic to the quiz host
//! only. Whenever the question page is served, the questions embedded in its markup are
//! extracted, their type codes are resolved to category names, and they are appended to a
//! JSON working store. Archiving later deduplicates the store, writes a plain-text report
//! next to a JSON copy, and deletes the store.
//!
//! ## Capturing a page by hand
//!
//! ```rust
//! use quiz_intercept::{extract, normalize, Config};
//!
//! # fn run() -> quiz_intercept::Result<()> {
//! let config = Config::default();
//! let html = r#"<questions
//!   v-bind:questions='[{"text":"2+2?","type":1,"answers":[{"uid":7,"answer":"4"}]}]'
//!   v-bind:question-types='{"QUESTION_TYPE_SINGLE":1}'></questions>"#;
//! let raw = extract(html, &config.markup)?;
//! let normalized = normalize(raw.questions, &raw.types, config.type_prefix_len);
//! assert_eq!(normalized.accepted[0].kind, "SINGLE");
//! # Ok(())
//! # }
//! # run().unwrap();
//! ```
//!
//! ## Archiving
//!
//! ```rust,no_run
//! use quiz_intercept::{ArchiveOutcome, Archiver, Renderer, WorkingStore};
//!
//! # fn run() -> quiz_intercept::Result<()> {
//! let archiver = Archiver::new(
//!   WorkingStore::new("intercepted_data.json"),
//!   "output",
//!   Renderer::default(),
//! );
//! if let ArchiveOutcome::Archived { text_path, .. } = archiver.archive()? {
//!   println!("report written to {}", text_path.display());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Optional Features
//!
//! - **charset**: decode page bodies using the `Content-Type` charset (default)
//! - **gzip**: decode gzip and deflate page bodies (default)
mod accumulator;
mod archive;
mod capture;
mod config;
mod dedup;
mod errors;
mod extract;
mod model;
mod normalize;
mod render;
pub mod session;

pub use accumulator::{CaptureAccumulator, WorkingStore};
pub use archive::{local_offset, timestamp_label, ArchiveOutcome, Archiver};
pub use capture::{response_text, CaptureReport, QuestionCapture};
pub use config::{Config, MarkupConfig, RenderConfig, DEFAULT_CONFIG_FILE, TYPE_PREFIX_LEN};
pub use dedup::{dedup, QuestionKey};
pub use errors::{Error, Result};
pub use extract::{extract, RawCapture};
pub use model::{Answer, Ident, Question, MATCHING};
pub use normalize::{category, normalize, Normalized, TypeMap};
pub use quiz_intercept_mitm;
pub use render::Renderer;
