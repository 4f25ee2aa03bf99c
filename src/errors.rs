//! capture and archive errors
use std::path::PathBuf;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `quiz_intercept::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while capturing, storing or archiving questions.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// Malformed JSON in the store or in a markup attribute
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  /// Proxy engine error
  #[error(transparent)]
  Mitm(#[from] quiz_intercept_mitm::Error),
  /// Config file could not be parsed
  #[error("invalid config {path}: {source}")]
  Config {
    /// The config file
    path: PathBuf,
    /// Parser error
    source: toml::de::Error,
  },
  /// The carrier element is not in the page
  #[error("no <{0}> element in response")]
  MissingElement(String),
  /// The carrier element lacks one of its JSON attributes
  #[error("<{element}> has no `{attribute}` attribute")]
  MissingAttribute {
    /// Carrier element name
    element: String,
    /// The absent attribute
    attribute: String,
  },
  /// The type map is not an object of name -> code
  #[error("question type map: {0}")]
  TypeMap(String),
  /// A question's type code is not in the type map
  #[error("unknown type code {0}")]
  UnknownTypeCode(String),
  /// The type name is not longer than the stripped prefix
  #[error("type name `{name}` is too short to strip {prefix_len} characters")]
  TypeNameTooShort {
    /// Full type name from the page
    name: String,
    /// Configured prefix length
    prefix_len: usize,
  },
  /// A question object does not fit the Question schema
  #[error("question schema: {0}")]
  Schema(String),
  /// Response body could not be decoded to text
  #[error("response body: {0}")]
  Body(String),
  /// The capture session lock is held, the proxy is running
  #[error("capture session is active (lock file {0}); stop the proxy first")]
  SessionActive(PathBuf),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

pub(crate) fn new_io_error(path: &std::path::Path, err: std::io::Error) -> Error {
  Error::IO(std::io::Error::new(
    err.kind(),
    format!("{}: {}", path.display(), err),
  ))
}
