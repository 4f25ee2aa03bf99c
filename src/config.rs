//! Runtime configuration
//!
//! Every value has a default reproducing the fixed constants of the quiz platform, so the
//! tool runs without a config file. A TOML file may override any subset of them.
use crate::errors::{new_io_error, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file picked up from the working directory when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "quiz-intercept.toml";

/// Length of the namespace prefix the platform puts in front of every type name.
///
/// Coupled to the upstream naming scheme; revalidate if captured categories come out
/// truncated or with a leftover prefix.
pub const TYPE_PREFIX_LEN: usize = 14;

/// Settings for the proxy, the capture pipeline and the archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Address the proxy listens on
  pub listen_addr: String,
  /// The one URL whose responses carry the questions
  pub target_url: String,
  /// Working store of not yet archived captures
  pub store_path: PathBuf,
  /// Directory receiving the archive pairs
  pub output_dir: PathBuf,
  /// PID file marking a running capture session
  pub pid_file: PathBuf,
  /// Directory holding the proxy CA
  pub ca_storage_path: PathBuf,
  /// How long `stop` waits for the proxy to exit
  pub stop_timeout_secs: u64,
  /// Upstream request timeout
  pub connection_timeout_secs: u64,
  /// Characters stripped from every type name, see [`TYPE_PREFIX_LEN`]
  pub type_prefix_len: usize,
  /// Where the payload sits in the page
  pub markup: MarkupConfig,
  /// Image hosts for the text report
  pub render: RenderConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      listen_addr: "127.0.0.1:44700".to_string(),
      target_url: "https://ks2.rsmu.ru/tests2/questions".to_string(),
      store_path: PathBuf::from("intercepted_data.json"),
      output_dir: PathBuf::from("output"),
      pid_file: PathBuf::from("proxy.pid"),
      ca_storage_path: PathBuf::from(".quiz-intercept"),
      stop_timeout_secs: 10,
      connection_timeout_secs: 60,
      type_prefix_len: TYPE_PREFIX_LEN,
      markup: MarkupConfig::default(),
      render: RenderConfig::default(),
    }
  }
}

/// Where the payload hides in the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkupConfig {
  /// Tag name of the carrier element
  pub element: String,
  /// Attribute holding the questions array
  pub questions_attr: String,
  /// Attribute holding the type name -> code map
  pub types_attr: String,
}

impl Default for MarkupConfig {
  fn default() -> Self {
    Self {
      element: "questions".to_string(),
      questions_attr: "v-bind:questions".to_string(),
      types_attr: "v-bind:question-types".to_string(),
    }
  }
}

/// Image hosts referenced by the text report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
  /// Prefix for question image ids
  pub question_image_base_url: String,
  /// Prefix for the first image id of an answer
  pub answer_image_base_url: String,
}

impl Default for RenderConfig {
  fn default() -> Self {
    Self {
      question_image_base_url: "https://ks.rsmu.ru/upload/l_btz_filequestion/".to_string(),
      answer_image_base_url: "https://ks.rsmu.ru/upload/l_btz_fileanswer/".to_string(),
    }
  }
}

impl Config {
  /// Load `path` if given, else `quiz-intercept.toml` if present, else the defaults.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    match path {
      Some(path) => Self::from_file(path),
      None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(Path::new(DEFAULT_CONFIG_FILE)),
      None => Ok(Self::default()),
    }
  }

  /// Parse a TOML file; missing keys keep their defaults
  pub fn from_file(path: &Path) -> Result<Self> {
    let content = std::fs::read_to_string(path).map_err(|e| new_io_error(path, e))?;
    let config: Config = toml::from_str(&content).map_err(|source| Error::Config {
      path: path.to_path_buf(),
      source,
    })?;
    tracing::debug!("loaded config from {}", path.display());
    Ok(config)
  }

  /// Host part of `target_url`, the only host whose tunnels get decrypted
  pub fn target_host(&self) -> Result<String> {
    let uri: http::Uri = self
      .target_url
      .parse()
      .map_err(|e| Error::Other(format!("invalid target_url {}: {}", self.target_url, e)))?;
    uri
      .host()
      .map(str::to_string)
      .ok_or_else(|| Error::Other(format!("target_url {} has no host", self.target_url)))
  }
}
