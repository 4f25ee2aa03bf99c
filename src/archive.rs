//! Turn the working store into a timestamped text + JSON archive pair
use crate::accumulator::{to_json_pretty, WorkingStore};
use crate::dedup::dedup;
use crate::errors::{new_io_error, Error, Result};
use crate::render::Renderer;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// What an archive run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
  /// The store was absent or held no questions; nothing was written
  NothingToArchive,
  /// Both files were written and the store was removed
  Archived {
    /// The text report
    text_path: PathBuf,
    /// The deduplicated JSON copy
    json_path: PathBuf,
    /// Questions left after deduplication
    questions: usize,
  },
}

/// Local UTC offset, falling back to UTC when it cannot be determined.
///
/// On some platforms this only succeeds while the process is single-threaded, so call it
/// before starting the async runtime.
pub fn local_offset() -> UtcOffset {
  UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)
}

/// `DD-MM-YYYY_HH-MM-SS`
pub fn timestamp_label(at: OffsetDateTime) -> Result<String> {
  let format = format_description!("[day]-[month]-[year]_[hour]-[minute]-[second]");
  at.format(&format)
    .map_err(|e| Error::Other(format!("timestamp format: {}", e)))
}

/// Create `path` (never overwriting) and fill it; a partial file is removed on failure.
fn write_new(path: &Path, content: &[u8]) -> Result<()> {
  let mut file = OpenOptions::new()
    .write(true)
    .create_new(true)
    .open(path)
    .map_err(|e| new_io_error(path, e))?;
  let written = file.write_all(content).and_then(|_| file.sync_all());
  if let Err(e) = written {
    drop(file);
    let _ = fs::remove_file(path);
    return Err(new_io_error(path, e));
  }
  Ok(())
}

/// Archives the working store into `output_dir`
#[derive(Debug, Clone)]
pub struct Archiver {
  store: WorkingStore,
  output_dir: PathBuf,
  renderer: Renderer,
  offset: UtcOffset,
}

impl Archiver {
  /// Archive `store` into `output_dir`, labelling files in UTC unless `with_offset` is used
  pub fn new(store: WorkingStore, output_dir: impl Into<PathBuf>, renderer: Renderer) -> Self {
    Self {
      store,
      output_dir: output_dir.into(),
      renderer,
      offset: UtcOffset::UTC,
    }
  }

  /// Offset used for the timestamp label
  pub fn with_offset(mut self, offset: UtcOffset) -> Self {
    self.offset = offset;
    self
  }

  /// Archive with the current time
  pub fn archive(&self) -> Result<ArchiveOutcome> {
    self.archive_at(OffsetDateTime::now_utc().to_offset(self.offset))
  }

  /// Archive with an explicit timestamp.
  ///
  /// The store is deleted only after both files are fully written; any failure leaves it
  /// in place for a retry.
  pub fn archive_at(&self, at: OffsetDateTime) -> Result<ArchiveOutcome> {
    let questions = self.store.load()?;
    if questions.is_empty() {
      return Ok(ArchiveOutcome::NothingToArchive);
    }
    let captured = questions.len();
    let questions = dedup(questions);

    let label = timestamp_label(at)?;
    fs::create_dir_all(&self.output_dir).map_err(|e| new_io_error(&self.output_dir, e))?;
    let text_path = self.output_dir.join(format!("{}.txt", label));
    let json_path = self.output_dir.join(format!("{}.json", label));

    let text = self.renderer.render(&questions);
    let json = to_json_pretty(&questions)?;
    write_new(&text_path, text.as_bytes())?;
    if let Err(e) = write_new(&json_path, &json) {
      let _ = fs::remove_file(&text_path);
      return Err(e);
    }

    self.store.remove()?;
    tracing::info!(
      "archived {} question(s) ({} captured) to {}",
      questions.len(),
      captured,
      self.output_dir.display()
    );
    Ok(ArchiveOutcome::Archived {
      text_path,
      json_path,
      questions: questions.len(),
    })
  }
}
