//! Durable working store and the write-through capture accumulator
use crate::errors::{new_io_error, Result};
use crate::model::Question;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const UTF8_BOM: &str = "\u{feff}";

/// Pretty JSON with 4-space indentation; non-ASCII text is written as raw UTF-8.
pub(crate) fn to_json_pretty<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
  let mut buf = Vec::new();
  let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
  let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
  value.serialize(&mut serializer)?;
  Ok(buf)
}

/// The JSON file holding every capture not yet archived
#[derive(Debug, Clone)]
pub struct WorkingStore {
  path: PathBuf,
}

impl WorkingStore {
  /// Store backed by `path`; nothing is touched until the first load or save
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  /// Location of the store file
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Read the stored questions. A missing file is an empty store.
  pub fn load(&self) -> Result<Vec<Question>> {
    let content = match fs::read_to_string(&self.path) {
      Ok(content) => content,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(new_io_error(&self.path, e)),
    };
    let content = content.strip_prefix(UTF8_BOM).unwrap_or(&content);
    if content.trim().is_empty() {
      return Ok(Vec::new());
    }
    Ok(serde_json::from_str(content)?)
  }

  /// Replace the whole store with `questions`.
  ///
  /// The new content goes to a sibling temp file that is renamed over the store, so readers
  /// never observe a half written file.
  pub fn save(&self, questions: &[Question]) -> Result<()> {
    let json = to_json_pretty(questions)?;
    if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
      fs::create_dir_all(parent).map_err(|e| new_io_error(parent, e))?;
    }
    let tmp = self.tmp_path();
    let write = || -> std::io::Result<()> {
      let mut file = fs::File::create(&tmp)?;
      file.write_all(&json)?;
      file.sync_all()?;
      fs::rename(&tmp, &self.path)
    };
    write().map_err(|e| {
      let _ = fs::remove_file(&tmp);
      new_io_error(&self.path, e)
    })
  }

  /// Delete the store. Already gone is fine.
  pub fn remove(&self) -> Result<()> {
    match fs::remove_file(&self.path) {
      Err(e) if e.kind() != ErrorKind::NotFound => Err(new_io_error(&self.path, e)),
      _ => Ok(()),
    }
  }

  fn tmp_path(&self) -> PathBuf {
    let mut name = self
      .path
      .file_name()
      .map(|n| n.to_os_string())
      .unwrap_or_default();
    name.push(".tmp");
    self.path.with_file_name(name)
  }
}

/// Questions captured so far, mirrored to the working store after every capture
#[derive(Debug)]
pub struct CaptureAccumulator {
  store: WorkingStore,
  questions: Vec<Question>,
}

impl CaptureAccumulator {
  /// Open the accumulator on `store`, picking up what earlier sessions left unarchived.
  pub fn open(store: WorkingStore) -> Result<Self> {
    let questions = store.load()?;
    if !questions.is_empty() {
      tracing::info!(
        "resuming with {} unarchived question(s) from {}",
        questions.len(),
        store.path().display()
      );
    }
    Ok(Self { store, questions })
  }

  /// Append `questions` and rewrite the store with the full list. Returns the new total.
  ///
  /// On a failed write the in-memory list is rolled back so memory and disk stay equal.
  pub fn record(&mut self, questions: Vec<Question>) -> Result<usize> {
    let before = self.questions.len();
    self.questions.extend(questions);
    if let Err(e) = self.store.save(&self.questions) {
      self.questions.truncate(before);
      return Err(e);
    }
    Ok(self.questions.len())
  }

  /// Everything recorded so far, oldest first
  pub fn questions(&self) -> &[Question] {
    &self.questions
  }

  /// Number of recorded questions
  pub fn len(&self) -> usize {
    self.questions.len()
  }

  /// Whether nothing has been recorded
  pub fn is_empty(&self) -> bool {
    self.questions.is_empty()
  }

  /// The backing store
  pub fn store(&self) -> &WorkingStore {
    &self.store
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Answer, Ident};
  use serde_json::Map;

  fn question(text: &str) -> Question {
    Question {
      text: text.to_string(),
      kind: "SINGLE".to_string(),
      images: vec![],
      answers: vec![Answer {
        uid: Ident::Number(1),
        answer: "Ответ".to_string(),
        images: vec![],
        extra: Map::new(),
      }],
      answers_draggable: None,
      extra: Map::new(),
    }
  }

  #[test]
  fn missing_and_bom_prefixed_stores_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = WorkingStore::new(dir.path().join("intercepted_data.json"));
    assert!(store.load().unwrap().is_empty());

    let json = String::from_utf8(to_json_pretty(&[question("Вопрос")]).unwrap()).unwrap();
    std::fs::write(store.path(), format!("{}{}", UTF8_BOM, json)).unwrap();
    assert_eq!(store.load().unwrap(), vec![question("Вопрос")]);
  }

  #[test]
  fn record_rewrites_full_list_with_raw_utf8() {
    let dir = tempfile::tempdir().unwrap();
    let store = WorkingStore::new(dir.path().join("intercepted_data.json"));
    let mut acc = CaptureAccumulator::open(store.clone()).unwrap();

    assert_eq!(acc.record(vec![question("Первый")]).unwrap(), 1);
    assert_eq!(acc.record(vec![question("Второй")]).unwrap(), 2);

    let on_disk = std::fs::read_to_string(store.path()).unwrap();
    assert!(on_disk.contains("\"text\": \"Первый\""));
    assert!(on_disk.contains("\n    {\n        \"text\""));
    assert_eq!(store.load().unwrap(), acc.questions());
    assert!(!dir.path().join("intercepted_data.json.tmp").exists());
  }

  #[test]
  fn reopening_appends_to_previous_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = WorkingStore::new(dir.path().join("store.json"));
    CaptureAccumulator::open(store.clone())
      .unwrap()
      .record(vec![question("Q1")])
      .unwrap();

    let mut second = CaptureAccumulator::open(store.clone()).unwrap();
    assert_eq!(second.len(), 1);
    second.record(vec![question("Q1")]).unwrap();
    assert_eq!(store.load().unwrap().len(), 2);
  }

  #[test]
  fn remove_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = WorkingStore::new(dir.path().join("store.json"));
    store.save(&[]).unwrap();
    store.remove().unwrap();
    assert!(!store.path().exists());
    store.remove().unwrap();
  }
}
