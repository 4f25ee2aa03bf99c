//! Type code normalization
//!
//! The page delivers question types as codes together with a per-session map of names to
//! codes. Names carry a constant namespace prefix that is stripped to get compact labels such
//! as `SINGLE` or `MATCHING`.
use crate::errors::{Error, Result};
use crate::model::{Ident, Question};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Type code -> full type name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeMap(HashMap<Ident, String>);

impl TypeMap {
  /// Invert the page's name -> code object.
  pub fn from_names(names: Map<String, Value>) -> Result<Self> {
    let mut codes = HashMap::with_capacity(names.len());
    for (name, code) in names {
      let code: Ident = serde_json::from_value(code.clone())
        .map_err(|_| Error::TypeMap(format!("code {} of `{}` is not an integer or string", code, name)))?;
      codes.insert(code, name);
    }
    Ok(Self(codes))
  }

  /// Full type name for `code`
  pub fn get(&self, code: &Ident) -> Option<&str> {
    self.0.get(code).map(String::as_str)
  }

  /// Number of known codes
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Whether the page sent no types
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

/// Outcome of normalizing one capture
#[derive(Debug, Default)]
pub struct Normalized {
  /// Questions that passed, in page order
  pub accepted: Vec<Question>,
  /// Index in the page payload and the reason each rejected question was dropped
  pub rejected: Vec<(usize, Error)>,
}

/// Map a full type name to its category label by dropping `prefix_len` characters.
pub fn category(name: &str, prefix_len: usize) -> Result<String> {
  let label: String = name.chars().skip(prefix_len).collect();
  if label.is_empty() {
    return Err(Error::TypeNameTooShort {
      name: name.to_string(),
      prefix_len,
    });
  }
  Ok(label)
}

fn normalize_one(mut raw: Value, types: &TypeMap, prefix_len: usize) -> Result<Question> {
  let object = raw
    .as_object_mut()
    .ok_or_else(|| Error::Schema("question is not an object".to_string()))?;
  let code = object
    .get("type")
    .cloned()
    .ok_or_else(|| Error::Schema("question has no `type`".to_string()))?;
  let code: Ident =
    serde_json::from_value(code.clone()).map_err(|_| Error::UnknownTypeCode(code.to_string()))?;
  let name = types
    .get(&code)
    .ok_or_else(|| Error::UnknownTypeCode(code.to_string()))?;
  object.insert("type".to_string(), Value::String(category(name, prefix_len)?));
  serde_json::from_value(raw).map_err(|e| Error::Schema(e.to_string()))
}

/// Replace every question's type code with its category label.
///
/// A question that cannot be labelled is rejected rather than given a guessed category.
pub fn normalize(raw: Vec<Value>, types: &TypeMap, prefix_len: usize) -> Normalized {
  let mut normalized = Normalized::default();
  for (index, question) in raw.into_iter().enumerate() {
    match normalize_one(question, types, prefix_len) {
      Ok(question) => normalized.accepted.push(question),
      Err(e) => {
        tracing::warn!("dropping question #{} of capture: {}", index, e);
        normalized.rejected.push((index, e));
      }
    }
  }
  normalized
}
