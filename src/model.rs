//! Question and answer records as captured from the quiz page
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Category name the renderer treats specially
pub const MATCHING: &str = "MATCHING";

/// Identifier delivered by the source: either a JSON integer or a JSON string.
///
/// Integers order before strings so that mixed uid lists still sort deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ident {
  /// JSON integer
  Number(i64),
  /// JSON string
  Text(String),
}

impl fmt::Display for Ident {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Ident::Number(n) => write!(f, "{}", n),
      Ident::Text(s) => f.write_str(s),
    }
  }
}

impl From<i64> for Ident {
  fn from(value: i64) -> Self {
    Ident::Number(value)
  }
}

impl From<&str> for Ident {
  fn from(value: &str) -> Self {
    Ident::Text(value.to_string())
  }
}

/// One option of a question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
  /// Identity of the answer within its question
  pub uid: Ident,
  /// Display text
  pub answer: String,
  /// Image ids, relative to the answer image host
  #[serde(default, deserialize_with = "null_as_empty")]
  pub images: Vec<Ident>,
  /// Source fields we do not interpret, kept for the JSON archive
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// One captured quiz item with its normalized category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
  /// Question text
  pub text: String,
  /// Category label, e.g. `SINGLE`
  #[serde(rename = "type")]
  pub kind: String,
  /// Image ids, relative to the question image host
  #[serde(default, deserialize_with = "null_as_empty")]
  pub images: Vec<Ident>,
  /// Answer options in page order
  pub answers: Vec<Answer>,
  /// The draggable side of a MATCHING pair
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub answers_draggable: Option<Vec<Answer>>,
  /// Source fields we do not interpret, kept for the JSON archive
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// `"images": null` means no images
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Ident>, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(Option::<Vec<Ident>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Question {
  /// Whether the category is MATCHING
  pub fn is_matching(&self) -> bool {
    self.kind == MATCHING
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn keeps_unknown_fields_and_uid_kinds() {
    let raw = json!({
      "text": "Столица?",
      "type": "SINGLE",
      "images": [],
      "answers": [
        {"uid": 7, "answer": "Москва", "images": ["a.png"], "right": true},
        {"uid": "x9", "answer": "Тверь"}
      ],
      "id": 42
    });
    let question: Question = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(question.answers[0].uid, Ident::Number(7));
    assert_eq!(question.answers[1].uid, Ident::from("x9"));
    assert!(question.answers[1].images.is_empty());
    assert_eq!(question.extra["id"], json!(42));
    assert!(question.answers_draggable.is_none());

    let back = serde_json::to_value(&question).unwrap();
    assert_eq!(back["answers"][0]["right"], json!(true));
    assert_eq!(back["answers"][1]["uid"], json!("x9"));
    assert!(back.get("answers_draggable").is_none());
  }

  #[test]
  fn null_images_are_empty() {
    let raw = json!({
      "text": "Q1",
      "type": "SINGLE",
      "images": null,
      "answers": [{"uid": 1, "answer": "A", "images": null}]
    });
    let question: Question = serde_json::from_value(raw).unwrap();
    assert!(question.images.is_empty());
    assert!(question.answers[0].images.is_empty());
    assert!(question.extra.is_empty());
  }

  #[test]
  fn numbers_sort_before_text() {
    let mut ids = vec![Ident::from("a"), Ident::Number(10), Ident::Number(2)];
    ids.sort();
    assert_eq!(ids, vec![Ident::Number(2), Ident::Number(10), Ident::from("a")]);
  }
}
