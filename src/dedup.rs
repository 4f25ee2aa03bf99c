//! Collapse repeated captures of the same question
use crate::model::{Ident, Question};
use std::collections::HashSet;

/// Identity of a question: its text plus the sorted uids of its answers.
///
/// Answer order, images and any other field do not take part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuestionKey {
  /// Question text
  pub text: String,
  /// Answer uids, sorted
  pub uids: Vec<Ident>,
}

impl QuestionKey {
  /// Key of `question`
  pub fn of(question: &Question) -> Self {
    let mut uids: Vec<Ident> = question.answers.iter().map(|a| a.uid.clone()).collect();
    uids.sort();
    Self {
      text: question.text.clone(),
      uids,
    }
  }
}

/// Keep the first occurrence of every key, in original order.
pub fn dedup(questions: Vec<Question>) -> Vec<Question> {
  let mut seen = HashSet::with_capacity(questions.len());
  let total = questions.len();
  let unique: Vec<Question> = questions
    .into_iter()
    .filter(|q| seen.insert(QuestionKey::of(q)))
    .collect();
  tracing::debug!("dedup kept {} of {} question(s)", unique.len(), total);
  unique
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Answer;
  use serde_json::Map;

  fn question(text: &str, uids: &[i64]) -> Question {
    Question {
      text: text.to_string(),
      kind: "SINGLE".to_string(),
      images: vec![],
      answers: uids
        .iter()
        .map(|uid| Answer {
          uid: Ident::Number(*uid),
          answer: format!("a{}", uid),
          images: vec![],
          extra: Map::new(),
        })
        .collect(),
      answers_draggable: None,
      extra: Map::new(),
    }
  }

  #[test]
  fn answer_order_and_images_do_not_matter() {
    let mut reordered = question("Q", &[2, 1]);
    reordered.answers[0].images.push(Ident::from("x.png"));
    reordered.images.push(Ident::from("q.png"));
    let out = dedup(vec![question("Q", &[1, 2]), reordered]);
    assert_eq!(out, vec![question("Q", &[1, 2])]);
  }

  #[test]
  fn different_uids_or_text_are_distinct() {
    let input = vec![question("Q", &[1, 2]), question("Q", &[1, 3]), question("R", &[1, 2])];
    assert_eq!(dedup(input.clone()), input);
  }

  #[test]
  fn keeps_first_seen_order_and_is_idempotent() {
    let input = vec![
      question("B", &[1]),
      question("A", &[1]),
      question("B", &[1]),
      question("C", &[]),
      question("A", &[1]),
      question("C", &[]),
    ];
    let once = dedup(input);
    let texts: Vec<_> = once.iter().map(|q| q.text.as_str()).collect();
    assert_eq!(texts, vec!["B", "A", "C"]);
    assert_eq!(dedup(once.clone()), once);
  }
}
