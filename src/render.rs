//! Line-oriented text report
//!
//! Each question becomes a block:
//!
//! ```text
//! <type> <text>
//! QUESTION IMAGE 1: <question image url>
//! <answer> (<answer image url>)
//! ----------                      (MATCHING only)
//! <draggable answer>              (MATCHING only)
//!
//! ```
use crate::config::RenderConfig;
use crate::model::{Answer, Ident, Question};

/// Turns questions into the study report
#[derive(Debug, Clone, Default)]
pub struct Renderer {
  config: RenderConfig,
}

impl Renderer {
  /// Renderer using the image hosts in `config`
  pub fn new(config: RenderConfig) -> Self {
    Self { config }
  }

  fn answer_line(&self, answer: &Answer) -> String {
    if answer.images.is_empty() {
      return answer.answer.clone();
    }
    format!(
      "{} ({}{})",
      answer.answer,
      self.config.answer_image_base_url,
      join(&answer.images)
    )
  }

  /// Render every question in order. The lines are joined with `\n`.
  ///
  /// A MATCHING question without its draggable side is skipped with a warning; the rest
  /// of the report is unaffected.
  pub fn render(&self, questions: &[Question]) -> String {
    let mut lines: Vec<String> = Vec::new();
    for question in questions {
      let draggable = match (question.is_matching(), &question.answers_draggable) {
        (true, None) => {
          tracing::warn!(
            "skipping MATCHING question without answers_draggable: {:?}",
            question.text
          );
          continue;
        }
        (true, Some(draggable)) => Some(draggable),
        (false, _) => None,
      };

      lines.push(format!("{} {}", question.kind, question.text));
      for (n, image) in question.images.iter().enumerate() {
        lines.push(format!(
          "QUESTION IMAGE {}: {}{}",
          n + 1,
          self.config.question_image_base_url,
          image
        ));
      }

      lines.extend(question.answers.iter().map(|a| self.answer_line(a)));
      if let Some(draggable) = draggable {
        let width = longest(&question.answers).max(longest(draggable));
        lines.push("-".repeat(width));
        lines.extend(draggable.iter().map(|a| self.answer_line(a)));
      }
      lines.push(String::new());
    }
    lines.join("\n")
  }
}

fn join(ids: &[Ident]) -> String {
  ids.iter().map(Ident::to_string).collect::<Vec<_>>().join(", ")
}

/// Longest answer text in characters
fn longest(answers: &[Answer]) -> usize {
  answers
    .iter()
    .map(|a| a.answer.chars().count())
    .max()
    .unwrap_or(0)
}
