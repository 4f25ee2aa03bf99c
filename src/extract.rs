//! Recover the question payload embedded in the quiz page markup
//!
//! The page renders a custom element whose attributes carry two serialized JSON values: the
//! questions array and a map of type name to type code.
use crate::config::MarkupConfig;
use crate::errors::{Error, Result};
use crate::normalize::TypeMap;
use scraper::{Html, Selector};
use serde_json::{Map, Value};

/// Payload as found in the page, before type normalization
#[derive(Debug, Clone)]
pub struct RawCapture {
  /// Question objects exactly as serialized by the page
  pub questions: Vec<Value>,
  /// Inverted type map, code -> name
  pub types: TypeMap,
}

/// Parse `html` and pull the questions and type map out of the carrier element.
///
/// Only the first matching element is read.
pub fn extract(html: &str, markup: &MarkupConfig) -> Result<RawCapture> {
  let selector = Selector::parse(&markup.element)
    .map_err(|e| Error::Other(format!("invalid element name {}: {}", markup.element, e)))?;
  let document = Html::parse_document(html);
  let element = document
    .select(&selector)
    .next()
    .ok_or_else(|| Error::MissingElement(markup.element.clone()))?;

  // The HTML parser lowercases attribute names.
  let attribute = |name: &str| {
    element
      .value()
      .attr(&name.to_ascii_lowercase())
      .ok_or_else(|| Error::MissingAttribute {
        element: markup.element.clone(),
        attribute: name.to_string(),
      })
  };
  let questions_json = attribute(&markup.questions_attr)?;
  let types_json = attribute(&markup.types_attr)?;

  let questions: Vec<Value> = serde_json::from_str(questions_json)?;
  let names: Map<String, Value> = serde_json::from_str(types_json)?;
  Ok(RawCapture {
    questions,
    types: TypeMap::from_names(names)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Ident;

  fn page(attrs: &str) -> String {
    format!(
      "<!DOCTYPE html><html><head><title>t</title></head><body><div id=\"app\">\
       <questions {}></questions></div></body></html>",
      attrs
    )
  }

  #[test]
  fn reads_entity_encoded_attributes() {
    let html = page(
      "v-bind:questions=\"[{&quot;text&quot;:&quot;Q1&quot;,&quot;type&quot;:3,&quot;answers&quot;:[]}]\" \
       v-bind:question-types='{\"App\\\\Question\\\\SINGLE\":3,\"App\\\\Question\\\\MATCHING\":5}'",
    );
    let raw = extract(&html, &MarkupConfig::default()).unwrap();
    assert_eq!(raw.questions.len(), 1);
    assert_eq!(raw.questions[0]["text"], "Q1");
    assert_eq!(raw.types.get(&Ident::Number(3)), Some("App\\Question\\SINGLE"));
    assert_eq!(raw.types.get(&Ident::Number(5)), Some("App\\Question\\MATCHING"));
  }

  #[test]
  fn missing_element() {
    let html = "<html><body><p>nothing here</p></body></html>";
    assert!(matches!(
      extract(html, &MarkupConfig::default()),
      Err(Error::MissingElement(name)) if name == "questions"
    ));
  }

  #[test]
  fn missing_attribute() {
    let html = page("v-bind:questions=\"[]\"");
    assert!(matches!(
      extract(&html, &MarkupConfig::default()),
      Err(Error::MissingAttribute { attribute, .. }) if attribute == "v-bind:question-types"
    ));
  }

  #[test]
  fn malformed_json() {
    let html = page("v-bind:questions=\"[{\" v-bind:question-types=\"{}\"");
    assert!(matches!(
      extract(&html, &MarkupConfig::default()),
      Err(Error::Json(_))
    ));
  }
}
