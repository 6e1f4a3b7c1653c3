//! Property extractors: turn a document into the multiset of key parts
//! one index property contributes.

use crate::key;
use crate::key::Collator;
use crate::obj;
use serde_json::Value;
use std::collections::BTreeSet;

/// How string values are split before keying.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Tokenize {
	#[default]
	None,
	/// One key per token.
	All,
	/// One key per unicode word.
	Words,
}

/// Extracts the ordered key parts for one index property.
#[derive(Debug, Clone)]
pub struct PropExtractor {
	path: String,
	collator: Option<Collator>,
	tokenize: Tokenize,
	default: Option<Value>,
}

impl PropExtractor {
	pub fn new(path: &str, collator: Option<Collator>, tokenize: Tokenize, default: Option<Value>) -> Self {
		PropExtractor {
			path: path.to_string(),
			collator,
			tokenize,
			default,
		}
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn collator(&self) -> Option<&Collator> {
		self.collator.as_ref()
	}

	/// Encode one value the way this property keys it.
	pub fn encode(&self, val: &Value) -> Vec<u8> {
		key::encode_val(val, self.collator.as_ref())
	}

	/// All key parts this document contributes for the property.
	///
	/// Arrays fan out to one part per element; absent values fall back
	/// to the declared default or contribute nothing at all.
	pub fn parts(&self, doc: &Value) -> BTreeSet<Vec<u8>> {
		let mut out = BTreeSet::new();
		let vals = obj::path_vals(doc, &self.path);
		if vals.is_empty() {
			if let Some(default) = &self.default {
				out.insert(self.encode(default));
			}
			return out;
		}
		for val in vals {
			match val {
				Value::Array(items) => {
					for item in items {
						self.push(&mut out, item);
					}
					if items.is_empty() {
						if let Some(default) = &self.default {
							out.insert(self.encode(default));
						}
					}
				}
				other => self.push(&mut out, other),
			}
		}
		out
	}

	fn push(&self, out: &mut BTreeSet<Vec<u8>>, val: &Value) {
		match (val, self.tokenize) {
			(Value::String(s), Tokenize::All) => {
				for token in tokenize_all(s) {
					out.insert(self.encode(&Value::String(token)));
				}
			}
			(Value::String(s), Tokenize::Words) => {
				for word in tokenize_words(s) {
					out.insert(self.encode(&Value::String(word)));
				}
			}
			_ => {
				out.insert(self.encode(val));
			}
		}
	}
}

/// Split on every non-alphanumeric boundary.
pub fn tokenize_all(text: &str) -> Vec<String> {
	text.split(|c: char| !c.is_alphanumeric())
		.filter(|t| !t.is_empty())
		.map(|t| t.to_lowercase())
		.collect()
}

/// Split on unicode whitespace, trimming edge punctuation.
pub fn tokenize_words(text: &str) -> Vec<String> {
	text.split_whitespace()
		.map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
		.filter(|w| !w.is_empty())
		.map(|w| w.to_string())
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn scalar_and_array_parts() {
		let ex = PropExtractor::new("tags", None, Tokenize::None, None);
		let doc = json!({"tags": ["b", "a", "b"]});
		assert_eq!(ex.parts(&doc).len(), 2);
		let doc = json!({"tags": "solo"});
		assert_eq!(ex.parts(&doc).len(), 1);
	}

	#[test]
	fn missing_prop_uses_default() {
		let ex = PropExtractor::new("sync", None, Tokenize::None, Some(json!(false)));
		let parts = ex.parts(&json!({"other": 1}));
		assert_eq!(parts.len(), 1);
		assert_eq!(parts.into_iter().next().unwrap(), ex.encode(&json!(false)));
		// and nothing at all without a default
		let ex = PropExtractor::new("sync", None, Tokenize::None, None);
		assert!(ex.parts(&json!({"other": 1})).is_empty());
	}

	#[test]
	fn tokenizers_split() {
		assert_eq!(tokenize_all("Hello, cruel-world"), vec!["hello", "cruel", "world"]);
		assert_eq!(tokenize_words("Hello, cruel-world!"), vec!["Hello", "cruel-world"]);
	}
}
