//! Per-kind property name tokens.
//!
//! Every property name a kind has ever stored gets a small integer
//! token, used to compress stored documents. Assignments are append-only
//! and never reused, so any record ever written stays decodable.

use crate::err::Error;
use crate::err::Result;
use serde_json::json;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct TokenSet {
	toks: BTreeMap<String, u32>,
	names: Vec<String>,
	dirty: bool,
}

impl TokenSet {
	/// The token for a name, assigning the next one if new.
	pub fn intern(&mut self, name: &str) -> u32 {
		if let Some(&tok) = self.toks.get(name) {
			return tok;
		}
		let tok = self.names.len() as u32;
		self.names.push(name.to_string());
		self.toks.insert(name.to_string(), tok);
		self.dirty = true;
		tok
	}

	/// The token for a name, if it was ever assigned.
	pub fn get(&self, name: &str) -> Option<u32> {
		self.toks.get(name).copied()
	}

	/// The name behind a token.
	pub fn name(&self, tok: u32) -> Option<&str> {
		self.names.get(tok as usize).map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.names.len()
	}

	pub fn is_empty(&self) -> bool {
		self.names.is_empty()
	}

	/// Whether tokens were assigned since the last store.
	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	pub fn mark_clean(&mut self) {
		self.dirty = false;
	}

	/// The persistent form: names in token order.
	pub fn to_stored(&self) -> Value {
		json!({ "names": self.names })
	}

	/// Rebuild from the persistent form.
	pub fn from_stored(val: &Value) -> Result<TokenSet> {
		let names = val
			.get("names")
			.and_then(Value::as_array)
			.ok_or_else(|| Error::InvalidSchema("token set missing 'names'".into()))?;
		let mut set = TokenSet::default();
		for name in names {
			let name = name
				.as_str()
				.ok_or_else(|| Error::InvalidSchema("token name must be a string".into()))?;
			set.intern(name);
		}
		set.dirty = false;
		Ok(set)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tokens_are_monotone_and_stable() {
		let mut set = TokenSet::default();
		let a = set.intern("alpha");
		let b = set.intern("beta");
		assert_eq!(set.intern("alpha"), a);
		assert!(b > a);
		assert_eq!(set.name(a), Some("alpha"));
		// a reload reconstructs the same assignments
		let reloaded = TokenSet::from_stored(&set.to_stored()).unwrap();
		assert_eq!(reloaded.get("alpha"), Some(a));
		assert_eq!(reloaded.get("beta"), Some(b));
		assert!(!reloaded.is_dirty());
	}
}
