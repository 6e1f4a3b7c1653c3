//! Locale-aware collation sort keys.
//!
//! Index keys need byte-ordered sort keys, so the collator builds them
//! directly: a primary level from the transliterated, case-folded text,
//! a secondary level of accent weights (compared back-to-front for
//! French locales), a tertiary case level, and the identical level as
//! the raw text. Levels are emitted up to the configured strength.

use deunicode::deunicode;
use serde::Deserialize;
use serde::Serialize;
use std::cmp::Ordering;

/// Per-property collation strength, `default` meaning plain binary order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collation {
	#[default]
	Default,
	Primary,
	Secondary,
	Tertiary,
	Quaternary,
	Identical,
}

impl Collation {
	fn levels(self) -> u8 {
		match self {
			Collation::Default => 0,
			Collation::Primary => 1,
			Collation::Secondary => 2,
			Collation::Tertiary => 3,
			// quaternary only differs once we collate punctuation
			Collation::Quaternary => 3,
			Collation::Identical => 4,
		}
	}
}

/// A configured collator for one locale and strength.
#[derive(Debug, Clone)]
pub struct Collator {
	locale: String,
	strength: Collation,
	backward_secondary: bool,
}

/// Separates collation levels inside a sort key. Kept below every
/// payload byte so a string that is a prefix of another sorts first.
const LEVEL_SEP: u8 = 0x01;

/// Weight bytes are offset past the separator.
const WEIGHT_BASE: u8 = 0x02;

impl Collator {
	pub fn new(locale: &str, strength: Collation) -> Self {
		Collator {
			locale: locale.to_string(),
			strength,
			// French sorts accents from the end of the word
			backward_secondary: locale.starts_with("fr"),
		}
	}

	pub fn locale(&self) -> &str {
		&self.locale
	}

	pub fn strength(&self) -> Collation {
		self.strength
	}

	/// Produce the byte sort key for a string.
	pub fn sort_key(&self, text: &str) -> Vec<u8> {
		let levels = self.strength.levels();
		if levels == 0 {
			return text.as_bytes().to_vec();
		}
		let mut out = Vec::with_capacity(text.len() * 2 + 8);
		// primary: transliterated, case-folded text
		for ch in text.chars() {
			let folded: String = ch.to_lowercase().collect();
			out.extend(deunicode(&folded).bytes().map(|b| b.max(WEIGHT_BASE)));
		}
		if levels >= 2 {
			out.push(LEVEL_SEP);
			let mut weights: Vec<u8> = text.chars().map(accent_weight).collect();
			if self.backward_secondary {
				weights.reverse();
			}
			out.extend(weights.iter().map(|w| w + WEIGHT_BASE));
		}
		if levels >= 3 {
			out.push(LEVEL_SEP);
			out.extend(text.chars().map(|c| WEIGHT_BASE + u8::from(c.is_uppercase())));
		}
		if levels >= 4 {
			out.push(LEVEL_SEP);
			out.extend(text.as_bytes().iter().map(|b| b.max(&WEIGHT_BASE)));
		}
		out
	}

	/// Compare two strings under this collation.
	pub fn compare(&self, a: &str, b: &str) -> Ordering {
		self.sort_key(a).cmp(&self.sort_key(b))
	}
}

/// The secondary weight of a character: its diacritic class.
fn accent_weight(ch: char) -> u8 {
	let lower = ch.to_lowercase().next().unwrap_or(ch);
	match lower {
		'á' | 'é' | 'í' | 'ó' | 'ú' | 'ý' | 'ć' | 'ń' | 'ś' | 'ź' => 1,
		'à' | 'è' | 'ì' | 'ò' | 'ù' => 2,
		'â' | 'ê' | 'î' | 'ô' | 'û' | 'ŵ' | 'ŷ' => 3,
		'ä' | 'ë' | 'ï' | 'ö' | 'ü' | 'ÿ' => 4,
		'ã' | 'ñ' | 'õ' => 5,
		'å' | 'ů' => 6,
		'ç' | 'ş' | 'ţ' => 7,
		'č' | 'ď' | 'ě' | 'ľ' | 'ň' | 'ř' | 'š' | 'ť' | 'ž' => 8,
		_ => 0,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn english_accent_order() {
		let c = Collator::new("en_US", Collation::Secondary);
		let mut words = vec!["côté", "cote", "côte", "coté"];
		words.sort_by(|a, b| c.compare(a, b));
		assert_eq!(words, vec!["cote", "coté", "côte", "côté"]);
	}

	#[test]
	fn french_accent_order() {
		let c = Collator::new("fr_CA", Collation::Secondary);
		let mut words = vec!["côté", "cote", "côte", "coté"];
		words.sort_by(|a, b| c.compare(a, b));
		assert_eq!(words, vec!["cote", "côte", "coté", "côté"]);
	}

	#[test]
	fn primary_strength_ignores_case_and_accents() {
		let c = Collator::new("en_US", Collation::Primary);
		assert_eq!(c.compare("Résumé", "resume"), Ordering::Equal);
		assert_eq!(c.compare("apple", "Banana"), Ordering::Less);
	}

	#[test]
	fn tertiary_orders_lowercase_first() {
		let c = Collator::new("en_US", Collation::Tertiary);
		assert_eq!(c.compare("abc", "Abc"), Ordering::Less);
		assert_eq!(c.compare("abc", "abc"), Ordering::Equal);
	}

	#[test]
	fn prefix_sorts_before_extension() {
		let c = Collator::new("en_US", Collation::Tertiary);
		assert_eq!(c.compare("cot", "cote"), Ordering::Less);
	}
}
