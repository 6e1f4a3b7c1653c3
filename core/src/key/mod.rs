//! Ordered byte-key encoding.
//!
//! Index entries and sort keys are byte strings whose lexicographic order
//! matches the canonical document value ordering: null < false < true <
//! numbers < strings < arrays < objects. String parts go through the
//! locale collator when the index asks for it.
//!
//! An index entry is laid out as
//! `[index-id BE | part-1 | 0x00 | ... | part-N | 0x00 | _id]`.
//! Part bytes are escaped so they never contain `0x00`, which keeps the
//! separators unambiguous and lets the id be recovered from the tail.

pub mod collate;

pub use self::collate::Collation;
pub use self::collate::Collator;

use crate::err::Error;
use crate::err::Result;
use serde_json::Value;

const KT_NULL: u8 = 0x01;
const KT_FALSE: u8 = 0x02;
const KT_TRUE: u8 = 0x03;
const KT_NUMBER: u8 = 0x04;
const KT_STRING: u8 = 0x05;
const KT_ARRAY: u8 = 0x06;
const KT_OBJECT: u8 = 0x07;

/// Encode a single document value as an order-preserving byte part.
pub fn encode_val(val: &Value, collator: Option<&Collator>) -> Vec<u8> {
	let mut out = Vec::with_capacity(16);
	write_val(&mut out, val, collator);
	out
}

fn write_val(out: &mut Vec<u8>, val: &Value, collator: Option<&Collator>) {
	match val {
		Value::Null => out.push(KT_NULL),
		Value::Bool(false) => out.push(KT_FALSE),
		Value::Bool(true) => out.push(KT_TRUE),
		Value::Number(n) => {
			out.push(KT_NUMBER);
			let f = n.as_f64().unwrap_or(0.0);
			out.extend_from_slice(&sortable_f64(f));
		}
		Value::String(s) => {
			out.push(KT_STRING);
			match collator {
				Some(c) => out.extend_from_slice(&c.sort_key(s)),
				None => out.extend_from_slice(s.as_bytes()),
			}
			// strings terminate so a prefix sorts before its extensions
			out.push(0x00);
		}
		Value::Array(items) => {
			out.push(KT_ARRAY);
			for item in items {
				write_val(out, item, collator);
			}
			out.push(0x00);
		}
		Value::Object(map) => {
			out.push(KT_OBJECT);
			let mut entries: Vec<_> = map.iter().collect();
			entries.sort_by(|a, b| a.0.cmp(b.0));
			for (name, val) in entries {
				out.extend_from_slice(name.as_bytes());
				out.push(0x00);
				write_val(out, val, collator);
			}
			out.push(0x00);
		}
	}
}

/// Encode the open-ended form of a string for prefix scans: the tag and
/// payload bytes, but no terminator, so every extension shares it as a
/// byte prefix.
pub fn encode_string_prefix(s: &str, collator: Option<&Collator>) -> Vec<u8> {
	let mut out = vec![KT_STRING];
	match collator {
		Some(c) => out.extend_from_slice(&c.sort_key(s)),
		None => out.extend_from_slice(s.as_bytes()),
	}
	out
}

/// Map an f64 onto bytes whose unsigned order matches numeric order.
fn sortable_f64(f: f64) -> [u8; 8] {
	let bits = f.to_bits();
	let bits = if bits & (1 << 63) != 0 {
		!bits
	} else {
		bits | (1 << 63)
	};
	bits.to_be_bytes()
}

/// Escape part bytes so the escaped form contains no 0x00 and preserves
/// lexicographic order: 0x00 -> 0x01 0x01, 0x01 -> 0x01 0x02.
pub fn escape_part(part: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(part.len() + 2);
	for &b in part {
		match b {
			0x00 => out.extend_from_slice(&[0x01, 0x01]),
			0x01 => out.extend_from_slice(&[0x01, 0x02]),
			_ => out.push(b),
		}
	}
	out
}

/// Compose a full index entry key from escaped parts and the record id.
pub fn index_entry(index_id: u32, parts: &[Vec<u8>], id: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(4 + parts.iter().map(|p| p.len() + 3).sum::<usize>() + id.len());
	out.extend_from_slice(&index_id.to_be_bytes());
	for part in parts {
		out.extend_from_slice(&escape_part(part));
		out.push(0x00);
	}
	out.extend_from_slice(id);
	out
}

/// The common prefix of every entry in one index.
pub fn index_prefix(index_id: u32) -> Vec<u8> {
	index_id.to_be_bytes().to_vec()
}

/// Recover the record id from an entry key, given the index prop count.
pub fn entry_id(entry: &[u8], prop_count: usize) -> Result<&[u8]> {
	let mut pos = 4usize;
	let mut seen = 0usize;
	while seen < prop_count {
		match entry[pos..].iter().position(|&b| b == 0x00) {
			Some(i) => {
				pos += i + 1;
				seen += 1;
			}
			None => return Err(Error::InconsistentIndex("truncated index entry".into())),
		}
	}
	entry.get(pos..).ok_or_else(|| Error::InconsistentIndex("truncated index entry".into()))
}

/// The smallest key strictly greater than every key with this prefix.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
	let mut out = prefix.to_vec();
	while let Some(last) = out.last_mut() {
		if *last < 0xff {
			*last += 1;
			return Some(out);
		}
		out.pop();
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn enc(v: &Value) -> Vec<u8> {
		encode_val(v, None)
	}

	#[test]
	fn encoded_order_matches_canonical_order() {
		let vals = [
			json!(null),
			json!(false),
			json!(true),
			json!(-10.5),
			json!(-3),
			json!(0),
			json!(2.5),
			json!(310),
			json!(400),
			json!(500),
			json!(""),
			json!("a"),
			json!("aa"),
			json!("b"),
			json!([1]),
			json!([1, 2]),
			json!({"x": 1}),
		];
		for pair in vals.windows(2) {
			assert!(
				enc(&pair[0]) < enc(&pair[1]),
				"expected {:?} < {:?}",
				pair[0],
				pair[1]
			);
		}
	}

	#[test]
	fn escaping_preserves_order_and_strips_zero() {
		let parts = [vec![0x00u8], vec![0x00, 0x01], vec![0x01], vec![0x02], vec![0x02, 0x00]];
		for pair in parts.windows(2) {
			let a = escape_part(&pair[0]);
			let b = escape_part(&pair[1]);
			assert!(a < b);
			assert!(!a.contains(&0x00));
		}
	}

	#[test]
	fn entry_id_recovery() {
		let parts = vec![enc(&json!("HR")), enc(&json!(40))];
		let entry = index_entry(9, &parts, b"00000000deadbeef");
		assert_eq!(entry_id(&entry, 2).unwrap(), b"00000000deadbeef");
		assert!(entry.starts_with(&9u32.to_be_bytes()));
	}

	#[test]
	fn prefix_successor_rolls_over() {
		assert_eq!(prefix_successor(b"ab").unwrap(), b"ac".to_vec());
		assert_eq!(prefix_successor(&[0x01, 0xff]).unwrap(), vec![0x02]);
		assert!(prefix_successor(&[0xff, 0xff]).is_none());
	}
}
