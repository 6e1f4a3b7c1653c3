//! Helpers over JSON document values: reserved keys, dotted-path access,
//! the canonical value ordering used by keys and aggregates, recursive
//! merge, and field projection.

mod frame;

pub use self::frame::decode_record;
pub use self::frame::encode_record;
pub use self::frame::peek_header;
pub use self::frame::ObjectHeader;

use serde_json::Map;
use serde_json::Value;
use std::cmp::Ordering;

/// Reserved top-level keys.
pub const ID_KEY: &str = "_id";
pub const KIND_KEY: &str = "_kind";
pub const REV_KEY: &str = "_rev";
pub const DEL_KEY: &str = "_del";
pub const SYNC_KEY: &str = "_sync";
pub const IGNORE_ID_KEY: &str = "_ignoreId";

/// Returns the document id, if present.
pub fn id_of(obj: &Value) -> Option<&str> {
	obj.get(ID_KEY).and_then(Value::as_str)
}

/// Returns the document kind id, if present.
pub fn kind_of(obj: &Value) -> Option<&str> {
	obj.get(KIND_KEY).and_then(Value::as_str)
}

/// Returns the document revision, if present.
pub fn rev_of(obj: &Value) -> Option<i64> {
	obj.get(REV_KEY).and_then(Value::as_i64)
}

/// Whether this document is a tombstone.
pub fn is_tombstone(obj: &Value) -> bool {
	obj.get(DEL_KEY).and_then(Value::as_bool).unwrap_or(false)
}

/// Fetch all values reachable at a dotted path, descending into arrays.
///
/// With `{a: [{b: 1}, {b: 2}]}` the path `a.b` yields both `1` and `2`,
/// which is what index extraction and residual filtering both want.
pub fn path_vals<'a>(obj: &'a Value, path: &str) -> Vec<&'a Value> {
	let mut current = vec![obj];
	for part in path.split('.') {
		let mut next = Vec::new();
		for val in current {
			match val {
				Value::Object(map) => {
					if let Some(v) = map.get(part) {
						next.push(v);
					}
				}
				Value::Array(items) => {
					for item in items {
						if let Some(v) = item.get(part) {
							next.push(v);
						}
					}
				}
				_ => {}
			}
		}
		current = next;
		if current.is_empty() {
			break;
		}
	}
	current
}

/// Fetch the single value at a dotted path, ignoring array fan-out.
pub fn path_val<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
	let mut current = obj;
	for part in part_iter(path) {
		current = current.get(part)?;
	}
	Some(current)
}

fn part_iter(path: &str) -> impl Iterator<Item = &str> {
	path.split('.')
}

/// The canonical ordering over document values:
/// null < false < true < numbers < strings < arrays < objects.
pub fn cmp_vals(a: &Value, b: &Value) -> Ordering {
	fn rank(v: &Value) -> u8 {
		match v {
			Value::Null => 0,
			Value::Bool(false) => 1,
			Value::Bool(true) => 2,
			Value::Number(_) => 3,
			Value::String(_) => 4,
			Value::Array(_) => 5,
			Value::Object(_) => 6,
		}
	}
	match (a, b) {
		(Value::Number(x), Value::Number(y)) => {
			match (x.as_i64(), y.as_i64()) {
				(Some(i), Some(j)) => i.cmp(&j),
				_ => {
					let i = x.as_f64().unwrap_or(f64::NAN);
					let j = y.as_f64().unwrap_or(f64::NAN);
					i.partial_cmp(&j).unwrap_or(Ordering::Equal)
				}
			}
		}
		(Value::String(x), Value::String(y)) => x.cmp(y),
		(Value::Array(x), Value::Array(y)) => {
			for (i, j) in x.iter().zip(y.iter()) {
				let ord = cmp_vals(i, j);
				if ord != Ordering::Equal {
					return ord;
				}
			}
			x.len().cmp(&y.len())
		}
		(Value::Object(x), Value::Object(y)) => {
			let mut xs: Vec<_> = x.iter().collect();
			let mut ys: Vec<_> = y.iter().collect();
			xs.sort_by(|l, r| l.0.cmp(r.0));
			ys.sort_by(|l, r| l.0.cmp(r.0));
			for ((ka, va), (kb, vb)) in xs.iter().zip(ys.iter()) {
				let ord = ka.cmp(kb).then_with(|| cmp_vals(va, vb));
				if ord != Ordering::Equal {
					return ord;
				}
			}
			xs.len().cmp(&ys.len())
		}
		_ => rank(a).cmp(&rank(b)),
	}
}

/// Recursively merge `src` into `dest`.
///
/// Scalars overwrite, objects union by key, arrays are overwritten rather
/// than concatenated. `merge(x, {})` is a no-op.
pub fn merge_into(dest: &mut Value, src: &Value) {
	match (dest, src) {
		(Value::Object(d), Value::Object(s)) => {
			for (k, v) in s {
				match d.get_mut(k) {
					Some(existing) if existing.is_object() && v.is_object() => {
						merge_into(existing, v);
					}
					_ => {
						d.insert(k.clone(), v.clone());
					}
				}
			}
		}
		(dest, src) => {
			*dest = src.clone();
		}
	}
}

/// Project a document down to the selected dotted paths.
///
/// The id is always carried so callers can page and re-fetch.
pub fn project(obj: &Value, select: &[String]) -> Value {
	let mut out = Map::new();
	if let Some(id) = obj.get(ID_KEY) {
		out.insert(ID_KEY.to_string(), id.clone());
	}
	for path in select {
		if let Some(val) = path_val(obj, path) {
			insert_path(&mut out, path, val.clone());
		}
	}
	Value::Object(out)
}

fn insert_path(map: &mut Map<String, Value>, path: &str, val: Value) {
	match path.split_once('.') {
		None => {
			map.insert(path.to_string(), val);
		}
		Some((head, rest)) => {
			let entry = map.entry(head.to_string()).or_insert_with(|| Value::Object(Map::new()));
			if let Value::Object(inner) = entry {
				insert_path(inner, rest, val);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn path_vals_descends_arrays() {
		let doc = json!({"a": [{"b": 1}, {"b": 2}], "c": {"d": "x"}});
		let vals = path_vals(&doc, "a.b");
		assert_eq!(vals, vec![&json!(1), &json!(2)]);
		let vals = path_vals(&doc, "c.d");
		assert_eq!(vals, vec![&json!("x")]);
		assert!(path_vals(&doc, "c.missing").is_empty());
	}

	#[test]
	fn canonical_ordering() {
		let vals = [
			json!(null),
			json!(false),
			json!(true),
			json!(-3),
			json!(2.5),
			json!(7),
			json!("a"),
			json!("b"),
			json!([1, 2]),
			json!({"x": 1}),
		];
		for pair in vals.windows(2) {
			assert_eq!(cmp_vals(&pair[0], &pair[1]), Ordering::Less);
		}
	}

	#[test]
	fn merge_laws() {
		let x = json!({"a": 1, "nested": {"k": "v", "keep": true}, "arr": [1, 2]});
		let y = json!({"a": 2, "nested": {"k": "w"}, "arr": [9]});
		// merge(x, merge(x, y)) == merge(x, y)
		let mut once = x.clone();
		merge_into(&mut once, &y);
		let mut twice = x.clone();
		merge_into(&mut twice, &once);
		assert_eq!(once, twice);
		// arrays are overwritten, not concatenated
		assert_eq!(once["arr"], json!([9]));
		// objects union by key
		assert_eq!(once["nested"], json!({"k": "w", "keep": true}));
		// merge with the empty object is a no-op
		let mut noop = x.clone();
		merge_into(&mut noop, &json!({}));
		assert_eq!(noop, x);
	}

	#[test]
	fn projection_keeps_id() {
		let doc = json!({"_id": "abc", "a": {"b": 1}, "c": 2});
		let out = project(&doc, &["a.b".to_string()]);
		assert_eq!(out, json!({"_id": "abc", "a": {"b": 1}}));
	}
}
