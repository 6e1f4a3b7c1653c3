//! The residual predicate filter, applied to fetched documents.

use crate::obj;
use crate::query::CompOp;
use crate::query::WhereClause;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Default)]
pub struct Filter {
	clauses: Vec<WhereClause>,
	exclude_tombstones: bool,
}

impl Filter {
	pub fn new(clauses: Vec<WhereClause>, exclude_tombstones: bool) -> Filter {
		Filter {
			clauses,
			exclude_tombstones,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.clauses.is_empty() && !self.exclude_tombstones
	}

	/// Whether a document passes every residual predicate.
	pub fn test(&self, doc: &Value) -> bool {
		if self.exclude_tombstones && obj::is_tombstone(doc) {
			return false;
		}
		self.clauses.iter().all(|clause| test_clause(clause, doc))
	}
}

fn test_clause(clause: &WhereClause, doc: &Value) -> bool {
	let vals = obj::path_vals(doc, &clause.prop);
	// flatten one array level so predicates see elements
	let mut flat: Vec<&Value> = Vec::with_capacity(vals.len());
	for val in vals {
		match val {
			Value::Array(items) => flat.extend(items.iter()),
			other => flat.push(other),
		}
	}
	match clause.op {
		CompOp::Eq => flat.iter().any(|v| obj::cmp_vals(v, &clause.val) == Ordering::Equal),
		// not-equals excludes the document when any value matches
		CompOp::Ne => !flat.iter().any(|v| obj::cmp_vals(v, &clause.val) == Ordering::Equal),
		CompOp::Lt => flat.iter().any(|v| obj::cmp_vals(v, &clause.val) == Ordering::Less),
		CompOp::Le => flat.iter().any(|v| obj::cmp_vals(v, &clause.val) != Ordering::Greater),
		CompOp::Gt => flat.iter().any(|v| obj::cmp_vals(v, &clause.val) == Ordering::Greater),
		CompOp::Ge => flat.iter().any(|v| obj::cmp_vals(v, &clause.val) != Ordering::Less),
		CompOp::Prefix => {
			let prefix = clause.val.as_str().unwrap_or_default();
			flat.iter().any(|v| v.as_str().is_some_and(|s| s.starts_with(prefix)))
		}
		CompOp::In | CompOp::ContainsAny => {
			let members = clause.val.as_array().cloned().unwrap_or_default();
			flat.iter().any(|v| members.iter().any(|m| obj::cmp_vals(v, m) == Ordering::Equal))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn clause(prop: &str, op: CompOp, val: Value) -> WhereClause {
		WhereClause {
			prop: prop.to_string(),
			op,
			val,
			collation: None,
		}
	}

	#[test]
	fn scalar_predicates() {
		let doc = json!({"age": 40, "name": "kim"});
		assert!(Filter::new(vec![clause("age", CompOp::Gt, json!(30))], false).test(&doc));
		assert!(!Filter::new(vec![clause("age", CompOp::Lt, json!(30))], false).test(&doc));
		assert!(Filter::new(vec![clause("name", CompOp::Prefix, json!("k"))], false).test(&doc));
		assert!(Filter::new(vec![clause("name", CompOp::Ne, json!("lee"))], false).test(&doc));
		assert!(!Filter::new(vec![clause("name", CompOp::Ne, json!("kim"))], false).test(&doc));
	}

	#[test]
	fn array_membership() {
		let doc = json!({"tags": ["a", "b"]});
		assert!(Filter::new(vec![clause("tags", CompOp::Eq, json!("a"))], false).test(&doc));
		assert!(Filter::new(vec![clause("tags", CompOp::ContainsAny, json!(["b", "z"]))], false).test(&doc));
		assert!(!Filter::new(vec![clause("tags", CompOp::ContainsAny, json!(["x", "z"]))], false).test(&doc));
	}

	#[test]
	fn tombstones_are_dropped() {
		let doc = json!({"x": 1, "_del": true});
		assert!(!Filter::new(Vec::new(), true).test(&doc));
		assert!(Filter::new(Vec::new(), false).test(&doc));
	}

	#[test]
	fn missing_prop_fails_most_predicates() {
		let doc = json!({"other": 1});
		assert!(!Filter::new(vec![clause("age", CompOp::Gt, json!(0))], false).test(&doc));
		// but not-equals passes vacuously
		assert!(Filter::new(vec![clause("age", CompOp::Ne, json!(1))], false).test(&doc));
	}
}
